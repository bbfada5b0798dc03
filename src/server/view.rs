//! View and leadership tracking: heartbeat hearing, heartbeat-timeout driven
//! view increments, and periodic heartbeat emission while leading.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::message::{PaxosMsg, ReplicaId};
use crate::transport::LinkHub;
use crate::utils::PaxosLogError;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Leadership facts published to the replica main loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewStatus {
    /// Current view number.
    pub view: u64,

    /// Leader of the current view.
    pub leader: ReplicaId,

    /// Whether this replica believes it leads.
    pub is_leader: bool,
}

/// Mutable tracker state, guarded by the tracker's mutex.
#[derive(Debug)]
struct ViewState {
    view: u64,
    is_leader: bool,
    last_heard: Instant,
}

/// The view tracker. Every state change funnels through its mutex and is
/// published on a watch channel.
#[derive(Debug)]
pub(crate) struct ViewTracker {
    /// My replica ID.
    me: ReplicaId,

    /// Total number of replicas in the cluster.
    population: u8,

    /// Heartbeat sending period.
    hb_period: Duration,

    /// Silence longer than this triggers a view increment.
    hb_timeout: Duration,

    /// Tracker state.
    state: Mutex<ViewState>,

    /// Sender side of the status channel.
    tx_status: watch::Sender<ViewStatus>,
}

impl ViewTracker {
    /// Creates a new view tracker starting at `initial_view`. Returns it with
    /// the receiver side of its status channel.
    pub(crate) fn new_and_setup(
        me: ReplicaId,
        population: u8,
        hb_period: Duration,
        hb_tolerance: u32,
        initial_view: u64,
    ) -> Result<(Arc<Self>, watch::Receiver<ViewStatus>), PaxosLogError> {
        if population == 0 || me >= population {
            return logged_err!(me; "invalid population {}", population);
        }
        if hb_period < Duration::from_millis(1) {
            return logged_err!(me; "invalid heartbeat period {:?}", hb_period);
        }
        if hb_tolerance < 2 {
            return logged_err!(
                me;
                "invalid heartbeat tolerance {}",
                hb_tolerance
            );
        }

        let leader = (initial_view % population as u64) as ReplicaId;
        let status = ViewStatus {
            view: initial_view,
            leader,
            is_leader: leader == me,
        };
        let (tx_status, rx_status) = watch::channel(status);

        let tracker = ViewTracker {
            me,
            population,
            hb_period,
            hb_timeout: hb_period * hb_tolerance,
            state: Mutex::new(ViewState {
                view: initial_view,
                is_leader: leader == me,
                last_heard: Instant::now(),
            }),
            tx_status,
        };
        Ok((Arc::new(tracker), rx_status))
    }

    /// Leader of given view.
    #[inline]
    pub(crate) fn leader_of(&self, view: u64) -> ReplicaId {
        (view % self.population as u64) as ReplicaId
    }

    /// Latest published status.
    pub(crate) fn status(&self) -> ViewStatus {
        *self.tx_status.borrow()
    }

    /// Called upon hearing a heartbeat carrying view `view`: adopts it if
    /// higher and resets the silence clock.
    pub(crate) fn heard_heartbeat(
        &self,
        view: u64,
    ) -> Result<(), PaxosLogError> {
        let mut state = self.lock_state()?;
        state.last_heard = Instant::now();
        if view > state.view {
            pf_debug!(self.me; "view {} -> {} via heartbeat", state.view, view);
            state.view = view;
            self.publish(&state);
        }
        Ok(())
    }

    /// Checks for heartbeat silence as of `now`. On timeout, increments the
    /// view, claims leadership if the new view maps to me, and resets the
    /// silence clock. Returns true if a timeout happened.
    pub(crate) fn check_timeout(
        &self,
        now: Instant,
    ) -> Result<bool, PaxosLogError> {
        let mut state = self.lock_state()?;
        if now.saturating_duration_since(state.last_heard) <= self.hb_timeout {
            return Ok(false);
        }

        state.view += 1;
        if self.leader_of(state.view) == self.me {
            state.is_leader = true;
        }
        state.last_heard = now;
        pf_info!(
            self.me;
            "heartbeat timeout, view -> {} leader {}",
            state.view,
            self.leader_of(state.view)
        );
        self.publish(&state);
        Ok(true)
    }

    /// Re-checks my leadership against the latest view, clearing the flag if
    /// the view no longer maps to me. Returns `Some(view)` if still leading.
    pub(crate) fn self_check(&self) -> Result<Option<u64>, PaxosLogError> {
        let mut state = self.lock_state()?;
        if !state.is_leader {
            return Ok(None);
        }
        if self.leader_of(state.view) != self.me {
            state.is_leader = false;
            pf_info!(self.me; "stepping down in view {}", state.view);
            self.publish(&state);
            return Ok(None);
        }
        Ok(Some(state.view))
    }

    /// Spawns the heartbeat-timeout monitor thread.
    pub(crate) fn spawn_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(Self::monitor_thread(self.clone()))
    }

    /// Spawns the heartbeat emitter thread, sending to every replica in
    /// `roster` (myself included) through `links`.
    pub(crate) fn spawn_heartbeater(
        self: &Arc<Self>,
        links: Arc<LinkHub<ReplicaId>>,
        roster: Vec<SocketAddr>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self::heartbeater_thread(self.clone(), links, roster))
    }
}

// ViewTracker internal helpers and threads
impl ViewTracker {
    fn lock_state(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, ViewState>, PaxosLogError> {
        self.state
            .lock()
            .map_err(|e| PaxosLogError::msg(e.to_string()))
    }

    /// Publishes the given state on the status channel.
    fn publish(&self, state: &ViewState) {
        let status = ViewStatus {
            view: state.view,
            leader: self.leader_of(state.view),
            is_leader: state.is_leader,
        };
        self.tx_status.send_if_modified(|s| {
            if *s != status {
                *s = status;
                true
            } else {
                false
            }
        });
    }

    /// Heartbeat-timeout monitor thread function.
    async fn monitor_thread(tracker: Arc<Self>) {
        pf_debug!(tracker.me; "monitor thread spawned");

        let check_period = (tracker.hb_period / 5).max(Duration::from_millis(1));
        let mut interval = time::interval(check_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            if let Err(e) = tracker.check_timeout(Instant::now()) {
                pf_error!(tracker.me; "error checking timeout: {}", e);
                break;
            }
        }

        pf_debug!(tracker.me; "monitor thread exitted");
    }

    /// Heartbeat emitter thread function.
    async fn heartbeater_thread(
        tracker: Arc<Self>,
        links: Arc<LinkHub<ReplicaId>>,
        roster: Vec<SocketAddr>,
    ) {
        pf_debug!(tracker.me; "heartbeater thread spawned");

        let mut interval = time::interval(tracker.hb_period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            interval.tick().await;
            let view = match tracker.self_check() {
                Ok(Some(view)) => view,
                Ok(None) => continue,
                Err(e) => {
                    pf_error!(tracker.me; "error self-checking: {}", e);
                    break;
                }
            };

            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_millis() as u64);
            let hb = PaxosMsg::HeartBeat { view, timestamp };
            for (peer, &addr) in roster.iter().enumerate() {
                if let Err(e) = links.send_msg(peer as ReplicaId, addr, &hb) {
                    pf_warn!(tracker.me; "error sending heartbeat to {}: {}", peer, e);
                }
            }
        }

        pf_debug!(tracker.me; "heartbeater thread exitted");
    }
}
