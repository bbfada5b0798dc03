//! Replica main loop: owns the slot store, the durable log, the transport
//! hubs and the view tracker, and dispatches every inbound message to the
//! acceptor or proposer role.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use crate::message::{
    check_payload, Ballot, ChatMessageId, ClientId, PaxosMsg, ReplicaId,
    SeqNum, SlotIdx,
};
use crate::server::acceptor;
use crate::server::proposer::{ChatRequest, Effect, Proposer, RetryKey};
use crate::server::slots::LogSlotStore;
use crate::server::storage::StorageHub;
use crate::server::view::{ViewStatus, ViewTracker};
use crate::server::{ballot_owner, ReplicaConfig};
use crate::transport::{InboundHub, LinkHub};
use crate::utils::{PaxosLogError, RetryTimer};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Externally observable replica state, republished whenever it changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub view: u64,
    pub is_leader: bool,
    pub first_unchosen: SlotIdx,

    /// Chosen `(slot, value)` pairs in slot order.
    pub chosen: Vec<(SlotIdx, String)>,
}

/// Multi-Paxos log replica.
pub struct PaxosLogReplica {
    /// My replica ID.
    id: ReplicaId,

    /// Total number of replicas.
    population: u8,

    /// Listening addresses of all replicas, indexed by ID.
    roster: Vec<SocketAddr>,

    /// Inbound listener for peers and clients alike.
    inbound: InboundHub,

    /// Outbound links to peer replicas, shared with the heartbeater.
    peers: Arc<LinkHub<ReplicaId>>,

    /// Outbound links to clients.
    clients: LinkHub<ClientId>,

    /// Reply addresses of clients that said Hello.
    client_addrs: HashMap<ClientId, SocketAddr>,

    /// View tracker and the receiver of its status channel.
    tracker: Arc<ViewTracker>,
    rx_status: watch::Receiver<ViewStatus>,

    /// Status last acted upon.
    status: ViewStatus,

    /// In-memory log slots.
    store: LogSlotStore,

    /// Durable chosen-value log.
    storage_hub: StorageHub,

    /// Proposer role.
    proposer: Proposer,

    /// Chat requests waiting for the proposer.
    chat_queue: VecDeque<ChatRequest>,

    /// Retransmission timer of the proposer's current phase.
    retry_timer: RetryTimer<RetryKey>,

    /// Sender side of the snapshot channel.
    tx_snapshot: watch::Sender<ReplicaSnapshot>,

    /// Join handles of the view monitor and heartbeater threads.
    monitor_handle: JoinHandle<()>,
    heartbeater_handle: JoinHandle<()>,
}

// PaxosLogReplica public API implementation
impl PaxosLogReplica {
    /// Creates a new replica with ID `id` among the replicas listening on
    /// `roster`, applying config overrides from TOML `config_str`. Binds the
    /// listening socket, creates the durable log file, and spawns the view
    /// monitor and heartbeater threads.
    pub async fn new_and_setup(
        id: ReplicaId,
        roster: Vec<SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<Self, PaxosLogError> {
        let config = parsed_config!(config_str => ReplicaConfig;
                                    hb_period_ms, hb_tolerance, retry_interval_ms,
                                    msg_loss_rate, skip_slot, backer_dir,
                                    initial_view)?;
        if roster.is_empty() || roster.len() > u8::MAX as usize {
            return logged_err!(id; "invalid roster size {}", roster.len());
        }
        let population = roster.len() as u8;
        if id >= population {
            return logged_err!(id; "invalid replica ID {} / {}", id, population);
        }
        let skip_slot =
            (config.skip_slot >= 0).then_some(config.skip_slot as SlotIdx);

        let inbound =
            InboundHub::new_and_setup(id, roster[id as usize]).await?;

        tokio::fs::create_dir_all(&config.backer_dir).await?;
        let backer_path = Path::new(&config.backer_dir)
            .join(format!("replica{}.log", id));
        let storage_hub = StorageHub::new_and_setup(id, &backer_path).await?;

        let peers = Arc::new(LinkHub::new(id, config.msg_loss_rate)?);
        let clients = LinkHub::new(id, config.msg_loss_rate)?;
        let retry_timer =
            RetryTimer::new(Duration::from_millis(config.retry_interval_ms))?;

        let (tracker, rx_status) = ViewTracker::new_and_setup(
            id,
            population,
            Duration::from_millis(config.hb_period_ms),
            config.hb_tolerance,
            config.initial_view,
        )?;
        let status = tracker.status();
        let monitor_handle = tracker.spawn_monitor();
        let heartbeater_handle =
            tracker.spawn_heartbeater(peers.clone(), roster.clone());

        let mut store = LogSlotStore::new(skip_slot);
        store.set_leader(status.is_leader);

        let (tx_snapshot, _) = watch::channel(ReplicaSnapshot {
            view: status.view,
            is_leader: status.is_leader,
            ..Default::default()
        });

        pf_info!(
            id;
            "replica set up among {} in view {} leader {}",
            population,
            status.view,
            status.leader
        );
        Ok(PaxosLogReplica {
            id,
            population,
            roster,
            inbound,
            peers,
            clients,
            client_addrs: HashMap::new(),
            tracker,
            rx_status,
            status,
            store,
            storage_hub,
            proposer: Proposer::new(id, population),
            chat_queue: VecDeque::new(),
            retry_timer,
            tx_snapshot,
            monitor_handle,
            heartbeater_handle,
        })
    }

    /// My replica ID.
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Bound listening address.
    pub fn local_addr(&self) -> SocketAddr {
        self.inbound.local_addr()
    }

    /// Subscribes to state snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ReplicaSnapshot> {
        self.tx_snapshot.subscribe()
    }

    /// Main event loop. Returns `Ok(())` upon termination signal, or an error
    /// on a fatal condition such as an undecodable frame.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), PaxosLogError> {
        self.publish_snapshot();

        loop {
            tokio::select! {
                // message from peer or client
                msg = self.inbound.recv_msg() => {
                    let msg = msg?;
                    if let Err(e) = self.handle_msg_recv(msg) {
                        pf_error!(self.id; "error handling msg: {}", e);
                    }
                },

                // view or leadership change
                changed = self.rx_status.changed() => {
                    if changed.is_err() {
                        return logged_err!(self.id; "status channel has been closed");
                    }
                    let status = *self.rx_status.borrow_and_update();
                    if let Err(e) = self.handle_view_change(status) {
                        pf_error!(self.id; "error handling view change: {}", e);
                    }
                },

                // retransmission of an incomplete phase
                key = self.retry_timer.fired() => {
                    if let Err(e) = self.handle_retry(key) {
                        pf_error!(self.id; "error retransmitting: {}", e);
                    }
                },

                // durable logging result
                log_result = self.storage_hub.get_result() => {
                    let (slot, log_result) = log_result?;
                    pf_trace!(self.id; "logged slot {}: {:?}", slot, log_result);
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "replica caught termination signal");
                    return Ok(());
                }
            }

            self.publish_snapshot();
        }
    }
}

// PaxosLogReplica message handlers
impl PaxosLogReplica {
    fn handle_msg_recv(&mut self, msg: PaxosMsg) -> Result<(), PaxosLogError> {
        match msg {
            PaxosMsg::Hello { client, addr } => self.handle_hello(client, addr),
            PaxosMsg::Chat {
                client,
                seq,
                payload,
            } => self.handle_chat(client, seq, payload),
            PaxosMsg::HeartBeat { view, .. } => {
                self.tracker.heard_heartbeat(view)
            }

            PaxosMsg::Prepare {
                round,
                slot,
                client,
                seq,
            } => {
                self.proposer.observe_round(round);
                if self.status.is_leader {
                    return Ok(());
                }
                match acceptor::on_prepare(
                    &mut self.store,
                    self.id,
                    round,
                    slot,
                    client,
                    seq,
                ) {
                    Some(reply) => self.reply_to_proposer(round, &reply),
                    None => Ok(()),
                }
            }

            PaxosMsg::Accept {
                round,
                slot,
                first_unchosen,
                client,
                seq,
                value,
            } => {
                self.proposer.observe_round(round);
                if self.status.is_leader {
                    return Ok(());
                }
                let reply = acceptor::on_accept(
                    &mut self.store,
                    self.id,
                    round,
                    slot,
                    first_unchosen,
                    client,
                    seq,
                    &value,
                );
                self.persist()?;
                match reply {
                    Some(reply) => self.reply_to_proposer(round, &reply),
                    None => Ok(()),
                }
            }

            PaxosMsg::Success { slot, value } => {
                let (changed, reply) =
                    acceptor::on_success(&mut self.store, self.id, slot, &value);
                if changed {
                    pf_debug!(self.id; "learned slot {}", slot);
                    self.persist()?;
                }
                if self.status.leader != self.id {
                    self.send_peer(self.status.leader, &reply)?;
                }
                Ok(())
            }

            PaxosMsg::PrepareReply { .. } => {
                if !self.status.is_leader {
                    return Ok(());
                }
                let effects =
                    self.proposer.handle_prepare_reply(&mut self.store, msg)?;
                self.apply_effects(effects)?;
                self.start_queued()
            }

            PaxosMsg::AcceptReply { .. } => {
                if !self.status.is_leader {
                    return Ok(());
                }
                let effects =
                    self.proposer.handle_accept_reply(&mut self.store, msg)?;
                self.apply_effects(effects)?;
                self.start_queued()
            }

            PaxosMsg::SuccessReply { .. } => {
                if !self.status.is_leader {
                    return Ok(());
                }
                let effects =
                    self.proposer.handle_success_reply(&self.store, msg)?;
                self.apply_effects(effects)
            }

            PaxosMsg::Ack | PaxosMsg::Nack { .. } | PaxosMsg::Response { .. } => {
                pf_warn!(self.id; "unexpected client-bound {} received", msg.kind());
                Ok(())
            }
        }
    }

    /// Records the client's reply address and tells it whether I lead.
    fn handle_hello(
        &mut self,
        client: ClientId,
        addr: SocketAddr,
    ) -> Result<(), PaxosLogError> {
        self.client_addrs.insert(client, addr);
        let reply = if self.status.is_leader {
            PaxosMsg::Ack
        } else {
            PaxosMsg::Nack {
                leader: self.status.leader,
            }
        };
        pf_debug!(self.id; "hello from client {} -> {}", client, reply.kind());
        self.send_client(client, &reply)
    }

    /// Queues a chat request, or redirects it if I do not lead.
    fn handle_chat(
        &mut self,
        client: ClientId,
        seq: SeqNum,
        payload: String,
    ) -> Result<(), PaxosLogError> {
        if let Err(e) = check_payload(&payload) {
            pf_warn!(self.id; "dropping chat ({}, {}): {}", client, seq, e);
            return Ok(());
        }
        if !self.status.is_leader {
            return self.send_client(
                client,
                &PaxosMsg::Nack {
                    leader: self.status.leader,
                },
            );
        }

        let id = ChatMessageId::new(client, seq);
        if self.store.is_request_chosen(&id) {
            return self.send_client(client, &PaxosMsg::Response { seq });
        }
        if self.proposer.in_flight().is_some_and(|r| r.id == id)
            || self.chat_queue.iter().any(|r| r.id == id)
        {
            pf_trace!(self.id; "duplicate chat {:?}", id);
            return Ok(());
        }

        self.chat_queue.push_back(ChatRequest { id, payload });
        self.start_queued()
    }

    /// Reacts to a published view status.
    fn handle_view_change(
        &mut self,
        status: ViewStatus,
    ) -> Result<(), PaxosLogError> {
        let was_leader = self.status.is_leader;
        self.status = status;
        self.store.set_leader(status.is_leader);

        if was_leader && !status.is_leader {
            pf_info!(
                self.id;
                "no longer leading in view {}, leader {}",
                status.view,
                status.leader
            );
            self.retry_timer.disarm();
            let mut dropped: Vec<ChatRequest> =
                self.proposer.abort().into_iter().collect();
            dropped.extend(self.chat_queue.drain(..));
            for request in dropped {
                self.send_client(
                    request.id.client,
                    &PaxosMsg::Nack {
                        leader: status.leader,
                    },
                )?;
            }
        } else if !was_leader && status.is_leader {
            pf_info!(self.id; "leading in view {}", status.view);
            self.proposer.abort();
            self.start_queued()?;
        }
        Ok(())
    }

    /// Retransmits the guarded phase if it is still incomplete.
    fn handle_retry(&mut self, key: RetryKey) -> Result<(), PaxosLogError> {
        let msg = if self.status.is_leader {
            self.proposer.retry(&self.store, &key)
        } else {
            None
        };
        self.retry_timer.reschedule_if(msg.is_some())?;
        if let Some(ref msg) = msg {
            pf_debug!(self.id; "retransmitting {} for slot {}", msg.kind(), key.slot);
            self.broadcast(msg)?;
        }
        Ok(())
    }
}

// PaxosLogReplica internal helpers
impl PaxosLogReplica {
    /// Feeds queued requests to the proposer while it is idle.
    fn start_queued(&mut self) -> Result<(), PaxosLogError> {
        while self.status.is_leader && !self.proposer.is_busy() {
            let Some(request) = self.chat_queue.pop_front() else {
                break;
            };
            let effects = self.proposer.propose(&mut self.store, request)?;
            self.apply_effects(effects)?;
        }
        Ok(())
    }

    /// Carries out the effects requested by the proposer.
    fn apply_effects(
        &mut self,
        effects: Vec<Effect>,
    ) -> Result<(), PaxosLogError> {
        for effect in effects {
            match effect {
                Effect::Broadcast(msg) => self.broadcast(&msg)?,
                Effect::Send(peer, msg) => self.send_peer(peer, &msg)?,
                Effect::Respond(client, msg) => self.send_client(client, &msg)?,
                Effect::ArmRetry(key) => self.retry_timer.arm(key)?,
                Effect::Chosen(slot) => {
                    pf_info!(self.id; "slot {} chosen", slot);
                    self.persist()?;
                }
            }
        }
        Ok(())
    }

    /// Flushes newly executable chosen slots to the durable log.
    fn persist(&mut self) -> Result<(), PaxosLogError> {
        let written = self.store.write(&mut self.storage_hub)?;
        if written > 0 {
            pf_trace!(self.id; "submitted {} slots to durable log", written);
        }
        Ok(())
    }

    /// Routes an acceptor reply to the replica that composed `round`,
    /// falling back to the current leader.
    fn reply_to_proposer(
        &mut self,
        round: Ballot,
        reply: &PaxosMsg,
    ) -> Result<(), PaxosLogError> {
        let target = ballot_owner(round)
            .filter(|&p| p < self.population)
            .unwrap_or(self.status.leader);
        if target == self.id {
            return Ok(());
        }
        self.send_peer(target, reply)
    }

    fn send_peer(
        &self,
        peer: ReplicaId,
        msg: &PaxosMsg,
    ) -> Result<(), PaxosLogError> {
        let Some(&addr) = self.roster.get(peer as usize) else {
            return logged_err!(self.id; "unknown replica {}", peer);
        };
        self.peers.send_lossy(peer, addr, msg)?;
        Ok(())
    }

    /// Sends to every other replica.
    fn broadcast(&self, msg: &PaxosMsg) -> Result<(), PaxosLogError> {
        for peer in (0..self.population).filter(|&p| p != self.id) {
            self.send_peer(peer, msg)?;
        }
        Ok(())
    }

    fn send_client(
        &self,
        client: ClientId,
        msg: &PaxosMsg,
    ) -> Result<(), PaxosLogError> {
        match self.client_addrs.get(&client) {
            Some(&addr) => {
                self.clients.send_lossy(client, addr, msg)?;
            }
            None => {
                pf_warn!(self.id; "no address known for client {}", client);
            }
        }
        Ok(())
    }

    fn publish_snapshot(&self) {
        let snapshot = ReplicaSnapshot {
            view: self.status.view,
            is_leader: self.status.is_leader,
            first_unchosen: self.store.first_unchosen_index(),
            chosen: self.store.chosen_entries(),
        };
        self.tx_snapshot.send_if_modified(|s| {
            if *s != snapshot {
                *s = snapshot;
                true
            } else {
                false
            }
        });
    }
}

impl Drop for PaxosLogReplica {
    fn drop(&mut self) {
        self.monitor_handle.abort();
        self.heartbeater_handle.abort();
    }
}

#[cfg(test)]
mod replica_tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time;

    const SHORT_TIMERS: &str = "hb_period_ms = 50\nretry_interval_ms = 100\n\
                                backer_dir = '/tmp/test-paxoslog-replica'";

    async fn recv_within(
        inbound: &mut InboundHub,
    ) -> Result<PaxosMsg, PaxosLogError> {
        time::timeout(Duration::from_secs(5), inbound.recv_msg())
            .await
            .map_err(|e| PaxosLogError::msg(e.to_string()))?
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn invalid_setup() {
        let roster = vec!["127.0.0.1:53731".parse().unwrap()];
        assert!(PaxosLogReplica::new_and_setup(1, roster.clone(), None)
            .await
            .is_err());
        assert!(PaxosLogReplica::new_and_setup(0, vec![], None).await.is_err());
        assert!(PaxosLogReplica::new_and_setup(0, roster, Some("nope = 1"))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_replica_chat() -> Result<(), PaxosLogError> {
        let roster: Vec<SocketAddr> = vec!["127.0.0.1:53732".parse()?];
        let mut replica =
            PaxosLogReplica::new_and_setup(0, roster, Some(SHORT_TIMERS))
                .await?;
        let mut rx_snapshot = replica.subscribe();
        let (tx_term, rx_term) = watch::channel(false);
        let handle = tokio::spawn(async move { replica.run(rx_term).await });

        let mut inbound =
            InboundHub::new_and_setup("c", "127.0.0.1:53733".parse()?).await?;
        let links: LinkHub<ReplicaId> = LinkHub::new("c", 0.0)?;
        let server: SocketAddr = "127.0.0.1:53732".parse()?;
        links.send_msg(
            0,
            server,
            &PaxosMsg::Hello {
                client: 5,
                addr: inbound.local_addr(),
            },
        )?;
        assert_eq!(recv_within(&mut inbound).await?, PaxosMsg::Ack);

        links.send_msg(
            0,
            server,
            &PaxosMsg::Chat {
                client: 5,
                seq: 0,
                payload: "Hi".into(),
            },
        )?;
        assert_eq!(
            recv_within(&mut inbound).await?,
            PaxosMsg::Response { seq: 0 }
        );

        // a retransmitted chat is answered without a new slot
        links.send_msg(
            0,
            server,
            &PaxosMsg::Chat {
                client: 5,
                seq: 0,
                payload: "Hi".into(),
            },
        )?;
        assert_eq!(
            recv_within(&mut inbound).await?,
            PaxosMsg::Response { seq: 0 }
        );

        // a payload that cannot travel on the wire is dropped; the next chat
        // on the same connection takes its sequence number
        let mut raw = TcpStream::connect(server).await?;
        raw.write_all(b"CLIENT_TO_SERVER:CHAT:5:1:|EMPTY_MESSAGE|\n").await?;
        raw.write_all(b"CLIENT_TO_SERVER:CHAT:5:1:ok\n").await?;
        raw.flush().await?;
        assert_eq!(
            recv_within(&mut inbound).await?,
            PaxosMsg::Response { seq: 1 }
        );

        let snapshot = time::timeout(
            Duration::from_secs(5),
            rx_snapshot.wait_for(|s| s.chosen.len() >= 2),
        )
        .await
        .map_err(|e| PaxosLogError::msg(e.to_string()))?
        .map_err(|e| PaxosLogError::msg(e.to_string()))?
        .clone();
        assert_eq!(
            snapshot.chosen,
            vec![(0, "Hi".to_string()), (1, "ok".to_string())]
        );
        assert!(snapshot.is_leader);

        tx_term.send(true)?;
        handle.await??;
        Ok(())
    }
}
