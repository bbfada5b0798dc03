//! Server replica: Multi-Paxos acceptor and proposer roles over a shared log
//! slot store, view-based leadership, and a durable chosen-value log.

mod acceptor;
mod proposer;
mod replica;
mod slots;
mod storage;
mod view;

use crate::message::{Ballot, ReplicaId};

use serde::Deserialize;

pub use acceptor::ANONYMOUS_CLIENT;
pub use replica::{PaxosLogReplica, ReplicaSnapshot};
pub use slots::{LogEntry, LogSink, LogSlotStore};
pub use storage::{LogAction, LogActionId, LogResult, StorageHub};
pub use view::ViewStatus;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    /// Interval of leader sending heartbeats in millisecs.
    pub hb_period_ms: u64,

    /// Number of heartbeat periods of silence tolerated before moving to
    /// the next view.
    pub hb_tolerance: u32,

    /// Retransmission interval of an incomplete Prepare or Accept phase in
    /// millisecs.
    pub retry_interval_ms: u64,

    /// Probability in [0, 1) that an outgoing protocol message is dropped.
    pub msg_loss_rate: f64,

    /// Log slot the leader never fills; negative means none.
    pub skip_slot: i64,

    /// Directory holding the per-replica durable log files.
    pub backer_dir: String,

    /// View number to start in.
    pub initial_view: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            hb_period_ms: 2000,
            hb_tolerance: 5,
            retry_interval_ms: 20000,
            msg_loss_rate: 0.0,
            skip_slot: -1,
            backer_dir: "/tmp".into(),
            initial_view: 0,
        }
    }
}

/// Composes a unique ballot number from base.
#[inline]
pub fn make_unique_ballot(base: u64, id: ReplicaId) -> Ballot {
    ((base << 8) | (id as u64 + 1)) as Ballot
}

/// Composes a unique ballot number greater than the given one.
#[inline]
pub fn make_greater_ballot(bal: Ballot, id: ReplicaId) -> Ballot {
    make_unique_ballot((bal >> 8) + 1, id)
}

/// Replica that composed given ballot, `None` for the null ballot.
#[inline]
pub fn ballot_owner(bal: Ballot) -> Option<ReplicaId> {
    ((bal & 0xff) as u8).checked_sub(1)
}
