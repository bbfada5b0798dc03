//! Public interface to the paxoslog core library, linked by both server and
//! client executables.

#[macro_use]
mod utils;

mod transport;

pub mod client;
pub mod message;
pub mod server;

// Helper utilities
pub use crate::utils::{logger_init, Bitmap, PaxosLogError, RetryTimer, Timer};

// Wire message types
pub use crate::message::{
    Ballot, ChatMessageId, ClientId, PaxosMsg, ReplicaId, SeqNum, SlotIdx,
};

// Server side
pub use crate::server::{PaxosLogReplica, ReplicaConfig, ReplicaSnapshot};

// Client side
pub use crate::client::{ClientConfig, PaxosLogClient};
