//! Client side: the session state machine and the networked endpoint
//! running it.

mod endpoint;
mod session;

pub use endpoint::{ClientConfig, PaxosLogClient};
