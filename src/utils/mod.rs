//! Helper utilities, functions, and macros.

#[macro_use]
mod print;

#[macro_use]
mod config;

mod bitmap;
mod error;
mod safetcp;
mod timer;

pub use bitmap::Bitmap;
pub use error::PaxosLogError;
pub use print::logger_init;
pub use timer::{RetryTimer, Timer};

pub(crate) use safetcp::{
    safe_tcp_read_line, tcp_bind_with_retry, tcp_connect_with_retry,
    tcp_write_line,
};
