//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::net;
use std::num;
use std::string;

/// Customized error type for PaxosLog.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct PaxosLogError(String);

impl PaxosLogError {
    pub fn msg(msg: impl ToString) -> Self {
        PaxosLogError(msg.to_string())
    }
}

impl fmt::Display for PaxosLogError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

impl error::Error for PaxosLogError {}

// `impl From<X>` keeping only the source error's message.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for PaxosLogError {
            fn from(e: $error) -> Self {
                PaxosLogError(e.to_string())
            }
        }
    };
}

// Same, for error types generic over a payload.
macro_rules! impl_from_error_generic {
    ($error:ty) => {
        impl<T> From<$error> for PaxosLogError {
            fn from(e: $error) -> PaxosLogError {
                PaxosLogError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(string::FromUtf8Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(net::AddrParseError);
impl_from_error!(toml::de::Error);
impl_from_error!(ctrlc::Error);
impl_from_error!(tokio::task::JoinError);

impl_from_error_generic!(tokio::sync::watch::error::SendError<T>);
impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T>);
