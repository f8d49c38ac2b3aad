//! Customized unified error type.

use std::fmt;
use std::io;

/// Customized error type for shardset. Carries the source error's message;
/// internal errors never cross the client RPC boundary (see `RpcErr`).
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ShardsetError(pub String);

impl ShardsetError {
    /// Creates an error from anything displayable.
    pub fn msg(m: impl fmt::Display) -> Self {
        ShardsetError(m.to_string())
    }
}

impl fmt::Display for ShardsetError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0) // do not display literal quotes
    }
}

// Saves boiler-plate `impl From<T>`s for transparent conversion from
// common source error types to `ShardsetError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for ShardsetError {
            fn from(e: $error) -> Self {
                ShardsetError(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(rmp_serde::encode::Error);
impl_from_error!(rmp_serde::decode::Error);
impl_from_error!(toml::ser::Error);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::sync::oneshot::error::RecvError);

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for ShardsetError {
    fn from(e: tokio::sync::mpsc::error::SendError<T>) -> Self {
        ShardsetError(e.to_string())
    }
}
