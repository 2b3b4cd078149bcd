//! Error types for caller-side operations

use std::time::Duration;

use thiserror::Error;

use tether_wire::{RegistryError, WireError};

/// Result type for caller-side operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Everything a caller can observe going wrong.
///
/// Errors local to one request never affect other requests or the
/// connection; `Closed` and `Transport` are the connection-scoped cases.
#[derive(Error, Debug, Clone)]
pub enum ClientError {
    /// No reply arrived within the configured window. The pending entry is
    /// removed; a late reply is dropped with a warning.
    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    /// The dispatcher or socket session was shut down while the call was
    /// pending.
    #[error("dispatcher closed")]
    Closed,

    /// The remote side reported an error for this request.
    #[error("remote error: {0}")]
    Remote(WireError),

    /// Local guard: the proxy was already disposed.
    #[error("object is disposed")]
    ObjectDisposed,

    /// The outbound queue cap was exceeded.
    #[error("outbound queue full ({0} frames)")]
    Backpressure(usize),

    /// Socket-level failure not covered by reconnect.
    #[error("transport failure: {0}")]
    Transport(String),

    /// The schema does not declare this function.
    #[error("unknown function {0:?}")]
    UnknownFunction(String),

    /// The schema does not declare this interface.
    #[error("unknown interface {0:?}")]
    UnknownInterface(String),

    /// The schema does not declare this method on the interface.
    #[error("unknown method {interface}.{method}")]
    UnknownMethod { interface: String, method: String },

    /// The call was issued with a different shape than the schema declares.
    #[error("{target:?} is declared {declared}, called as {requested}")]
    ShapeMismatch {
        target: String,
        declared: &'static str,
        requested: &'static str,
    },

    /// Marshal/unmarshal failure in the type registry.
    #[error("marshal error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration problem detected before any frame was sent.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ClientError {
    /// Remote errors keep their wire payload; everything else is local.
    pub fn remote(&self) -> Option<&WireError> {
        match self {
            ClientError::Remote(err) => Some(err),
            _ => None,
        }
    }
}
