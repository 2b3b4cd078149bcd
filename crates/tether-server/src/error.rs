use std::net::SocketAddr;

use thiserror::Error;

/// Result type for server operations
pub type ServerResult<T> = Result<T, ServerError>;

/// Fatal, process-level failures. Per-request failures never surface here;
/// they travel back to the requesting client as remote errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("schema error: {0}")]
    Schema(#[from] tether_wire::SchemaError),

    #[error("type registry error: {0}")]
    Registry(#[from] tether_wire::RegistryError),
}
