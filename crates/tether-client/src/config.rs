//! Configuration types for the tether client

use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Client configuration.
///
/// The client identifier keys all per-client state on the server across
/// reconnects; reusing it is what makes the reconnect contract work.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint, e.g. `ws://127.0.0.1:9090`.
    pub endpoint: String,

    /// Opaque client identifier sent as the handshake frame.
    pub client_id: String,

    /// Per-call reply window for promise-shaped calls and the first frame of
    /// observable calls.
    pub rpc_timeout: Duration,

    /// Reconnect backoff, doubling from `initial` up to `max`.
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,

    /// Cap on frames held while no socket is attached.
    pub max_outbound_queue: usize,
}

impl ClientConfig {
    /// Configuration for `endpoint` with a fresh random client identifier.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client_id: uuid::Uuid::new_v4().to_string(),
            rpc_timeout: Duration::from_secs(30),
            reconnect_initial: Duration::from_millis(250),
            reconnect_max: Duration::from_secs(10),
            max_outbound_queue: 1024,
        }
    }

    /// Reuse a known client identifier (reconnect contract).
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub fn with_max_outbound_queue(mut self, cap: usize) -> Self {
        self.max_outbound_queue = cap;
        self
    }

    /// Validate the endpoint before any connection attempt.
    pub fn validate(&self) -> ClientResult<()> {
        let url = url::Url::parse(&self.endpoint)
            .map_err(|e| ClientError::Config(format!("invalid endpoint: {e}")))?;
        match url.scheme() {
            "ws" | "wss" => {}
            scheme => {
                return Err(ClientError::Config(format!(
                    "endpoint scheme must be ws or wss, got {scheme:?}"
                )))
            }
        }
        if self.client_id.is_empty() {
            return Err(ClientError::Config("client id must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ClientConfig::new("ws://127.0.0.1:9090");
        assert_eq!(config.rpc_timeout, Duration::from_secs(30));
        assert_eq!(config.max_outbound_queue, 1024);
        assert!(!config.client_id.is_empty());
        config.validate().unwrap();
    }

    #[test]
    fn test_fresh_ids_differ() {
        let a = ClientConfig::new("ws://localhost:1");
        let b = ClientConfig::new("ws://localhost:1");
        assert_ne!(a.client_id, b.client_id);
    }

    #[test]
    fn test_rejects_http_endpoint() {
        let config = ClientConfig::new("http://127.0.0.1:9090");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_empty_client_id() {
        let config = ClientConfig::new("ws://127.0.0.1:9090").with_client_id("");
        assert!(config.validate().is_err());
    }
}
