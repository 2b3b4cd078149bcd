use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the tether server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to. The single port serves both the HTTP plane and
    /// WebSocket upgrades.
    pub bind_address: SocketAddr,

    /// Optional TLS material. When present the listener serves TLS; when a
    /// CA bundle is also present, client certificates are required and
    /// verified.
    pub tls: Option<TlsConfig>,

    /// Advertised reply window. The server uses it to bound the client-id
    /// handshake wait on freshly upgraded sockets.
    pub rpc_timeout: Duration,

    /// How long a client session may sit without an attached socket before
    /// its objects and subscriptions are garbage-collected.
    pub session_idle_timeout: Duration,

    /// Cadence of the idle-session sweep.
    pub sweep_interval: Duration,

    /// Cap on frames queued per client while no socket is attached. Producers
    /// that overflow it fail with a backpressure error.
    pub max_outbound_queue: usize,

    /// Spawn the runtime lag watchdog.
    pub track_event_loop: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:9090".parse().unwrap(),
            tls: None,
            rpc_timeout: Duration::from_secs(30),
            session_idle_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(30),
            max_outbound_queue: 1024,
            track_event_loop: false,
        }
    }
}

/// TLS key material locations.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub key: PathBuf,
    pub cert: PathBuf,
    /// CA bundle for client-certificate verification; absent means no client
    /// auth.
    pub ca: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address.port(), 9090);
        assert!(config.tls.is_none());
        assert_eq!(config.session_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_outbound_queue, 1024);
        assert!(!config.track_event_loop);
    }
}
