//! `tetherd`: the tether remote-development backend daemon.
//!
//! Configuration comes from the environment:
//!
//! | Variable                  | Meaning                                | Default |
//! |---------------------------|----------------------------------------|---------|
//! | `TETHER_PORT`             | Listening port                         | 9090    |
//! | `TETHER_KEY`              | TLS private key path                   | unset   |
//! | `TETHER_CERT`             | TLS certificate path                   | unset   |
//! | `TETHER_CA`               | CA bundle; enables client-cert auth    | unset   |
//! | `TETHER_RPC_TIMEOUT_MS`   | Reply window in milliseconds           | 30000   |
//! | `TETHER_TRACK_EVENT_LOOP` | Spawn the runtime lag watchdog         | false   |
//! | `TETHER_SCHEMA`           | Path to the consumed service schema    | unset   |
//!
//! Exits 0 on clean shutdown (ctrl-c), 1 on fatal error.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tether_server::{Server, ServerConfig, TlsConfig};
use tether_wire::ServiceSchema;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        error!("fatal: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = config_from_env()?;
    let schema = load_schema()?;

    let server = Server::builder().config(config).schema(schema).build()?;
    let bound = server.bind().await?;
    info!("tetherd {} listening on {}", env!("CARGO_PKG_VERSION"), bound.local_addr());

    bound
        .serve_with_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("clean shutdown");
    Ok(())
}

fn config_from_env() -> Result<ServerConfig, Box<dyn std::error::Error>> {
    let mut config = ServerConfig::default();

    if let Ok(port) = std::env::var("TETHER_PORT") {
        config.bind_address.set_port(port.parse()?);
    }
    if let Ok(ms) = std::env::var("TETHER_RPC_TIMEOUT_MS") {
        config.rpc_timeout = Duration::from_millis(ms.parse()?);
    }
    config.track_event_loop = std::env::var("TETHER_TRACK_EVENT_LOOP")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let key = std::env::var_os("TETHER_KEY").map(PathBuf::from);
    let cert = std::env::var_os("TETHER_CERT").map(PathBuf::from);
    let ca = std::env::var_os("TETHER_CA").map(PathBuf::from);
    config.tls = match (key, cert) {
        (Some(key), Some(cert)) => Some(TlsConfig { key, cert, ca }),
        (None, None) => None,
        _ => return Err("TETHER_KEY and TETHER_CERT must be set together".into()),
    };

    Ok(config)
}

fn load_schema() -> Result<ServiceSchema, Box<dyn std::error::Error>> {
    match std::env::var_os("TETHER_SCHEMA") {
        Some(path) => {
            let text = std::fs::read_to_string(&path)?;
            Ok(ServiceSchema::from_json(&text)?)
        }
        None => {
            warn!("TETHER_SCHEMA not set; serving an empty schema");
            Ok(ServiceSchema::default())
        }
    }
}
