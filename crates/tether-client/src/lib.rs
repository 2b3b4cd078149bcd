//! # Tether Client
//!
//! Caller side of the tether RPC transport: a reconnecting socket session, a
//! dispatcher that correlates replies by request id, remote-object proxies,
//! and server-streamed subscriptions.
//!
//! ```rust,ignore
//! let schema = Arc::new(ServiceSchema::from_json(schema_json)?);
//! let mut registry = TypeRegistry::new();
//! registry.register_schema_types(&schema)?;
//!
//! let dispatcher = ClientDispatcher::connect(
//!     ClientConfig::new("ws://127.0.0.1:9090"),
//!     schema,
//!     Arc::new(registry),
//! )?;
//!
//! let sum = dispatcher.call("add", vec![json!(2), json!(3)]).await?;
//! let session = dispatcher.create_object("Session", vec![])?;
//! session.call_void("rename", vec![json!("scratch")]).await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod proxy;
pub mod socket;
pub mod subscription;

pub use config::ClientConfig;
pub use dispatcher::ClientDispatcher;
pub use error::{ClientError, ClientResult};
pub use proxy::RemoteProxy;
pub use socket::SocketSession;
pub use subscription::Subscription;
