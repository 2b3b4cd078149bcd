//! # Tether Server
//!
//! Callee side of the tether RPC transport: a combined HTTP/WebSocket
//! listener, per-client sessions that survive socket churn, and a dispatcher
//! that routes frames to registered service handlers.
//!
//! ## Architecture
//!
//! ```text
//! TcpListener ──► hyper http1 ──► POST /heartbeat
//!                      │
//!                      └─ upgrade ──► ws reader ──► ServerDispatcher
//!                                         │              │
//!                                   ClientSession ◄── replies / stream frames
//!                                   (objects, subscriptions, outbound queue)
//! ```
//!
//! ```rust,ignore
//! let server = Server::builder()
//!     .schema(schema)
//!     .register_fn("add", |args, _cx| Box::pin(async move {
//!         let a = args[0].as_i64().ok_or("bad arg")?;
//!         let b = args[1].as_i64().ok_or("bad arg")?;
//!         Ok(HandlerReply::value(a + b))
//!     }))
//!     .build()?;
//! server.bind().await?.serve().await?;
//! ```

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod service;
pub mod session;

mod monitor;
mod server;
mod tls;
mod ws;

pub use config::{ServerConfig, TlsConfig};
pub use dispatcher::ServerDispatcher;
pub use error::{ServerError, ServerResult};
pub use service::{
    CallContext, FunctionHandler, HandlerError, HandlerReply, ObjectConstructor, ServiceObject,
    ServiceRegistry, ValueStream,
};
pub use session::{ClientSession, LiveObject, SessionError, SessionRegistry};
pub use server::{BoundServer, Server, ServerBuilder};
