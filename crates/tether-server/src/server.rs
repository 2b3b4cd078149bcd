//! Combined HTTP/WebSocket listener.
//!
//! One TCP port serves the plain-HTTP plane (`POST /heartbeat`, 404 for
//! everything else) and WebSocket upgrades for the RPC channel. TLS wraps
//! the whole listener when configured.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

use tether_wire::{ServiceSchema, TypeRegistry};

use crate::config::ServerConfig;
use crate::dispatcher::ServerDispatcher;
use crate::error::{ServerError, ServerResult};
use crate::service::{
    CallContext, FunctionHandler, HandlerError, HandlerReply, ObjectConstructor, ServiceObject,
    ServiceRegistry,
};
use crate::session::SessionRegistry;
use crate::{monitor, tls, ws};

/// Response body type shared by the HTTP plane.
pub(crate) type HttpBody = http_body_util::combinators::UnsyncBoxBody<Bytes, hyper::Error>;

/// Shared state behind every connection.
pub(crate) struct ServerState {
    pub(crate) config: ServerConfig,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) dispatcher: ServerDispatcher,
}

/// Builder for a tether server.
pub struct ServerBuilder {
    config: ServerConfig,
    services: ServiceRegistry,
    schema: ServiceSchema,
    registry: Option<TypeRegistry>,
}

impl ServerBuilder {
    pub fn new() -> Self {
        Self {
            config: ServerConfig::default(),
            services: ServiceRegistry::new(),
            schema: ServiceSchema::default(),
            registry: None,
        }
    }

    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.config.bind_address = addr;
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.config.bind_address.set_port(port);
        self
    }

    /// The consumed service schema (shapes, parameter and return types).
    pub fn schema(mut self, schema: ServiceSchema) -> Self {
        self.schema = schema;
        self
    }

    /// Supply a registry holding custom codecs. Schema-declared aliases and
    /// interfaces are added on top during `build`.
    pub fn type_registry(mut self, registry: TypeRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn session_idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout = timeout;
        self
    }

    pub fn track_event_loop(mut self, enable: bool) -> Self {
        self.config.track_event_loop = enable;
        self
    }

    pub fn register_function<H>(mut self, name: impl Into<String>, handler: H) -> Self
    where
        H: FunctionHandler + 'static,
    {
        self.services.register_function(name, handler);
        self
    }

    pub fn register_fn<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>, CallContext) -> BoxFuture<'static, Result<HandlerReply, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.services.register_fn(name, f);
        self
    }

    pub fn register_interface<C>(mut self, name: impl Into<String>, ctor: C) -> Self
    where
        C: ObjectConstructor + 'static,
    {
        self.services.register_interface(name, ctor);
        self
    }

    pub fn register_ctor<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(
                Vec<Value>,
                CallContext,
            ) -> BoxFuture<'static, Result<Arc<dyn ServiceObject>, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.services.register_ctor(name, f);
        self
    }

    pub fn build(self) -> ServerResult<Server> {
        let mut registry = self.registry.unwrap_or_default();
        registry.register_schema_types(&self.schema)?;

        let dispatcher = ServerDispatcher::new(
            Arc::new(self.services),
            Arc::new(self.schema),
            Arc::new(registry),
        );
        let state = Arc::new(ServerState {
            config: self.config.clone(),
            sessions: Arc::new(SessionRegistry::new(self.config.max_outbound_queue)),
            dispatcher,
        });
        Ok(Server {
            config: self.config,
            state,
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// An unbound tether server.
pub struct Server {
    config: ServerConfig,
    state: Arc<ServerState>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind the listener (use port 0 for an ephemeral port) and start the
    /// background maintenance tasks.
    pub async fn bind(self) -> ServerResult<BoundServer> {
        let addr = self.config.bind_address;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let tls = match &self.config.tls {
            Some(tls_config) => Some(tls::build_acceptor(tls_config)?),
            None => None,
        };

        if self.config.track_event_loop {
            monitor::spawn_event_loop_monitor();
        }
        spawn_session_sweeper(&self.state);

        info!(
            "listening on {local_addr} ({})",
            if tls.is_some() { "tls" } else { "plaintext" }
        );
        Ok(BoundServer {
            listener,
            local_addr,
            tls,
            state: self.state,
        })
    }
}

/// A bound server ready to accept connections.
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    tls: Option<TlsAcceptor>,
    state: Arc<ServerState>,
}

impl BoundServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The live session registry, for stats and diagnostics.
    pub fn sessions(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.state.sessions)
    }

    /// Accept connections forever.
    pub async fn serve(self) -> ServerResult<()> {
        self.serve_with_shutdown(std::future::pending::<()>()).await
    }

    /// Accept connections until `shutdown` resolves, then tear down every
    /// client session.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> ServerResult<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    debug!("new connection from {peer_addr}");
                    let state = Arc::clone(&self.state);
                    let tls = self.tls.clone();
                    tokio::spawn(handle_connection(stream, tls, state));
                }
                _ = &mut shutdown => {
                    info!("shutdown signal received");
                    break;
                }
            }
        }
        for session in self.state.sessions.drain_all().await {
            session.teardown().await;
        }
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, tls: Option<TlsAcceptor>, state: Arc<ServerState>) {
    match tls {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls_stream) => serve_io(TokioIo::new(tls_stream), state).await,
            Err(e) => debug!("TLS handshake failed: {e}"),
        },
        None => serve_io(TokioIo::new(stream), state).await,
    }
}

async fn serve_io<I>(io: I, state: Arc<ServerState>)
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let service = service_fn(move |req| handle_request(req, Arc::clone(&state)));
    if let Err(err) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        // Filter out common client disconnection errors that aren't actual
        // problems.
        let err_str = err.to_string();
        if err_str.contains("connection closed before message completed") {
            debug!("client disconnected: {err}");
        } else {
            error!("error serving connection: {err}");
        }
    }
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<ServerState>,
) -> Result<Response<HttpBody>, hyper::Error> {
    if ws::is_websocket_upgrade(&req) {
        return Ok(ws::handle_upgrade(req, state));
    }

    debug!("handling {} {}", req.method(), req.uri().path());
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/heartbeat") => {
            Ok(text_response(StatusCode::OK, env!("CARGO_PKG_VERSION")))
        }
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

fn text_response(status: StatusCode, body: &'static str) -> Response<HttpBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .unwrap()
}

fn spawn_session_sweeper(state: &Arc<ServerState>) {
    let weak = Arc::downgrade(state);
    let sweep_interval = state.config.sweep_interval;
    let idle = state.config.session_idle_timeout;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        loop {
            interval.tick().await;
            let Some(state) = weak.upgrade() else { break };
            let expired = state.sessions.expire_idle(idle).await;
            for session in expired {
                info!(client_id = %session.client_id(), "expiring idle client session");
                session.teardown().await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let server = Server::builder().port(0).build().unwrap();
        let bound = server.bind().await.unwrap();
        assert!(bound.local_addr().port() > 0);
    }

    #[tokio::test]
    async fn test_heartbeat_returns_version() {
        let server = Server::builder().port(0).build().unwrap();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr();
        tokio::spawn(bound.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(
                b"POST /heartbeat HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\n\r\n",
            )
            .await
            .unwrap();
        let mut response = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stream.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            response.extend_from_slice(&buf[..n]);
            if response.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8_lossy(&response);
        assert!(text.starts_with("HTTP/1.1 200"));
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let server = Server::builder().port(0).build().unwrap();
        let bound = server.bind().await.unwrap();
        let addr = bound.local_addr();
        tokio::spawn(bound.serve());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /nope HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let mut buf = [0u8; 256];
        let n = stream.read(&mut buf).await.unwrap();
        let text = String::from_utf8_lossy(&buf[..n]);
        assert!(text.starts_with("HTTP/1.1 404"));
    }
}
