//! Caller-side dispatcher.
//!
//! Generates request identifiers, sends requests, correlates replies by id,
//! enforces per-call timeouts, materializes server-streamed results, and
//! issues dispose messages. One dispatcher owns one [`SocketSession`] and one
//! RPC table; everything else (proxies, subscriptions) holds a weak
//! back-reference into it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tether_wire::{
    codec, Channel, Frame, HandleBinder, RegistryError, RequestFrame, ResponseFrame, ReturnShape,
    ServiceSchema, StreamPayload, TypeRegistry, WireError,
};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::proxy::RemoteProxy;
use crate::socket::{InboundFrames, SocketSession};
use crate::subscription::Subscription;

/// Outcome delivered to a promise-shaped caller.
pub(crate) type PromiseOutcome = ClientResult<Value>;

/// One entry of the RPC table.
pub(crate) enum Pending {
    Promise {
        tx: oneshot::Sender<PromiseOutcome>,
        value_type: Option<String>,
    },
    Stream {
        tx: mpsc::UnboundedSender<ClientResult<Value>>,
        value_type: Option<String>,
        /// Cleared the moment the first frame arrives; until then the
        /// first-frame timer may fail the stream with `Timeout`.
        opened: bool,
    },
}

pub(crate) struct Inner {
    socket: SocketSession,
    schema: Arc<ServiceSchema>,
    registry: Arc<TypeRegistry>,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, Pending>>,
    proxies: Mutex<HashMap<u64, RemoteProxy>>,
    closed: AtomicBool,
    self_weak: Weak<Inner>,
}

/// The caller-side surface of the transport.
#[derive(Clone)]
pub struct ClientDispatcher {
    inner: Arc<Inner>,
}

impl ClientDispatcher {
    /// Connect a dispatcher. The socket attaches (and re-attaches) in the
    /// background; calls made before the first attachment are queued.
    pub fn connect(
        config: ClientConfig,
        schema: Arc<ServiceSchema>,
        registry: Arc<TypeRegistry>,
    ) -> ClientResult<Self> {
        let (socket, inbound) = SocketSession::connect(config)?;
        Ok(Self::with_socket(socket, inbound, schema, registry))
    }

    fn with_socket(
        socket: SocketSession,
        inbound: InboundFrames,
        schema: Arc<ServiceSchema>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| Inner {
            socket,
            schema,
            registry,
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            proxies: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            self_weak: weak.clone(),
        });
        tokio::spawn(read_loop(Arc::downgrade(&inner), inbound));
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    /// Wait until the socket session has a live attachment.
    pub async fn wait_connected(&self) -> ClientResult<()> {
        self.inner.socket.wait_connected().await
    }

    /// Observe socket attach/detach transitions.
    pub fn connection_events(&self) -> tokio::sync::watch::Receiver<bool> {
        self.inner.socket.connection_events()
    }

    pub fn client_id(&self) -> &str {
        self.inner.socket.client_id()
    }

    /// Fire-and-forget call. Nothing is registered in the RPC table; if the
    /// socket is down the frame is queued by the socket session.
    pub fn call_void(&self, function: &str, args: Vec<Value>) -> ClientResult<()> {
        self.inner.ensure_open()?;
        let params = {
            let sig = self
                .inner
                .schema
                .function(function)
                .ok_or_else(|| ClientError::UnknownFunction(function.to_string()))?;
            if sig.returns != ReturnShape::Void {
                return Err(ClientError::ShapeMismatch {
                    target: function.to_string(),
                    declared: sig.returns.name(),
                    requested: "void",
                });
            }
            sig.params.clone()
        };
        let args = self.inner.marshal_args(&params, args)?;
        let request_id = self.inner.next_id();
        let frame = RequestFrame::function_call(request_id, function, args);
        self.inner.send_frame(&frame)
    }

    /// Request/response call; suspends the caller until reply or timeout.
    pub async fn call(&self, function: &str, args: Vec<Value>) -> ClientResult<Value> {
        let (params, value_type) = {
            let sig = self
                .inner
                .schema
                .function(function)
                .ok_or_else(|| ClientError::UnknownFunction(function.to_string()))?;
            match &sig.returns {
                ReturnShape::Promise { ty } => (sig.params.clone(), ty.clone()),
                other => {
                    return Err(ClientError::ShapeMismatch {
                        target: function.to_string(),
                        declared: other.name(),
                        requested: "promise",
                    })
                }
            }
        };
        let args = self.inner.marshal_args(&params, args)?;
        let (request_id, rx) = self.inner.register_promise(Some(value_type))?;
        let frame = RequestFrame::function_call(request_id, function, args);
        self.inner.send_or_unregister(&frame, request_id)?;
        self.inner.await_promise(request_id, rx).await
    }

    /// Server-streamed call; returns the stream without waiting for frames.
    pub fn subscribe(&self, function: &str, args: Vec<Value>) -> ClientResult<Subscription> {
        let (params, value_type) = {
            let sig = self
                .inner
                .schema
                .function(function)
                .ok_or_else(|| ClientError::UnknownFunction(function.to_string()))?;
            match &sig.returns {
                ReturnShape::Observable { ty } => (sig.params.clone(), ty.clone()),
                other => {
                    return Err(ClientError::ShapeMismatch {
                        target: function.to_string(),
                        declared: other.name(),
                        requested: "observable",
                    })
                }
            }
        };
        let args = self.inner.marshal_args(&params, args)?;
        let (request_id, rx) = self.inner.register_stream(Some(value_type))?;
        let frame = RequestFrame::function_call(request_id, function, args);
        self.inner.send_or_unregister(&frame, request_id)?;
        self.inner.spawn_first_frame_timer(request_id);
        Ok(Subscription::new(request_id, rx, self.inner.self_weak.clone()))
    }

    /// Construct a remote object. The proxy is returned immediately; its
    /// identifier resolves when the `NewObject` reply arrives, and any method
    /// call made in the meantime serializes behind that resolution.
    pub fn create_object(&self, interface: &str, args: Vec<Value>) -> ClientResult<RemoteProxy> {
        let params = {
            let decl = self
                .inner
                .schema
                .interface(interface)
                .ok_or_else(|| ClientError::UnknownInterface(interface.to_string()))?;
            decl.ctor.params.clone()
        };
        let args = self.inner.marshal_args(&params, args)?;
        let (request_id, rx) = self.inner.register_promise(None)?;
        let frame = RequestFrame::new_object(request_id, interface, args);
        self.inner.send_or_unregister(&frame, request_id)?;

        let (proxy, resolver) = RemoteProxy::pending(interface, self.inner.self_weak.clone());
        let inner = Arc::clone(&self.inner);
        let cached = proxy.clone();
        tokio::spawn(async move {
            match inner.await_promise(request_id, rx).await {
                Ok(value) => match value.as_u64() {
                    Some(object_id) => {
                        inner.proxies.lock().insert(object_id, cached);
                        resolver.resolve(object_id);
                    }
                    None => resolver.fail(ClientError::Transport(format!(
                        "NewObject reply is not an object id: {value}"
                    ))),
                },
                Err(e) => resolver.fail(e),
            }
        });
        Ok(proxy)
    }

    /// Release a remote object; resolves on the server's ack. Idempotent.
    pub async fn dispose_object(&self, object_id: u64) -> ClientResult<()> {
        if let Some(proxy) = self.inner.proxies.lock().remove(&object_id) {
            proxy.mark_disposed();
        }
        let (request_id, rx) = self.inner.register_promise(None)?;
        let frame = RequestFrame::dispose_object(request_id, object_id);
        self.inner.send_or_unregister(&frame, request_id)?;
        self.inner.await_promise(request_id, rx).await.map(|_| ())
    }

    /// The cached proxy for an object id, if one is alive.
    pub fn proxy(&self, object_id: u64) -> Option<RemoteProxy> {
        self.inner.proxies.lock().get(&object_id).cloned()
    }

    /// Reject every pending future and error every live stream with
    /// [`ClientError::Closed`], then tear down the socket session.
    pub fn close(&self) {
        self.inner.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // Method-call variants, used by `RemoteProxy` once its id is resolved.

    pub(crate) async fn call_method(
        &self,
        interface: &str,
        object_id: u64,
        method: &str,
        args: Vec<Value>,
    ) -> ClientResult<Value> {
        let (params, value_type) = {
            let sig = self.inner.method_signature(interface, method)?;
            match &sig.returns {
                ReturnShape::Promise { ty } => (sig.params.clone(), ty.clone()),
                other => {
                    return Err(ClientError::ShapeMismatch {
                        target: format!("{interface}.{method}"),
                        declared: other.name(),
                        requested: "promise",
                    })
                }
            }
        };
        let args = self.inner.marshal_args(&params, args)?;
        let (request_id, rx) = self.inner.register_promise(Some(value_type))?;
        let frame = RequestFrame::method_call(request_id, object_id, method, args);
        self.inner.send_or_unregister(&frame, request_id)?;
        self.inner.await_promise(request_id, rx).await
    }

    pub(crate) fn call_method_void(
        &self,
        interface: &str,
        object_id: u64,
        method: &str,
        args: Vec<Value>,
    ) -> ClientResult<()> {
        self.inner.ensure_open()?;
        let params = {
            let sig = self.inner.method_signature(interface, method)?;
            if sig.returns != ReturnShape::Void {
                return Err(ClientError::ShapeMismatch {
                    target: format!("{interface}.{method}"),
                    declared: sig.returns.name(),
                    requested: "void",
                });
            }
            sig.params.clone()
        };
        let args = self.inner.marshal_args(&params, args)?;
        let request_id = self.inner.next_id();
        let frame = RequestFrame::method_call(request_id, object_id, method, args);
        self.inner.send_frame(&frame)
    }

    pub(crate) fn subscribe_method(
        &self,
        interface: &str,
        object_id: u64,
        method: &str,
        args: Vec<Value>,
    ) -> ClientResult<Subscription> {
        let (params, value_type) = {
            let sig = self.inner.method_signature(interface, method)?;
            match &sig.returns {
                ReturnShape::Observable { ty } => (sig.params.clone(), ty.clone()),
                other => {
                    return Err(ClientError::ShapeMismatch {
                        target: format!("{interface}.{method}"),
                        declared: other.name(),
                        requested: "observable",
                    })
                }
            }
        };
        let args = self.inner.marshal_args(&params, args)?;
        let (request_id, rx) = self.inner.register_stream(Some(value_type))?;
        let frame = RequestFrame::method_call(request_id, object_id, method, args);
        self.inner.send_or_unregister(&frame, request_id)?;
        self.inner.spawn_first_frame_timer(request_id);
        Ok(Subscription::new(request_id, rx, self.inner.self_weak.clone()))
    }
}

impl Inner {
    fn ensure_open(&self) -> ClientResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ClientError::Closed);
        }
        Ok(())
    }

    /// Monotonic per-dispatcher request identifiers, starting at 1, never
    /// reused.
    fn next_id(&self) -> u64 {
        self.next_request_id.fetch_add(1, Ordering::SeqCst)
    }

    fn method_signature(
        &self,
        interface: &str,
        method: &str,
    ) -> ClientResult<&tether_wire::Signature> {
        self.schema.method(interface, method).ok_or_else(|| {
            ClientError::UnknownMethod {
                interface: interface.to_string(),
                method: method.to_string(),
            }
        })
    }

    fn marshal_args(&self, params: &[String], args: Vec<Value>) -> ClientResult<Vec<Value>> {
        args.into_iter()
            .enumerate()
            .map(|(index, arg)| match params.get(index) {
                Some(ty) => self
                    .registry
                    .marshal(ty, &arg, self)
                    .map_err(ClientError::from),
                None => Ok(arg),
            })
            .collect()
    }

    fn decode_value(&self, value_type: Option<&str>, value: Value) -> ClientResult<Value> {
        match value_type {
            None => Ok(value),
            Some(ty) => self
                .registry
                .unmarshal(ty, &value, self)
                .map_err(ClientError::from),
        }
    }

    fn register_promise(
        &self,
        value_type: Option<String>,
    ) -> ClientResult<(u64, oneshot::Receiver<PromiseOutcome>)> {
        self.ensure_open()?;
        let request_id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(request_id, Pending::Promise { tx, value_type });
        Ok((request_id, rx))
    }

    fn register_stream(
        &self,
        value_type: Option<String>,
    ) -> ClientResult<(u64, mpsc::UnboundedReceiver<ClientResult<Value>>)> {
        self.ensure_open()?;
        let request_id = self.next_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(
            request_id,
            Pending::Stream {
                tx,
                value_type,
                opened: false,
            },
        );
        Ok((request_id, rx))
    }

    fn send_frame(&self, frame: &RequestFrame) -> ClientResult<()> {
        let text = codec::encode_request(frame)
            .map_err(|e| ClientError::Transport(format!("encode failed: {e}")))?;
        self.socket.send(text)
    }

    fn send_or_unregister(&self, frame: &RequestFrame, request_id: u64) -> ClientResult<()> {
        if let Err(e) = self.send_frame(frame) {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }
        Ok(())
    }

    async fn await_promise(
        &self,
        request_id: u64,
        rx: oneshot::Receiver<PromiseOutcome>,
    ) -> ClientResult<Value> {
        let window = self.socket.rpc_timeout();
        match tokio::time::timeout(window, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => {
                // Remove the entry so a late reply is dropped, not delivered.
                self.pending.lock().remove(&request_id);
                Err(ClientError::Timeout(window))
            }
        }
    }

    /// Observable entries carry a timer only until the first frame arrives.
    fn spawn_first_frame_timer(&self, request_id: u64) {
        let window = self.socket.rpc_timeout();
        let weak = self.self_weak.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let Some(inner) = weak.upgrade() else { return };
            let stale = {
                let mut pending = inner.pending.lock();
                match pending.get(&request_id) {
                    Some(Pending::Stream { opened: false, .. }) => pending.remove(&request_id),
                    _ => None,
                }
            };
            if let Some(Pending::Stream { tx, .. }) = stale {
                let _ = tx.send(Err(ClientError::Timeout(window)));
            }
        });
    }

    /// Unsubscribe: drop the table entry and tell the server. Late frames
    /// for the id are dropped by `handle_response`.
    pub(crate) fn cancel_subscription(&self, request_id: u64) {
        let removed = self.pending.lock().remove(&request_id);
        if removed.is_none() {
            return;
        }
        let frame = RequestFrame::dispose_observable(request_id);
        if let Err(e) = self.send_frame(&frame) {
            debug!(request_id, "could not send DisposeObservable: {e}");
        }
    }

    fn handle_response(&self, response: ResponseFrame) {
        if response.channel != Channel::Rpc {
            debug!(channel = %response.channel, "ignoring frame on non-rpc channel");
            return;
        }
        let request_id = response.request_id;

        enum Action {
            Unknown,
            Promise {
                tx: oneshot::Sender<PromiseOutcome>,
                value_type: Option<String>,
            },
            StreamItem {
                tx: mpsc::UnboundedSender<ClientResult<Value>>,
                value_type: Option<String>,
                data: Value,
            },
            StreamError {
                tx: mpsc::UnboundedSender<ClientResult<Value>>,
            },
            StreamCompleted,
            StreamMalformed,
        }

        // Classify under the lock; deliver (and decode) outside it.
        let action = {
            let mut pending = self.pending.lock();
            match pending.get(&request_id) {
                None => Action::Unknown,
                Some(Pending::Promise { .. }) => match pending.remove(&request_id) {
                    Some(Pending::Promise { tx, value_type }) => {
                        Action::Promise { tx, value_type }
                    }
                    _ => Action::Unknown,
                },
                Some(Pending::Stream { .. }) => {
                    if response.had_error {
                        match pending.remove(&request_id) {
                            Some(Pending::Stream { tx, .. }) => Action::StreamError { tx },
                            _ => Action::Unknown,
                        }
                    } else {
                        match response.stream_payload() {
                            Some(StreamPayload::Next { data }) => {
                                match pending.get_mut(&request_id) {
                                    Some(Pending::Stream {
                                        tx,
                                        value_type,
                                        opened,
                                    }) => {
                                        *opened = true;
                                        Action::StreamItem {
                                            tx: tx.clone(),
                                            value_type: value_type.clone(),
                                            data,
                                        }
                                    }
                                    _ => Action::Unknown,
                                }
                            }
                            Some(StreamPayload::Completed) => {
                                // Dropping the sender closes the stream.
                                pending.remove(&request_id);
                                Action::StreamCompleted
                            }
                            None => {
                                if let Some(Pending::Stream { opened, .. }) =
                                    pending.get_mut(&request_id)
                                {
                                    *opened = true;
                                }
                                Action::StreamMalformed
                            }
                        }
                    }
                }
            }
        };

        match action {
            Action::Unknown => {
                warn!(request_id, "dropping frame for unknown or completed request");
            }
            Action::Promise { tx, value_type } => {
                let outcome = if response.had_error {
                    Err(remote_error(response.error))
                } else {
                    self.decode_value(
                        value_type.as_deref(),
                        response.result.unwrap_or(Value::Null),
                    )
                };
                let _ = tx.send(outcome);
            }
            Action::StreamItem {
                tx,
                value_type,
                data,
            } => {
                let item = self.decode_value(value_type.as_deref(), data);
                let _ = tx.send(item);
            }
            Action::StreamError { tx } => {
                let _ = tx.send(Err(remote_error(response.error)));
            }
            Action::StreamCompleted => {}
            Action::StreamMalformed => {
                warn!(request_id, "dropping malformed stream frame");
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let entries: Vec<(u64, Pending)> = self.pending.lock().drain().collect();
        for (_, entry) in entries {
            match entry {
                Pending::Promise { tx, .. } => {
                    let _ = tx.send(Err(ClientError::Closed));
                }
                Pending::Stream { tx, .. } => {
                    let _ = tx.send(Err(ClientError::Closed));
                }
            }
        }
        self.proxies.lock().clear();
        self.socket.close();
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.socket.close();
    }
}

/// Interface-typed values on the caller side: outbound handles must already
/// be object ids; inbound ids get a cached proxy bound to them.
impl HandleBinder for Inner {
    fn marshal_handle(&self, interface: &str, value: &Value) -> Result<Value, RegistryError> {
        if value.as_u64().is_none() {
            return Err(RegistryError::Marshal {
                ty: interface.to_string(),
                reason: "expected a resolved object id".to_string(),
            });
        }
        Ok(value.clone())
    }

    fn unmarshal_handle(&self, interface: &str, value: &Value) -> Result<Value, RegistryError> {
        let object_id = value.as_u64().ok_or_else(|| RegistryError::Unmarshal {
            ty: interface.to_string(),
            reason: "expected an object id".to_string(),
        })?;
        let mut proxies = self.proxies.lock();
        proxies.entry(object_id).or_insert_with(|| {
            RemoteProxy::resolved(interface, object_id, self.self_weak.clone())
        });
        Ok(value.clone())
    }
}

fn remote_error(error: Option<Value>) -> ClientError {
    ClientError::Remote(WireError::from_wire(&error.unwrap_or(Value::Null)))
}

async fn read_loop(weak: Weak<Inner>, mut inbound: InboundFrames) {
    while let Some(frame) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else { break };
        match frame {
            Frame::Response(response) => inner.handle_response(response),
            Frame::Request(request) => {
                warn!(
                    kind = request.body.type_name(),
                    "dropping unexpected request frame from server"
                );
            }
        }
    }
    debug!("dispatcher read loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use serde_json::json;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, tungstenite::Message};

    const SCHEMA: &str = r#"{
        "declarations": [
            {"kind": "function", "name": "add",
             "params": ["number", "number"],
             "returns": {"shape": "promise", "type": "number"}},
            {"kind": "function", "name": "log",
             "params": ["string"], "returns": {"shape": "void"}},
            {"kind": "function", "name": "tail",
             "params": ["string"],
             "returns": {"shape": "observable", "type": "string"}}
        ]
    }"#;

    fn dispatcher_for(port: u16, timeout: Duration) -> ClientDispatcher {
        let config = ClientConfig::new(format!("ws://127.0.0.1:{port}"))
            .with_client_id("test")
            .with_rpc_timeout(timeout);
        let schema = Arc::new(ServiceSchema::from_json(SCHEMA).unwrap());
        let registry = Arc::new(TypeRegistry::new());
        ClientDispatcher::connect(config, schema, registry).unwrap()
    }

    /// Accept one socket and swallow the handshake frame.
    async fn accept_one(
        listener: &TcpListener,
    ) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        let _handshake = ws.next().await.unwrap().unwrap();
        ws
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> String {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => return text,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn test_promise_call_resolves() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dispatcher = dispatcher_for(port, Duration::from_secs(2));
        let mut ws = accept_one(&listener).await;

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.call("add", vec![json!(2), json!(3)]).await }
        });

        let text = next_text(&mut ws).await;
        assert!(text.contains("\"requestId\":1"));
        let reply = ResponseFrame::success(Channel::Rpc, 1, json!(5));
        ws.send(Message::Text(codec::encode_response(&reply).unwrap()))
            .await
            .unwrap();

        assert_eq!(call.await.unwrap().unwrap(), json!(5));
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_request_ids_are_monotonic() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dispatcher = dispatcher_for(port, Duration::from_secs(2));
        let mut ws = accept_one(&listener).await;

        dispatcher.call_void("log", vec![json!("a")]).unwrap();
        dispatcher.call_void("log", vec![json!("b")]).unwrap();

        assert!(next_text(&mut ws).await.contains("\"requestId\":1"));
        assert!(next_text(&mut ws).await.contains("\"requestId\":2"));
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_timeout_removes_entry_and_late_reply_is_dropped() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dispatcher = dispatcher_for(port, Duration::from_millis(100));
        let mut ws = accept_one(&listener).await;

        let err = dispatcher.call("add", vec![json!(1), json!(1)]).await;
        assert!(matches!(err, Err(ClientError::Timeout(_))));

        // Late reply: must be dropped without disturbing the next call.
        let late = ResponseFrame::success(Channel::Rpc, 1, json!(2));
        ws.send(Message::Text(codec::encode_response(&late).unwrap()))
            .await
            .unwrap();

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.call("add", vec![json!(2), json!(2)]).await }
        });
        // Skip the first (timed out) frame, answer the second.
        let _stale = next_text(&mut ws).await;
        let text = next_text(&mut ws).await;
        assert!(text.contains("\"requestId\":2"));
        let reply = ResponseFrame::success(Channel::Rpc, 2, json!(4));
        ws.send(Message::Text(codec::encode_response(&reply).unwrap()))
            .await
            .unwrap();
        assert_eq!(call.await.unwrap().unwrap(), json!(4));
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_local() {
        let dispatcher = dispatcher_for(1, Duration::from_millis(100));
        let err = dispatcher.call("log", vec![json!("x")]).await;
        assert!(matches!(err, Err(ClientError::ShapeMismatch { .. })));
        let err = dispatcher.call_void("add", vec![]);
        assert!(matches!(err, Err(ClientError::ShapeMismatch { .. })));
        let err = dispatcher.call("nope", vec![]).await;
        assert!(matches!(err, Err(ClientError::UnknownFunction(_))));
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_stream_lifecycle_and_post_terminal_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dispatcher = dispatcher_for(port, Duration::from_secs(2));
        let mut ws = accept_one(&listener).await;

        let mut sub = dispatcher.subscribe("tail", vec![json!("/x")]).unwrap();
        let _request = next_text(&mut ws).await;

        for value in ["a", "b", "c"] {
            let frame = ResponseFrame::stream_next(Channel::Rpc, 1, json!(value));
            ws.send(Message::Text(codec::encode_response(&frame).unwrap()))
                .await
                .unwrap();
        }
        let done = ResponseFrame::stream_completed(Channel::Rpc, 1);
        ws.send(Message::Text(codec::encode_response(&done).unwrap()))
            .await
            .unwrap();
        // Rogue frame after the terminal: dropped, not delivered.
        let rogue = ResponseFrame::stream_next(Channel::Rpc, 1, json!("d"));
        ws.send(Message::Text(codec::encode_response(&rogue).unwrap()))
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().unwrap(), json!("a"));
        assert_eq!(sub.next().await.unwrap().unwrap(), json!("b"));
        assert_eq!(sub.next().await.unwrap().unwrap(), json!("c"));
        assert!(sub.next().await.is_none());
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_unsubscribe_sends_dispose_observable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dispatcher = dispatcher_for(port, Duration::from_secs(2));
        let mut ws = accept_one(&listener).await;

        let sub = dispatcher.subscribe("tail", vec![json!("/x")]).unwrap();
        let _request = next_text(&mut ws).await;

        sub.unsubscribe();
        let text = next_text(&mut ws).await;
        assert!(text.contains("\"type\":\"DisposeObservable\""));
        assert!(text.contains("\"requestId\":1"));
        dispatcher.close();
    }

    #[tokio::test]
    async fn test_close_rejects_pending_with_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let dispatcher = dispatcher_for(port, Duration::from_secs(30));
        let _ws = accept_one(&listener).await;

        let call = tokio::spawn({
            let dispatcher = dispatcher.clone();
            async move { dispatcher.call("add", vec![json!(1), json!(2)]).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        dispatcher.close();
        assert!(matches!(call.await.unwrap(), Err(ClientError::Closed)));
        assert!(matches!(
            dispatcher.call_void("log", vec![json!("x")]),
            Err(ClientError::Closed)
        ));
    }
}
