//! Callee-side dispatcher.
//!
//! Routes each inbound frame to its target (free function, constructor,
//! method on a live object, or a dispose), invokes the handler on its own
//! task, and emits replies per the schema's declared return shape. Handlers
//! for different requests run concurrently; replies to one request id are
//! emitted in causal order because one task owns them.

use std::sync::Arc;

use futures_util::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use tether_wire::{
    codec, Channel, Frame, HandleBinder, RegistryError, RequestBody, RequestFrame, ResponseFrame,
    ReturnShape, ServiceSchema, Signature, TypeRegistry, WireError,
};

use crate::service::{CallContext, HandlerError, HandlerReply, ServiceRegistry, ValueStream};
use crate::session::ClientSession;

/// Dispatches parsed frames for any client session.
#[derive(Clone)]
pub struct ServerDispatcher {
    services: Arc<ServiceRegistry>,
    schema: Arc<ServiceSchema>,
    registry: Arc<TypeRegistry>,
}

/// Interface-typed values on the callee side: identifiers are checked
/// against the owning client's live-object registry instead of pinning the
/// object.
struct SessionBinder<'a> {
    session: &'a ClientSession,
}

impl HandleBinder for SessionBinder<'_> {
    fn marshal_handle(&self, interface: &str, value: &Value) -> Result<Value, RegistryError> {
        let object_id = value.as_u64().ok_or_else(|| RegistryError::Marshal {
            ty: interface.to_string(),
            reason: "expected a live object id".to_string(),
        })?;
        if self.session.object(object_id).is_none() {
            return Err(RegistryError::Marshal {
                ty: interface.to_string(),
                reason: format!("object {object_id} is not alive"),
            });
        }
        Ok(value.clone())
    }

    fn unmarshal_handle(&self, interface: &str, value: &Value) -> Result<Value, RegistryError> {
        let object_id = value.as_u64().ok_or_else(|| RegistryError::Unmarshal {
            ty: interface.to_string(),
            reason: "expected an object id".to_string(),
        })?;
        if self.session.object(object_id).is_none() {
            return Err(RegistryError::Unmarshal {
                ty: interface.to_string(),
                reason: format!("object {object_id} is disposed"),
            });
        }
        Ok(value.clone())
    }
}

impl ServerDispatcher {
    pub fn new(
        services: Arc<ServiceRegistry>,
        schema: Arc<ServiceSchema>,
        registry: Arc<TypeRegistry>,
    ) -> Self {
        Self {
            services,
            schema,
            registry,
        }
    }

    /// Entry point for every parsed frame arriving from a client socket.
    pub fn handle_frame(&self, session: &Arc<ClientSession>, frame: Frame) {
        match frame {
            Frame::Request(request) => self.handle_request(session, request),
            Frame::Response(response) => {
                warn!(
                    request_id = response.request_id,
                    "dropping unexpected response frame from client"
                );
            }
        }
    }

    fn handle_request(&self, session: &Arc<ClientSession>, request: RequestFrame) {
        if request.channel != Channel::Rpc {
            debug!(channel = %request.channel, "ignoring frame on non-rpc channel");
            return;
        }
        let channel = request.channel;
        let request_id = request.request_id;

        match request.body {
            RequestBody::FunctionCall { function, args } => {
                self.dispatch_function(session, channel, request_id, function, args)
            }
            RequestBody::MethodCall {
                method,
                object_id,
                args,
            } => self.dispatch_method(session, channel, request_id, object_id, method, args),
            RequestBody::NewObject { interface, args } => {
                self.dispatch_new_object(session, channel, request_id, interface, args)
            }
            RequestBody::DisposeObject { object_id } => {
                self.dispatch_dispose_object(session, channel, request_id, object_id)
            }
            RequestBody::DisposeObservable => {
                // No reply; late frames already in flight are the client's
                // dispatcher's problem, and it drops them.
                match session.remove_subscription(request_id) {
                    Some(handle) => {
                        handle.abort();
                        debug!(request_id, "subscription disposed");
                    }
                    None => debug!(request_id, "dispose for unknown subscription"),
                }
            }
        }
    }

    fn dispatch_function(
        &self,
        session: &Arc<ClientSession>,
        channel: Channel,
        request_id: u64,
        function: String,
        args: Vec<Value>,
    ) {
        let Some(sig) = self.schema.function(&function).cloned() else {
            self.reply_error(
                session,
                channel,
                request_id,
                WireError::new(format!("unknown function {function:?}"))
                    .with_code("UnknownService"),
            );
            return;
        };
        let Some(handler) = self.services.function(&function) else {
            self.reply_error(
                session,
                channel,
                request_id,
                WireError::new(format!("no handler for function {function:?}"))
                    .with_code("UnknownService"),
            );
            return;
        };
        let args = match self.unmarshal_args(session, &sig, args) {
            Ok(args) => args,
            Err(error) => {
                self.reply_error(session, channel, request_id, error);
                return;
            }
        };

        let this = self.clone();
        let session = Arc::clone(session);
        let cx = CallContext::new(Arc::clone(&session));
        tokio::spawn(async move {
            let outcome = invoke_guarded(handler.invoke(args, cx)).await;
            this.deliver(&session, channel, request_id, &sig.returns, outcome);
        });
    }

    fn dispatch_method(
        &self,
        session: &Arc<ClientSession>,
        channel: Channel,
        request_id: u64,
        object_id: u64,
        method: String,
        args: Vec<Value>,
    ) {
        let Some(live) = session.object(object_id) else {
            self.reply_error(
                session,
                channel,
                request_id,
                WireError::new(format!("object {object_id} is disposed"))
                    .with_code("ObjectDisposed"),
            );
            return;
        };
        let Some(sig) = self.schema.method(&live.interface, &method).cloned() else {
            self.reply_error(
                session,
                channel,
                request_id,
                WireError::new(format!(
                    "unknown method {}.{method}",
                    live.interface
                ))
                .with_code("UnknownMethod"),
            );
            return;
        };
        let args = match self.unmarshal_args(session, &sig, args) {
            Ok(args) => args,
            Err(error) => {
                self.reply_error(session, channel, request_id, error);
                return;
            }
        };

        let this = self.clone();
        let session = Arc::clone(session);
        let cx = CallContext::new(Arc::clone(&session));
        tokio::spawn(async move {
            let outcome =
                invoke_guarded(async move { live.object.call(&method, args, cx).await }).await;
            this.deliver(&session, channel, request_id, &sig.returns, outcome);
        });
    }

    fn dispatch_new_object(
        &self,
        session: &Arc<ClientSession>,
        channel: Channel,
        request_id: u64,
        interface: String,
        args: Vec<Value>,
    ) {
        let Some(decl) = self.schema.interface(&interface) else {
            self.reply_error(
                session,
                channel,
                request_id,
                WireError::new(format!("unknown interface {interface:?}"))
                    .with_code("UnknownService"),
            );
            return;
        };
        let ctor_sig = decl.ctor.clone();
        let Some(constructor) = self.services.constructor(&interface) else {
            self.reply_error(
                session,
                channel,
                request_id,
                WireError::new(format!("no constructor for interface {interface:?}"))
                    .with_code("UnknownService"),
            );
            return;
        };
        let args = match self.unmarshal_args(session, &ctor_sig, args) {
            Ok(args) => args,
            Err(error) => {
                self.reply_error(session, channel, request_id, error);
                return;
            }
        };

        let this = self.clone();
        let session = Arc::clone(session);
        let cx = CallContext::new(Arc::clone(&session));
        tokio::spawn(async move {
            let constructed =
                invoke_guarded(async move { constructor.construct(args, cx).await }).await;
            match constructed {
                Ok(object) => match session.insert_object(interface, object) {
                    Ok(object_id) => {
                        this.reply_success(&session, channel, request_id, Value::from(object_id));
                    }
                    Err(e) => {
                        debug!("session closed before object registration: {e}");
                    }
                },
                Err(error) => {
                    this.reply_error(&session, channel, request_id, error.to_wire());
                }
            }
        });
    }

    fn dispatch_dispose_object(
        &self,
        session: &Arc<ClientSession>,
        channel: Channel,
        request_id: u64,
        object_id: u64,
    ) {
        match session.remove_object(object_id) {
            Some(live) => {
                let this = self.clone();
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    live.object.dispose().await;
                    this.reply_success(&session, channel, request_id, Value::Null);
                });
            }
            // Dispose is idempotent: an id that is already gone acks
            // immediately and disposes nothing else.
            None => self.reply_success(session, channel, request_id, Value::Null),
        }
    }

    /// Emit the reply (or spawn the stream producer) a handler outcome calls
    /// for under the declared return shape.
    fn deliver(
        &self,
        session: &Arc<ClientSession>,
        channel: Channel,
        request_id: u64,
        returns: &ReturnShape,
        outcome: Result<HandlerReply, HandlerError>,
    ) {
        match (returns, outcome) {
            (ReturnShape::Void, Ok(_)) => {}
            (ReturnShape::Void, Err(e)) => {
                warn!(request_id, "void handler failed: {e}");
            }
            (ReturnShape::Promise { ty }, Ok(HandlerReply::Value(value))) => {
                match self.marshal_result(session, ty, value) {
                    Ok(value) => self.reply_success(session, channel, request_id, value),
                    Err(error) => self.reply_error(session, channel, request_id, error),
                }
            }
            (ReturnShape::Promise { .. }, Ok(_)) => {
                self.reply_error(
                    session,
                    channel,
                    request_id,
                    WireError::new("handler reply does not match declared promise shape"),
                );
            }
            (ReturnShape::Promise { .. }, Err(e)) => {
                self.reply_error(session, channel, request_id, e.to_wire());
            }
            (ReturnShape::Observable { ty }, Ok(HandlerReply::Stream(stream))) => {
                self.spawn_producer(session, channel, request_id, ty.clone(), stream);
            }
            (ReturnShape::Observable { .. }, Ok(_)) => {
                self.reply_error(
                    session,
                    channel,
                    request_id,
                    WireError::new("handler reply does not match declared observable shape"),
                );
            }
            (ReturnShape::Observable { .. }, Err(e)) => {
                self.reply_error(session, channel, request_id, e.to_wire());
            }
        }
    }

    /// Forward a produced stream to the client: `next` frames in emission
    /// order, then at most one terminal frame, and nothing after it. The
    /// subscription registers in the client session and is removed on
    /// completion, failure, dispose, or teardown.
    fn spawn_producer(
        &self,
        session: &Arc<ClientSession>,
        channel: Channel,
        request_id: u64,
        value_type: String,
        mut stream: ValueStream,
    ) {
        let this = self.clone();
        let task_session = Arc::clone(session);
        let (ready_tx, ready_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            // Wait until the subscription is registered so dispose cannot
            // race the first frame.
            let _ = ready_rx.await;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => {
                        let marshaled =
                            match this.marshal_result(&task_session, &value_type, value) {
                                Ok(value) => value,
                                Err(error) => {
                                    this.reply_error(&task_session, channel, request_id, error);
                                    task_session.remove_subscription(request_id);
                                    return;
                                }
                            };
                        let frame =
                            ResponseFrame::stream_next(channel, request_id, marshaled);
                        if !this.send_frame(&task_session, &frame) {
                            // Queue overflow fails the stream rather than
                            // blocking the producer.
                            let error = WireError::new("outbound queue overflow")
                                .with_code("Backpressure");
                            let terminal =
                                ResponseFrame::failure(channel, request_id, error.to_wire());
                            let _ = this.send_frame(&task_session, &terminal);
                            task_session.remove_subscription(request_id);
                            return;
                        }
                    }
                    Err(e) => {
                        this.reply_error(&task_session, channel, request_id, e.to_wire());
                        task_session.remove_subscription(request_id);
                        return;
                    }
                }
            }
            let frame = ResponseFrame::stream_completed(channel, request_id);
            this.send_frame(&task_session, &frame);
            task_session.remove_subscription(request_id);
        });

        session.insert_subscription(request_id, task.abort_handle());
        let _ = ready_tx.send(());
    }

    fn unmarshal_args(
        &self,
        session: &ClientSession,
        sig: &Signature,
        args: Vec<Value>,
    ) -> Result<Vec<Value>, WireError> {
        let binder = SessionBinder { session };
        args.into_iter()
            .enumerate()
            .map(|(index, arg)| match sig.params.get(index) {
                Some(ty) => self
                    .registry
                    .unmarshal(ty, &arg, &binder)
                    .map_err(|e| WireError::new(e.to_string())),
                None => Ok(arg),
            })
            .collect()
    }

    fn marshal_result(
        &self,
        session: &ClientSession,
        ty: &str,
        value: Value,
    ) -> Result<Value, WireError> {
        let binder = SessionBinder { session };
        self.registry
            .marshal(ty, &value, &binder)
            .map_err(|e| WireError::new(e.to_string()))
    }

    fn reply_success(
        &self,
        session: &ClientSession,
        channel: Channel,
        request_id: u64,
        result: Value,
    ) {
        let frame = ResponseFrame::success(channel, request_id, result);
        self.send_frame(session, &frame);
    }

    fn reply_error(
        &self,
        session: &ClientSession,
        channel: Channel,
        request_id: u64,
        error: WireError,
    ) {
        let frame = ResponseFrame::failure(channel, request_id, error.to_wire());
        self.send_frame(session, &frame);
    }

    /// Returns false when the frame could not be queued (backpressure or
    /// teardown); the caller decides whether that is terminal.
    fn send_frame(&self, session: &ClientSession, frame: &ResponseFrame) -> bool {
        let text = match codec::encode_response(frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(request_id = frame.request_id, "encode failed: {e}");
                return false;
            }
        };
        match session.send(text) {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    client_id = %session.client_id(),
                    request_id = frame.request_id,
                    "dropping reply: {e}"
                );
                false
            }
        }
    }
}

/// Run a handler future, converting a panic into a remote error so one bad
/// handler cannot take the process down.
async fn invoke_guarded<T>(
    fut: impl std::future::Future<Output = Result<T, HandlerError>>,
) -> Result<T, HandlerError> {
    match std::panic::AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Err(HandlerError::new(panic_message(panic))),
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = panic.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use serde_json::json;
    use std::time::Duration;

    const SCHEMA: &str = r#"{
        "declarations": [
            {"kind": "function", "name": "add",
             "params": ["number", "number"],
             "returns": {"shape": "promise", "type": "number"}},
            {"kind": "function", "name": "boom",
             "returns": {"shape": "promise", "type": "string"}},
            {"kind": "function", "name": "panics",
             "returns": {"shape": "promise", "type": "string"}},
            {"kind": "function", "name": "count",
             "params": ["number"],
             "returns": {"shape": "observable", "type": "number"}}
        ]
    }"#;

    fn dispatcher() -> ServerDispatcher {
        let mut services = ServiceRegistry::new();
        services.register_fn("add", |args, _cx| {
            Box::pin(async move {
                let a = args[0].as_i64().ok_or("bad arg")?;
                let b = args[1].as_i64().ok_or("bad arg")?;
                Ok(HandlerReply::value(a + b))
            })
        });
        services.register_fn("boom", |_args, _cx| {
            Box::pin(async move { Err(HandlerError::new("boom").with_code("EBOOM")) })
        });
        services.register_fn("panics", |_args, _cx| {
            Box::pin(async move { panic!("deliberate") })
        });
        services.register_fn("count", |args, _cx| {
            Box::pin(async move {
                let n = args[0].as_u64().ok_or("bad arg")?;
                let items = (0..n).map(|i| Ok(Value::from(i)));
                Ok(HandlerReply::stream(Box::pin(stream::iter(items))))
            })
        });

        ServerDispatcher::new(
            Arc::new(services),
            Arc::new(ServiceSchema::from_json(SCHEMA).unwrap()),
            Arc::new(TypeRegistry::new()),
        )
    }

    fn request(text: &str) -> Frame {
        codec::decode_frame(text).unwrap()
    }

    /// Poll the session queue until `n` frames accumulated.
    async fn wait_for_frames(session: &Arc<ClientSession>, n: usize) -> Vec<String> {
        for _ in 0..200 {
            let frames = session.queued_frames();
            if frames.len() >= n {
                return frames;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} frames, got {:?}", session.queued_frames());
    }

    #[tokio::test]
    async fn test_function_call_success_reply() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));
        let frame = request(
            r#"{"protocol":"tether.v1","channel":"rpc","requestId":1,
                "type":"FunctionCall","function":"add","args":[2,3]}"#,
        );
        dispatcher.handle_frame(&session, frame);

        let frames = wait_for_frames(&session, 1).await;
        assert!(frames[0].contains("\"requestId\":1"));
        assert!(frames[0].contains("\"hadError\":false"));
        assert!(frames[0].contains("\"result\":5"));
    }

    #[tokio::test]
    async fn test_handler_error_carries_code() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));
        let frame = request(
            r#"{"protocol":"tether.v1","channel":"rpc","requestId":2,
                "type":"FunctionCall","function":"boom","args":[]}"#,
        );
        dispatcher.handle_frame(&session, frame);

        let frames = wait_for_frames(&session, 1).await;
        assert!(frames[0].contains("\"hadError\":true"));
        assert!(frames[0].contains("\"message\":\"boom\""));
        assert!(frames[0].contains("\"code\":\"EBOOM\""));
    }

    #[tokio::test]
    async fn test_unknown_function_is_remote_error() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));
        let frame = request(
            r#"{"protocol":"tether.v1","channel":"rpc","requestId":3,
                "type":"FunctionCall","function":"nope","args":[]}"#,
        );
        dispatcher.handle_frame(&session, frame);

        let frames = wait_for_frames(&session, 1).await;
        assert!(frames[0].contains("\"code\":\"UnknownService\""));
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_remote_error() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));
        let frame = request(
            r#"{"protocol":"tether.v1","channel":"rpc","requestId":4,
                "type":"FunctionCall","function":"panics","args":[]}"#,
        );
        dispatcher.handle_frame(&session, frame);

        let frames = wait_for_frames(&session, 1).await;
        assert!(frames[0].contains("\"hadError\":true"));
        assert!(frames[0].contains("deliberate"));
    }

    #[tokio::test]
    async fn test_observable_emits_next_frames_then_terminal() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));
        let frame = request(
            r#"{"protocol":"tether.v1","channel":"rpc","requestId":5,
                "type":"FunctionCall","function":"count","args":[3]}"#,
        );
        dispatcher.handle_frame(&session, frame);

        let frames = wait_for_frames(&session, 4).await;
        assert!(frames[0].contains("\"type\":\"next\""));
        assert!(frames[0].contains("\"data\":0"));
        assert!(frames[2].contains("\"data\":2"));
        assert!(frames[3].contains("\"type\":\"completed\""));
        // The subscription is removed once the terminal frame is out.
        assert_eq!(session.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_dispose_object_is_idempotent() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));

        let frame = request(
            r#"{"protocol":"tether.v1","channel":"rpc","requestId":6,
                "type":"DisposeObject","objectId":99}"#,
        );
        dispatcher.handle_frame(&session, frame);
        let frames = wait_for_frames(&session, 1).await;
        // Unknown id still acks.
        assert!(frames[0].contains("\"hadError\":false"));
    }

    #[tokio::test]
    async fn test_heartbeat_channel_frames_are_ignored() {
        let dispatcher = dispatcher();
        let session = Arc::new(ClientSession::new("c1", 64));
        let frame = request(
            r#"{"protocol":"tether.v1","channel":"heartbeat","requestId":7,
                "type":"FunctionCall","function":"add","args":[1,2]}"#,
        );
        dispatcher.handle_frame(&session, frame);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(session.queued_frames().is_empty());
    }
}
