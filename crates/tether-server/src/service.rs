//! Service registration surface.
//!
//! Handlers return domain values and domain errors only; the dispatcher owns
//! the wire encoding. The declared return shape in the schema dictates how a
//! handler's reply travels: void handlers get no reply frame, promise
//! handlers one terminal reply, observable handlers a produced stream.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use thiserror::Error;

use tether_wire::WireError;

use crate::session::{ClientSession, SessionError};

/// Stream of produced values for an observable-shaped handler.
pub type ValueStream = BoxStream<'static, Result<Value, HandlerError>>;

/// Domain error raised by a service handler.
///
/// Encoded on the wire as `{message, code?}`; the stack field is reserved
/// for hosts that capture one.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub code: Option<String>,
    pub stack: Option<String>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            stack: None,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    pub(crate) fn to_wire(&self) -> WireError {
        let mut error = WireError::new(self.message.clone());
        if let Some(code) = &self.code {
            error = error.with_code(code.clone());
        }
        if let Some(stack) = &self.stack {
            error = error.with_stack(stack.clone());
        }
        error
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(e: serde_json::Error) -> Self {
        Self::new(format!("invalid arguments: {e}"))
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// What a handler produced. Must agree with the schema's declared shape.
pub enum HandlerReply {
    /// Fire-and-forget: nothing goes back.
    Void,
    /// One result value for a promise-shaped call.
    Value(Value),
    /// A stream of values for an observable-shaped call.
    Stream(ValueStream),
}

impl HandlerReply {
    pub fn value(value: impl Into<Value>) -> Self {
        HandlerReply::Value(value.into())
    }

    pub fn stream(stream: ValueStream) -> Self {
        HandlerReply::Stream(stream)
    }
}

/// Per-call context handed to every handler.
///
/// Carries the owning client's session. Handlers that hold interface-typed
/// arguments look the objects up through [`CallContext::object`] at use time
/// rather than pinning them; the session's registry stays authoritative, so
/// a client-side dispose releases the object promptly.
#[derive(Clone)]
pub struct CallContext {
    session: Arc<ClientSession>,
}

impl CallContext {
    pub(crate) fn new(session: Arc<ClientSession>) -> Self {
        Self { session }
    }

    pub fn client_id(&self) -> &str {
        self.session.client_id()
    }

    /// Resolve an interface-typed argument to the live object, if it is
    /// still registered.
    pub fn object(&self, object_id: u64) -> Option<Arc<dyn ServiceObject>> {
        self.session.object(object_id).map(|live| live.object)
    }

    /// Register a handler-created object under the calling client and return
    /// its id, for returning fresh handles from ordinary calls.
    pub fn register_object(
        &self,
        interface: impl Into<String>,
        object: Arc<dyn ServiceObject>,
    ) -> Result<u64, SessionError> {
        self.session.insert_object(interface.into(), object)
    }
}

/// A free function exposed over the transport.
#[async_trait]
pub trait FunctionHandler: Send + Sync {
    async fn invoke(&self, args: Vec<Value>, cx: CallContext) -> Result<HandlerReply, HandlerError>;
}

/// Constructor for a declared interface.
#[async_trait]
pub trait ObjectConstructor: Send + Sync {
    async fn construct(
        &self,
        args: Vec<Value>,
        cx: CallContext,
    ) -> Result<Arc<dyn ServiceObject>, HandlerError>;
}

/// A live remote object owned by one client.
#[async_trait]
pub trait ServiceObject: Send + Sync {
    /// Invoke a declared method.
    async fn call(
        &self,
        method: &str,
        args: Vec<Value>,
        cx: CallContext,
    ) -> Result<HandlerReply, HandlerError>;

    /// Invoked once when the object is disposed, explicitly or at client
    /// teardown.
    async fn dispose(&self) {}
}

/// A simple function-based handler
pub struct FnHandler<F>(F);

#[async_trait]
impl<F> FunctionHandler for FnHandler<F>
where
    F: Fn(Vec<Value>, CallContext) -> BoxFuture<'static, Result<HandlerReply, HandlerError>>
        + Send
        + Sync,
{
    async fn invoke(&self, args: Vec<Value>, cx: CallContext) -> Result<HandlerReply, HandlerError> {
        (self.0)(args, cx).await
    }
}

/// A simple closure-based constructor
pub struct FnConstructor<F>(F);

#[async_trait]
impl<F> ObjectConstructor for FnConstructor<F>
where
    F: Fn(Vec<Value>, CallContext) -> BoxFuture<'static, Result<Arc<dyn ServiceObject>, HandlerError>>
        + Send
        + Sync,
{
    async fn construct(
        &self,
        args: Vec<Value>,
        cx: CallContext,
    ) -> Result<Arc<dyn ServiceObject>, HandlerError> {
        (self.0)(args, cx).await
    }
}

/// Lookup tables for everything the schema exposes.
#[derive(Default)]
pub struct ServiceRegistry {
    functions: HashMap<String, Arc<dyn FunctionHandler>>,
    constructors: HashMap<String, Arc<dyn ObjectConstructor>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for a free function.
    pub fn register_function<H>(&mut self, name: impl Into<String>, handler: H)
    where
        H: FunctionHandler + 'static,
    {
        self.functions.insert(name.into(), Arc::new(handler));
    }

    /// Register a closure as a free-function handler.
    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(Vec<Value>, CallContext) -> BoxFuture<'static, Result<HandlerReply, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_function(name, FnHandler(f));
    }

    /// Register a constructor for a declared interface.
    pub fn register_interface<C>(&mut self, name: impl Into<String>, ctor: C)
    where
        C: ObjectConstructor + 'static,
    {
        self.constructors.insert(name.into(), Arc::new(ctor));
    }

    /// Register a closure as an interface constructor.
    pub fn register_ctor<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(
                Vec<Value>,
                CallContext,
            ) -> BoxFuture<'static, Result<Arc<dyn ServiceObject>, HandlerError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_interface(name, FnConstructor(f));
    }

    pub fn function(&self, name: &str) -> Option<Arc<dyn FunctionHandler>> {
        self.functions.get(name).cloned()
    }

    pub fn constructor(&self, name: &str) -> Option<Arc<dyn ObjectConstructor>> {
        self.constructors.get(name).cloned()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.keys().cloned().collect()
    }
}
