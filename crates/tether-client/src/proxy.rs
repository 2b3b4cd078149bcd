//! Caller-side handles for server-owned objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::watch;

use crate::dispatcher::{ClientDispatcher, Inner};
use crate::error::{ClientError, ClientResult};
use crate::subscription::Subscription;

/// Resolution state of a proxy's object identifier.
///
/// Construction is itself an RPC, so a proxy exists before its id is known;
/// outbound method calls serialize behind the resolution.
#[derive(Clone)]
enum IdState {
    Pending,
    Ready(u64),
    Failed(ClientError),
}

struct ProxyInner {
    interface: String,
    dispatcher: Weak<Inner>,
    id: watch::Receiver<IdState>,
    disposed: AtomicBool,
}

/// Handle to a remote object addressable by `objectId`.
///
/// Cheap to clone; all clones share the disposed flag, so disposing through
/// any handle invalidates the others.
#[derive(Clone)]
pub struct RemoteProxy {
    inner: Arc<ProxyInner>,
}

/// Write half used by the dispatcher to settle a pending proxy's id.
pub(crate) struct ProxyResolver {
    tx: watch::Sender<IdState>,
}

impl ProxyResolver {
    pub(crate) fn resolve(self, object_id: u64) {
        let _ = self.tx.send(IdState::Ready(object_id));
    }

    pub(crate) fn fail(self, error: ClientError) {
        let _ = self.tx.send(IdState::Failed(error));
    }
}

impl RemoteProxy {
    /// A proxy whose id is not yet known (the `NewObject` call is in flight).
    pub(crate) fn pending(interface: &str, dispatcher: Weak<Inner>) -> (Self, ProxyResolver) {
        let (tx, rx) = watch::channel(IdState::Pending);
        let proxy = Self {
            inner: Arc::new(ProxyInner {
                interface: interface.to_string(),
                dispatcher,
                id: rx,
                disposed: AtomicBool::new(false),
            }),
        };
        (proxy, ProxyResolver { tx })
    }

    /// A proxy reconstructed from an id that arrived over the wire.
    pub(crate) fn resolved(interface: &str, object_id: u64, dispatcher: Weak<Inner>) -> Self {
        let (_tx, rx) = watch::channel(IdState::Ready(object_id));
        Self {
            inner: Arc::new(ProxyInner {
                interface: interface.to_string(),
                dispatcher,
                id: rx,
                disposed: AtomicBool::new(false),
            }),
        }
    }

    pub fn interface(&self) -> &str {
        &self.inner.interface
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_disposed(&self) {
        self.inner.disposed.store(true, Ordering::Release);
    }

    /// The resolved object identifier; waits for the `NewObject` reply when
    /// necessary.
    pub async fn object_id(&self) -> ClientResult<u64> {
        if self.is_disposed() {
            return Err(ClientError::ObjectDisposed);
        }
        let mut rx = self.inner.id.clone();
        loop {
            match rx.borrow().clone() {
                IdState::Ready(id) => return Ok(id),
                IdState::Failed(e) => return Err(e),
                IdState::Pending => {}
            }
            rx.changed().await.map_err(|_| ClientError::Closed)?;
        }
    }

    /// The resolved id as a wire value, for passing this handle as an
    /// interface-typed argument.
    pub async fn as_arg(&self) -> ClientResult<Value> {
        Ok(Value::from(self.object_id().await?))
    }

    /// Promise-shaped method call.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> ClientResult<Value> {
        let (dispatcher, object_id) = self.bind().await?;
        dispatcher
            .call_method(&self.inner.interface, object_id, method, args)
            .await
    }

    /// Fire-and-forget method call.
    pub async fn call_void(&self, method: &str, args: Vec<Value>) -> ClientResult<()> {
        let (dispatcher, object_id) = self.bind().await?;
        dispatcher.call_method_void(&self.inner.interface, object_id, method, args)
    }

    /// Observable-shaped method call.
    pub async fn subscribe(&self, method: &str, args: Vec<Value>) -> ClientResult<Subscription> {
        let (dispatcher, object_id) = self.bind().await?;
        dispatcher.subscribe_method(&self.inner.interface, object_id, method, args)
    }

    /// Dispose the remote object. Later method calls through any clone of
    /// this handle fail locally with [`ClientError::ObjectDisposed`].
    pub async fn dispose(&self) -> ClientResult<()> {
        let object_id = self.object_id().await?;
        let dispatcher = self.dispatcher()?;
        self.mark_disposed();
        dispatcher.dispose_object(object_id).await
    }

    async fn bind(&self) -> ClientResult<(ClientDispatcher, u64)> {
        let object_id = self.object_id().await?;
        Ok((self.dispatcher()?, object_id))
    }

    fn dispatcher(&self) -> ClientResult<ClientDispatcher> {
        match self.inner.dispatcher.upgrade() {
            Some(inner) => Ok(ClientDispatcher::from_inner(inner)),
            None => Err(ClientError::Closed),
        }
    }
}

impl std::fmt::Debug for RemoteProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProxy")
            .field("interface", &self.inner.interface)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolved_proxy_yields_id() {
        let proxy = RemoteProxy::resolved("Session", 7, Weak::new());
        assert_eq!(proxy.object_id().await.unwrap(), 7);
        assert_eq!(proxy.as_arg().await.unwrap(), Value::from(7));
    }

    #[tokio::test]
    async fn test_pending_proxy_waits_for_resolution() {
        let (proxy, resolver) = RemoteProxy::pending("Session", Weak::new());
        let waiter = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.object_id().await }
        });
        resolver.resolve(42);
        assert_eq!(waiter.await.unwrap().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_failed_resolution_propagates() {
        let (proxy, resolver) = RemoteProxy::pending("Session", Weak::new());
        resolver.fail(ClientError::Closed);
        assert!(matches!(
            proxy.object_id().await,
            Err(ClientError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_disposed_flag_is_shared_across_clones() {
        let proxy = RemoteProxy::resolved("Session", 7, Weak::new());
        let clone = proxy.clone();
        proxy.mark_disposed();
        assert!(clone.is_disposed());
        assert!(matches!(
            clone.object_id().await,
            Err(ClientError::ObjectDisposed)
        ));
    }

    #[tokio::test]
    async fn test_call_on_dead_dispatcher_is_closed() {
        let proxy = RemoteProxy::resolved("Session", 7, Weak::new());
        assert!(matches!(
            proxy.call("title", vec![]).await,
            Err(ClientError::Closed)
        ));
    }
}
