//! Server-side record of one logical client.
//!
//! A [`ClientSession`] outlives individual sockets: a socket drop only
//! detaches it, and a reconnect with the same client identifier re-attaches.
//! Live objects, live subscriptions, and queued outbound frames all survive
//! the churn. Only logical teardown (explicit close, idle expiry, fatal
//! error) releases them.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::service::ServiceObject;

#[derive(Debug, Clone, Error)]
pub enum SessionError {
    /// The per-client outbound queue cap was exceeded.
    #[error("outbound queue full ({0} frames)")]
    Backpressure(usize),

    /// The logical client was torn down.
    #[error("client session closed")]
    Closed,
}

/// A live object plus the interface it was constructed under.
#[derive(Clone)]
pub struct LiveObject {
    pub interface: String,
    pub object: Arc<dyn ServiceObject>,
}

struct SocketHandle {
    tx: mpsc::UnboundedSender<String>,
    generation: u64,
}

struct SessionInner {
    socket: Option<SocketHandle>,
    /// Frames awaiting a live socket; drained strictly in insertion order.
    queue: VecDeque<String>,
    /// Ordered by id, which is creation order; teardown walks it in reverse.
    objects: BTreeMap<u64, LiveObject>,
    subscriptions: HashMap<u64, AbortHandle>,
    detached_at: Option<Instant>,
    next_generation: u64,
    closed: bool,
}

/// Server-side state for one client identifier.
pub struct ClientSession {
    client_id: String,
    next_object_id: AtomicU64,
    max_queue: usize,
    inner: Mutex<SessionInner>,
}

impl ClientSession {
    pub fn new(client_id: impl Into<String>, max_queue: usize) -> Self {
        Self {
            client_id: client_id.into(),
            next_object_id: AtomicU64::new(1),
            max_queue,
            inner: Mutex::new(SessionInner {
                socket: None,
                queue: VecDeque::new(),
                objects: BTreeMap::new(),
                subscriptions: HashMap::new(),
                detached_at: Some(Instant::now()),
                next_generation: 0,
                closed: false,
            }),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Attach a fresh socket, replacing any previous one. The previous
    /// socket's writer sees its channel close and shuts the sink down; the
    /// session itself survives. Queued frames flush in insertion order.
    pub fn attach(&self, tx: mpsc::UnboundedSender<String>) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        if inner.socket.is_some() {
            debug!(client_id = %self.client_id, "replacing previous socket");
        }
        while let Some(frame) = inner.queue.pop_front() {
            if tx.send(frame).is_err() {
                warn!(client_id = %self.client_id, "socket died during queue flush");
                break;
            }
        }
        inner.socket = Some(SocketHandle { tx, generation });
        inner.detached_at = None;
        Ok(generation)
    }

    /// Drop the socket attached under `generation`. A newer attachment wins:
    /// a stale reader detaching after replacement is a no-op.
    pub fn detach(&self, generation: u64) {
        let mut inner = self.inner.lock();
        match &inner.socket {
            Some(handle) if handle.generation == generation => {
                inner.socket = None;
                inner.detached_at = Some(Instant::now());
            }
            _ => {}
        }
    }

    pub fn is_attached(&self) -> bool {
        self.inner.lock().socket.is_some()
    }

    /// How long the session has sat without a socket, if it is detached.
    pub fn detached_for(&self) -> Option<Duration> {
        self.inner.lock().detached_at.map(|at| at.elapsed())
    }

    /// Enqueue one outbound frame. With a socket attached it is handed to
    /// the writer immediately; otherwise it is held (up to the cap) for the
    /// next attachment.
    pub fn send(&self, frame: String) -> Result<(), SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        if let Some(handle) = &inner.socket {
            match handle.tx.send(frame) {
                Ok(()) => return Ok(()),
                Err(failed) => {
                    // Writer is gone but nobody detached yet; fall back to
                    // queueing the frame it handed back.
                    inner.socket = None;
                    inner.detached_at = Some(Instant::now());
                    if inner.queue.len() >= self.max_queue {
                        return Err(SessionError::Backpressure(self.max_queue));
                    }
                    inner.queue.push_back(failed.0);
                    return Ok(());
                }
            }
        }
        if inner.queue.len() >= self.max_queue {
            return Err(SessionError::Backpressure(self.max_queue));
        }
        inner.queue.push_back(frame);
        Ok(())
    }

    /// Register a live object; ids are monotonic per session, so iteration
    /// order is creation order.
    pub fn insert_object(
        &self,
        interface: String,
        object: Arc<dyn ServiceObject>,
    ) -> Result<u64, SessionError> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(SessionError::Closed);
        }
        let object_id = self.next_object_id.fetch_add(1, Ordering::SeqCst);
        inner.objects.insert(object_id, LiveObject { interface, object });
        Ok(object_id)
    }

    pub fn object(&self, object_id: u64) -> Option<LiveObject> {
        self.inner.lock().objects.get(&object_id).cloned()
    }

    /// Remove an object from the registry. Dispose is idempotent: a second
    /// removal finds nothing and disposes nothing else.
    pub fn remove_object(&self, object_id: u64) -> Option<LiveObject> {
        self.inner.lock().objects.remove(&object_id)
    }

    /// Track a live subscription under its request id. If the session is
    /// already closed the producer is aborted on the spot.
    pub fn insert_subscription(&self, request_id: u64, handle: AbortHandle) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            handle.abort();
            return;
        }
        inner.subscriptions.insert(request_id, handle);
    }

    pub fn remove_subscription(&self, request_id: u64) -> Option<AbortHandle> {
        self.inner.lock().subscriptions.remove(&request_id)
    }

    pub fn object_count(&self) -> usize {
        self.inner.lock().objects.len()
    }

    pub fn subscription_count(&self) -> usize {
        self.inner.lock().subscriptions.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    #[cfg(test)]
    pub(crate) fn queued_frames(&self) -> Vec<String> {
        self.inner.lock().queue.iter().cloned().collect()
    }

    /// Logical teardown: cancel every live subscription, dispose every live
    /// object in LIFO order of creation, drop the socket and the queue.
    pub async fn teardown(&self) {
        let (subscriptions, objects) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.closed = true;
            inner.socket = None;
            inner.queue.clear();
            let subscriptions: Vec<AbortHandle> =
                inner.subscriptions.drain().map(|(_, handle)| handle).collect();
            let objects: Vec<LiveObject> = std::mem::take(&mut inner.objects)
                .into_values()
                .rev()
                .collect();
            (subscriptions, objects)
        };
        for handle in subscriptions {
            handle.abort();
        }
        for live in objects {
            live.object.dispose().await;
        }
        info!(client_id = %self.client_id, "client session torn down");
    }
}

/// All client sessions, keyed by client identifier.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<ClientSession>>>,
    max_queue: usize,
}

impl SessionRegistry {
    pub fn new(max_queue: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_queue,
        }
    }

    /// Get or create the session for `client_id` and attach the socket.
    pub async fn attach(
        &self,
        client_id: &str,
        tx: mpsc::UnboundedSender<String>,
    ) -> Result<(Arc<ClientSession>, u64), SessionError> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(client_id.to_string())
            .or_insert_with(|| {
                debug!(client_id, "creating client session");
                Arc::new(ClientSession::new(client_id, self.max_queue))
            })
            .clone();
        let generation = session.attach(tx)?;
        Ok((session, generation))
    }

    pub async fn get(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.read().await.get(client_id).cloned()
    }

    pub async fn remove(&self, client_id: &str) -> Option<Arc<ClientSession>> {
        self.sessions.write().await.remove(client_id)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Remove and return sessions that have sat detached longer than `idle`.
    /// The caller tears them down outside the registry lock.
    pub async fn expire_idle(&self, idle: Duration) -> Vec<Arc<ClientSession>> {
        let mut sessions = self.sessions.write().await;
        let mut expired = Vec::new();
        sessions.retain(|_, session| match session.detached_for() {
            Some(elapsed) if elapsed >= idle => {
                expired.push(Arc::clone(session));
                false
            }
            _ => true,
        });
        expired
    }

    /// Remove and return every session (shutdown path).
    pub async fn drain_all(&self) -> Vec<Arc<ClientSession>> {
        let mut sessions = self.sessions.write().await;
        sessions.drain().map(|(_, session)| session).collect()
    }
}
