//! Server-streamed results on the caller side.

use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::dispatcher::Inner;
use crate::error::ClientResult;

/// One live observable call.
///
/// Yields decoded values in emission order; ends after the terminal frame
/// (`None` for clean completion, one `Err` item for failure). Dropping an
/// unfinished subscription unsubscribes: a `DisposeObservable` frame is sent
/// and the local table entry removed. Late `next` frames between unsubscribe
/// and the server observing the dispose are dropped by the dispatcher.
pub struct Subscription {
    request_id: u64,
    rx: mpsc::UnboundedReceiver<ClientResult<Value>>,
    inner: Weak<Inner>,
    terminated: bool,
}

impl Subscription {
    pub(crate) fn new(
        request_id: u64,
        rx: mpsc::UnboundedReceiver<ClientResult<Value>>,
        inner: Weak<Inner>,
    ) -> Self {
        Self {
            request_id,
            rx,
            inner,
            terminated: false,
        }
    }

    /// The request identifier this subscription was opened under.
    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    /// Next stream item; `None` once the stream completed.
    pub async fn next(&mut self) -> Option<ClientResult<Value>> {
        let item = self.rx.recv().await;
        self.note(&item);
        item
    }

    /// Cancel the subscription explicitly.
    pub fn unsubscribe(self) {
        // Drop does the work.
    }

    fn note(&mut self, item: &Option<ClientResult<Value>>) {
        match item {
            None | Some(Err(_)) => self.terminated = true,
            Some(Ok(_)) => {}
        }
    }

    fn cancel(&mut self) {
        if self.terminated {
            return;
        }
        self.terminated = true;
        if let Some(inner) = self.inner.upgrade() {
            inner.cancel_subscription(self.request_id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl futures_util::Stream for Subscription {
    type Item = ClientResult<Value>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.rx.poll_recv(cx) {
            Poll::Ready(item) => {
                this.note(&item);
                Poll::Ready(item)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
