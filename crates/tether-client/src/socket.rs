//! Client half of the socket session.
//!
//! Owns one logical connection to the server: a tokio-tungstenite WebSocket
//! plus the outbound queue that survives socket churn. `send` never blocks;
//! frames accepted while no socket is attached are held (up to the configured
//! cap) and flushed in insertion order once the next attachment completes its
//! handshake. Frames already handed to a socket when it drops may be lost;
//! the transport is at-most-once, so they are never re-sent.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Notify};
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, warn};

use tether_wire::{codec, Frame};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};

/// Stream of parsed inbound frames, in arrival order.
pub type InboundFrames = mpsc::UnboundedReceiver<Frame>;

/// One logical client connection, resilient to socket churn.
#[derive(Clone)]
pub struct SocketSession {
    shared: Arc<Shared>,
}

struct Shared {
    config: ClientConfig,
    queue: Mutex<VecDeque<String>>,
    /// Wakes the writer when a frame is queued or the session closes.
    notify: Notify,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Pop the next outbound frame, waiting for one; `None` when closed.
    async fn next_frame(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return None;
            }
            if let Some(frame) = self.queue.lock().pop_front() {
                return Some(frame);
            }
            notified.await;
        }
    }
}

impl SocketSession {
    /// Start the session. Connection (and every reconnection) happens in a
    /// background task; the returned receiver yields inbound frames.
    pub fn connect(config: ClientConfig) -> ClientResult<(Self, InboundFrames)> {
        config.validate()?;

        let (connected, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            connected,
            closed: AtomicBool::new(false),
        });

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_loop(Arc::clone(&shared), inbound_tx));

        Ok((Self { shared }, inbound_rx))
    }

    /// Enqueue one frame; returns immediately. Delivery is best-effort.
    pub fn send(&self, text: String) -> ClientResult<()> {
        if self.shared.is_closed() {
            return Err(ClientError::Closed);
        }
        {
            let mut queue = self.shared.queue.lock();
            if queue.len() >= self.shared.config.max_outbound_queue {
                return Err(ClientError::Backpressure(
                    self.shared.config.max_outbound_queue,
                ));
            }
            queue.push_back(text);
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Observe attach/detach transitions.
    pub fn connection_events(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.subscribe().borrow()
    }

    /// Wait until a socket is attached and the handshake frame was sent.
    pub async fn wait_connected(&self) -> ClientResult<()> {
        let mut events = self.connection_events();
        loop {
            if *events.borrow() {
                return Ok(());
            }
            if self.shared.is_closed() {
                return Err(ClientError::Closed);
            }
            events.changed().await.map_err(|_| ClientError::Closed)?;
        }
    }

    pub fn client_id(&self) -> &str {
        &self.shared.config.client_id
    }

    pub fn rpc_timeout(&self) -> std::time::Duration {
        self.shared.config.rpc_timeout
    }

    /// Terminate the session and release all resources.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared.notify.notify_waiters();
        self.shared.connected.send_replace(false);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

/// Connect, drive, back off, repeat until the session closes.
async fn run_loop(shared: Arc<Shared>, inbound: mpsc::UnboundedSender<Frame>) {
    let mut backoff = shared.config.reconnect_initial;
    loop {
        if shared.is_closed() {
            break;
        }
        match tokio_tungstenite::connect_async(shared.config.endpoint.as_str()).await {
            Ok((stream, _response)) => {
                debug!(endpoint = %shared.config.endpoint, "socket attached");
                backoff = shared.config.reconnect_initial;
                if let Err(e) = drive(&shared, stream, &inbound).await {
                    debug!("socket detached: {e}");
                }
                shared.connected.send_replace(false);
            }
            Err(e) => {
                debug!(endpoint = %shared.config.endpoint, "connect failed: {e}");
            }
        }
        if shared.is_closed() {
            break;
        }
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(shared.config.reconnect_max);
    }
    shared.connected.send_replace(false);
    debug!("socket session ended");
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Run one attached socket to completion.
async fn drive(
    shared: &Arc<Shared>,
    stream: WsStream,
    inbound: &mpsc::UnboundedSender<Frame>,
) -> Result<(), tungstenite::Error> {
    let (mut sink, mut stream) = stream.split();

    // Handshake: one bare text frame carrying the client identifier, before
    // any JSON frame.
    sink.send(Message::Text(shared.config.client_id.clone()))
        .await?;
    shared.connected.send_replace(true);

    let writer = {
        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            while let Some(text) = shared.next_frame().await {
                if sink.send(Message::Text(text)).await.is_err() {
                    // The frame was in flight when the socket died; the
                    // at-most-once contract forbids re-sending it.
                    break;
                }
            }
            let _ = sink.send(Message::Close(None)).await;
        })
    };

    let result = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match codec::decode_frame(&text) {
                Ok(frame) => {
                    if inbound.send(frame).is_err() {
                        break Ok(());
                    }
                }
                Err(e) => warn!("dropping inbound frame: {e}"),
            },
            Some(Ok(Message::Binary(_))) => warn!("dropping binary frame"),
            Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
            Some(Ok(Message::Close(_))) | None => break Ok(()),
            Some(Err(e)) => break Err(e),
        }
        if shared.is_closed() {
            break Ok(());
        }
    };

    writer.abort();
    result
}
