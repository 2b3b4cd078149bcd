//! WebSocket plane: upgrade handling and per-socket read/write loops.
//!
//! The RPC channel shares the listening port with the HTTP plane; a request
//! carrying WebSocket upgrade headers is switched here. After the upgrade the
//! first text frame must be the bare client identifier; only then does the
//! socket attach to (or create) the client session.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::upgrade::Upgraded;
use hyper::{header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, warn};

use tether_wire::codec;

use crate::server::{HttpBody, ServerState};

type ServerSocket = WebSocketStream<TokioIo<Upgraded>>;

/// Does this request ask for a WebSocket upgrade?
pub(crate) fn is_websocket_upgrade<B>(req: &Request<B>) -> bool {
    let connection_has_upgrade = req
        .headers()
        .get(header::CONNECTION)
        .and_then(|value| value.to_str().ok())
        .map(|value| {
            value
                .split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        })
        .unwrap_or(false);
    let upgrade_is_websocket = req
        .headers()
        .get(header::UPGRADE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    connection_has_upgrade
        && upgrade_is_websocket
        && req.headers().contains_key(header::SEC_WEBSOCKET_KEY)
}

/// Answer the upgrade and hand the raw socket to the RPC plane.
pub(crate) fn handle_upgrade(mut req: Request<Incoming>, state: Arc<ServerState>) -> Response<HttpBody> {
    let Some(key) = req.headers().get(header::SEC_WEBSOCKET_KEY) else {
        return bad_request("missing Sec-WebSocket-Key");
    };
    let accept = derive_accept_key(key.as_bytes());

    tokio::spawn(async move {
        match hyper::upgrade::on(&mut req).await {
            Ok(upgraded) => {
                let socket = WebSocketStream::from_raw_socket(
                    TokioIo::new(upgraded),
                    Role::Server,
                    None,
                )
                .await;
                run_connection(socket, state).await;
            }
            Err(e) => warn!("websocket upgrade failed: {e}"),
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "websocket")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept)
        .body(empty_body())
        .unwrap()
}

fn empty_body() -> HttpBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed_unsync()
}

fn bad_request(reason: &'static str) -> Response<HttpBody> {
    Response::builder()
        .status(StatusCode::BAD_REQUEST)
        .body(
            Full::new(Bytes::from(reason))
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .unwrap()
}

/// First data frame must be the bare client identifier.
async fn read_handshake(stream: &mut SplitStream<ServerSocket>) -> Option<String> {
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(id)) => return Some(id),
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => continue,
            _ => return None,
        }
    }
    None
}

/// Drive one attached socket: writer task fed by the session, reader loop
/// feeding the dispatcher. On exit only the socket detaches; the session
/// and everything it owns survive for a reconnect.
async fn run_connection(socket: ServerSocket, state: Arc<ServerState>) {
    let (mut sink, mut stream) = socket.split();

    let client_id =
        match tokio::time::timeout(state.config.rpc_timeout, read_handshake(&mut stream)).await {
            Ok(Some(id)) if !id.is_empty() => id,
            Ok(_) => {
                warn!("socket closed before client-id handshake");
                return;
            }
            Err(_) => {
                warn!("client-id handshake timed out");
                let _ = sink.close().await;
                return;
            }
        };

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (session, generation) = match state.sessions.attach(&client_id, tx).await {
        Ok(attached) => attached,
        Err(e) => {
            warn!(client_id, "refusing socket: {e}");
            let _ = sink.close().await;
            return;
        }
    };
    info!(client_id = %session.client_id(), "client socket attached");

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        // Channel closed: the session was replaced or torn down.
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => match codec::decode_frame(&text) {
                Ok(frame) => state.dispatcher.handle_frame(&session, frame),
                Err(e) => warn!(client_id = %session.client_id(), "dropping frame: {e}"),
            },
            Ok(Message::Binary(_)) => {
                warn!(client_id = %session.client_id(), "dropping binary frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(client_id = %session.client_id(), "socket read error: {e}");
                break;
            }
        }
    }

    session.detach(generation);
    writer.abort();
    debug!(client_id = %session.client_id(), "client socket detached");
}
