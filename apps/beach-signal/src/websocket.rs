use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header::SEC_WEBSOCKET_PROTOCOL, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::borrow::Cow;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::auth::{Admission, AuthError};
use crate::registry::PeerHandle;
use crate::relay::Relay;

/// Shared state handed to every connection and HTTP handler
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub admission: Admission,
}

impl AppState {
    pub fn new(relay: Relay, admission: Admission) -> Self {
        Self {
            relay: Arc::new(relay),
            admission,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// WebSocket upgrade handler; runs the admission gate before the handshake.
/// The query string is only read in query-token mode, and one that does not
/// parse counts as a missing token there.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    params: Option<Query<ConnectParams>>,
    State(state): State<AppState>,
) -> Response {
    let relay = state.relay.clone();
    match &state.admission {
        Admission::Open => ws.on_upgrade(move |socket| handle_socket(socket, relay, None)),
        Admission::QueryToken(authenticator) => {
            let token = params
                .and_then(|Query(params)| params.token)
                .unwrap_or_default();
            match authenticator.verify(&token).await {
                Ok(identity) => {
                    ws.on_upgrade(move |socket| handle_socket(socket, relay, Some(identity)))
                }
                Err(err) => {
                    warn!(
                        target: "beach-signal::auth",
                        error = %err,
                        "rejecting websocket handshake"
                    );
                    (
                        StatusCode::UNAUTHORIZED,
                        format!("Unauthorized: {}", err.reason()),
                    )
                        .into_response()
                }
            }
        }
        Admission::HeaderToken(authenticator) => {
            let mut offered = offered_protocols(&headers).into_iter();
            let selected = offered.next();
            let verdict = match offered.next() {
                Some(token) => authenticator.verify(&token).await,
                None => Err(AuthError::MissingToken),
            };
            let ws = match selected {
                Some(protocol) => ws.protocols([protocol]),
                None => ws,
            };
            match verdict {
                Ok(identity) => {
                    ws.on_upgrade(move |socket| handle_socket(socket, relay, Some(identity)))
                }
                Err(err) => {
                    warn!(
                        target: "beach-signal::auth",
                        error = %err,
                        "closing websocket: unauthorized"
                    );
                    ws.on_upgrade(close_unauthorized)
                }
            }
        }
    }
}

/// Values of the `Sec-WebSocket-Protocol` header, in the order offered
fn offered_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect()
}

async fn close_unauthorized(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: close_code::POLICY,
        reason: Cow::from("Unauthorized"),
    };
    if let Err(err) = socket.send(Message::Close(Some(frame))).await {
        debug!("failed to send unauthorized close frame: {}", err);
    }
}

/// Handle an admitted WebSocket connection
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, identity: Option<String>) {
    let (mut sender, mut receiver) = socket.split();

    // Frames for this peer, written by a dedicated task
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let peer = PeerHandle::new(tx);

    let connection = peer.id();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(err) = sender.send(Message::Text(frame)).await {
                warn!("WebSocket send error on connection {}: {}", connection, err);
                break;
            }
        }
        debug!("Message sender task ended for connection {}", connection);
    });

    info!("New WebSocket connection established: {}", connection);
    if let Some(identity) = identity {
        relay.admit(&identity, &peer);
    }

    while let Some(msg_result) = receiver.next().await {
        let msg = match msg_result {
            Ok(m) => m,
            Err(e) => {
                warn!("WebSocket error on connection {}: {}", connection, e);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                relay.handle_text(&peer, &text);
            }
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => {
                    relay.handle_text(&peer, &text);
                }
                Err(err) => {
                    debug!(
                        "Ignoring non-UTF8 binary frame on connection {}: {}",
                        connection, err
                    );
                }
            },
            Message::Close(_) => {
                debug!("Received Close frame on connection {}", connection);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    relay.disconnect(&peer);
    drop(peer);
    writer.abort();

    debug!("WebSocket disconnected: {}", connection);
}
