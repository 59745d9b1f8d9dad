use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::{SinkExt, StreamExt};
use pylon_broker::dispatch;
use pylon_core::config::{LIVENESS_CHECK_SECS, MAX_PAYLOAD_BYTES};
use pylon_core::PylonError;
use pylon_protocol::{Command, Reply, Role};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::app::AppState;
use crate::ws::{auth, send};

#[derive(Debug, Deserialize)]
pub struct SenderQuery {
    pub token: Option<String>,
}

/// Axum handler — upgrades HTTP to WebSocket at GET /ws (client role).
pub async fn client_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| run_connection(socket, state, Role::Client))
}

/// GET /ws/sender — token-gated. A bad token aborts the handshake with 401
/// before any session state exists.
pub async fn sender_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<SenderQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    if let Err(e) = auth::verify_sender(&headers, query.token.as_deref(), &state.config) {
        warn!(reason = %e, "sender handshake rejected");
        return (StatusCode::UNAUTHORIZED, Json(Reply::error(&e))).into_response();
    }
    ws.on_upgrade(|socket| run_connection(socket, state, Role::Sender))
        .into_response()
}

/// Per-connection event loop — lives for the entire WS session.
async fn run_connection(socket: WebSocket, state: Arc<AppState>, role: Role) {
    let (mut tx, mut rx) = socket.split();

    let (delivery_tx, mut delivery_rx) = tokio::sync::mpsc::unbounded_channel();
    let conn_id = match state.broker.register(role, delivery_tx) {
        Ok(id) => id,
        Err(e) => {
            // over the cap: structured error, closed immediately, never counted
            warn!(code = e.code(), "connection refused");
            let _ = send::json(&mut tx, &Reply::error(&e)).await;
            let _ = tx.close().await;
            return;
        }
    };
    info!(conn_id = %conn_id, ?role, "new WS connection");

    let liveness_timeout = state.broker.liveness_timeout();
    let mut last_active = tokio::time::Instant::now();
    // Check at least twice per timeout window so short configured timeouts
    // still get probed before they expire.
    let tick_period = Duration::from_secs(LIVENESS_CHECK_SECS)
        .min(liveness_timeout / 2)
        .max(Duration::from_millis(50));
    let mut tick = tokio::time::interval(tick_period);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            msg = rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_active = tokio::time::Instant::now();
                        if text.len() > MAX_PAYLOAD_BYTES {
                            warn!(conn_id = %conn_id, size = text.len(), "payload too large");
                            let err = PylonError::BadCommand("payload too large".to_string());
                            if send::json(&mut tx, &Reply::error(&err)).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        let reply = match serde_json::from_str::<Command>(&text) {
                            Ok(cmd) => dispatch::handle(&state.broker, &conn_id, cmd),
                            Err(e) => {
                                Reply::error(&PylonError::BadCommand(e.to_string()))
                            }
                        };
                        if send::json(&mut tx, &reply).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_active = tokio::time::Instant::now();
                        let _ = tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    // pongs answering our liveness pings (and any other frame)
                    // keep passive subscribers alive
                    Some(Ok(_)) => {
                        last_active = tokio::time::Instant::now();
                    }
                }
            }

            delivery = delivery_rx.recv() => {
                match delivery {
                    Some(msg) => {
                        if send::json(&mut tx, &msg.delivery()).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }

            _ = tick.tick() => {
                if last_active.elapsed() > liveness_timeout {
                    info!(conn_id = %conn_id, "idle connection reaped");
                    break;
                }
                // probe the peer; the pong refreshes last_active above
                if tx.send(Message::Ping(Default::default())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.broker.unregister(&conn_id);
    info!(conn_id = %conn_id, "WS connection closed");
}
