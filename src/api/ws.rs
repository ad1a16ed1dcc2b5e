//! WebSocket fan-out (§4.5): every connection gets its own Event Bus
//! subscription and receives every `weight_update`/lifecycle message
//! published while it's attached, with a heartbeat ping on idle.
//!
//! Dispatch shape grounded on the `alloy-transport` WS server: upgrade,
//! `socket.split()`, a send-side task driven by the subscription stream.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use tracing::debug;

use crate::api::auth::ApiKeyQuery;
use crate::AppState;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close code used by most WS libraries for application-level auth failure;
/// not one of the reserved RFC 6455 codes.
const CLOSE_AUTH_FAILED: u16 = 4401;

pub async fn handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ApiKeyQuery>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, query.api_key))
}

async fn handle_socket(socket: WebSocket, state: AppState, api_key: Option<String>) {
    let (mut tx, mut rx) = socket.split();

    if api_key.as_deref() != Some(state.config.api_key.as_str()) {
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_AUTH_FAILED,
                reason: "invalid api key".into(),
            })))
            .await;
        return;
    }

    let mut subscription = state.manager.subscribe();
    let sub_id = subscription.id;
    debug!(%sub_id, "websocket client attached");

    loop {
        tokio::select! {
            incoming = rx.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {
                        // clients don't send anything meaningful; ignore and keep streaming
                    }
                    Some(Err(_)) => break,
                }
            }
            message = subscription.recv() => {
                match message {
                    Some(value) => {
                        let text = value.to_string();
                        if tx.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {
                if tx.send(Message::Text(r#"{"type":"ping"}"#.to_string())).await.is_err() {
                    break;
                }
            }
        }
    }

    state.manager.unsubscribe(sub_id);
    debug!(%sub_id, "websocket client detached");
}
