//! WebSocket chat endpoint.
//!
//! Server → client frames: every bus event (wrapped as `type: "event"`),
//! plus `session_created`, `response`, `cancelled`, `error`, and `pong`.
//! Client → server frames: `chat`, `cancel`, `ping`.

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use gp_domain::bus::handler;

use crate::state::AppState;

/// GET /api/chat/ws — upgrade to WebSocket.
pub async fn chat_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("websocket client connected");
    let (mut ws_sink, mut ws_stream) = socket.split();

    // All outbound frames funnel through one channel so event forwarding
    // and request handling never interleave partial writes.
    let (tx, mut rx) = mpsc::channel::<Value>(256);

    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = frame.to_string();
            if ws_sink.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
    });

    // Forward every bus event to this client.
    let event_tx = tx.clone();
    let subscription = state.bus.on_all(handler(move |event| {
        let event_tx = event_tx.clone();
        async move {
            let _ = event_tx
                .send(json!({
                    "type": "event",
                    "event_type": event.event_type.as_str(),
                    "data": event.data,
                    "session_id": event.session_id,
                    "timestamp": event.timestamp,
                }))
                .await;
            Ok(())
        }
    }));

    while let Some(Ok(msg)) = ws_stream.next().await {
        match msg {
            WsMessage::Text(text) => match serde_json::from_str::<Value>(&text) {
                Ok(frame) => handle_frame(&state, &tx, frame).await,
                Err(_) => {
                    let _ = tx.send(json!({ "type": "error", "error": "Invalid JSON" })).await;
                }
            },
            WsMessage::Close(_) => break,
            _ => {}
        }
    }

    subscription.unsubscribe();
    writer.abort();
    tracing::info!("websocket client disconnected");
}

async fn handle_frame(state: &AppState, tx: &mpsc::Sender<Value>, frame: Value) {
    let frame_type = frame.get("type").and_then(|v| v.as_str()).unwrap_or("");

    match frame_type {
        "chat" => {
            let message = frame
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_owned();
            if message.is_empty() {
                let _ = tx
                    .send(json!({ "type": "error", "error": "message is required" }))
                    .await;
                return;
            }

            let session_id = match frame.get("session_id").and_then(|v| v.as_str()) {
                Some(id) => id.to_owned(),
                None => match state.sessions.create_session("WS Session") {
                    Ok(id) => {
                        let _ = tx
                            .send(json!({ "type": "session_created", "session_id": id }))
                            .await;
                        id
                    }
                    Err(e) => {
                        let _ = tx
                            .send(json!({ "type": "error", "error": e.to_string() }))
                            .await;
                        return;
                    }
                },
            };

            // Run in the background so this client can keep sending
            // frames (e.g. a cancel) while the turn is in flight.
            let state = state.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                match state.agent.run(&session_id, &message).await {
                    Ok(content) => {
                        let _ = tx
                            .send(json!({
                                "type": "response",
                                "session_id": session_id,
                                "content": content,
                            }))
                            .await;
                    }
                    Err(e) => {
                        tracing::error!(session_id, error = %e, "ws chat failed");
                        let _ = tx
                            .send(json!({
                                "type": "error",
                                "session_id": session_id,
                                "error": e.to_string(),
                            }))
                            .await;
                    }
                }
            });
        }

        "cancel" => {
            if let Some(session_id) = frame.get("session_id").and_then(|v| v.as_str()) {
                state.agent.cancel(session_id);
                let _ = tx
                    .send(json!({ "type": "cancelled", "session_id": session_id }))
                    .await;
            }
        }

        "ping" => {
            let _ = tx.send(json!({ "type": "pong" })).await;
        }

        other => {
            tracing::debug!(frame_type = other, "ignoring unknown ws frame");
        }
    }
}
