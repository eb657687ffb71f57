// ABOUTME: Bidirectional framed transport binding for multi-turn chat over WebSocket
// ABOUTME: Auth handshake, chat turns, ping/pong, and mid-turn cancellation frames
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2026 Async-IO.org

//! # WebSocket Chat Binding
//!
//! Persistent framed transport carrying the same turn semantics as the SSE
//! binding. The client authenticates first (`auth`), then sends `chat`
//! frames; server frames mirror the SSE event shapes plus a `sessionId`
//! field. `ping` is answered with `pong`; a `cancel` frame aborts the
//! session's in-flight turn, which is finalised as cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc::unbounded_channel, mpsc::UnboundedSender, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::models::Principal;
use crate::orchestrator::{CancelHandle, EventBuffer, TurnRequest};
use crate::server::ServerResources;

/// Client-to-server frames
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
enum ClientFrame {
    /// Bearer authentication, required before anything else
    Auth {
        /// JWT bearer token
        token: String,
    },
    /// One chat turn
    Chat {
        /// Target session id
        session_id: String,
        /// User message content
        message: String,
        /// Provider override for this turn
        #[serde(default)]
        provider_override: Option<String>,
    },
    /// Liveness probe
    Ping,
    /// Cancel the in-flight turn of a session (or all, when omitted)
    Cancel {
        /// Session whose turn to cancel
        #[serde(default)]
        session_id: Option<String>,
    },
}

/// WebSocket chat routes
pub fn websocket_routes(resources: Arc<ServerResources>) -> Router {
    Router::new()
        .route("/ws/chat", get(upgrade))
        .with_state(resources)
}

async fn upgrade(
    State(resources): State<Arc<ServerResources>>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, resources))
}

/// Drive one WebSocket connection to completion
async fn handle_connection(socket: WebSocket, resources: Arc<ServerResources>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = unbounded_channel::<Message>();

    // Writer task: everything the connection sends funnels through `tx`
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    let mut principal: Option<Principal> = None;
    let in_flight: Arc<Mutex<HashMap<Uuid, CancelHandle>>> = Arc::new(Mutex::new(HashMap::new()));

    while let Some(frame) = ws_rx.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };

        match serde_json::from_str::<ClientFrame>(&text) {
            Ok(ClientFrame::Auth { token }) => {
                match resources.auth.validate_token(&token) {
                    Ok(validated) => {
                        principal = Some(validated);
                        send_json(&tx, &json!({ "type": "auth_success" }));
                    }
                    Err(e) => {
                        send_json(
                            &tx,
                            &json!({ "type": "auth_error", "message": e.sanitized_message() }),
                        );
                        break;
                    }
                }
            }
            Ok(ClientFrame::Ping) => {
                send_json(&tx, &json!({ "type": "pong" }));
            }
            Ok(ClientFrame::Cancel { session_id }) => {
                let targets = session_id.and_then(|raw| Uuid::parse_str(&raw).ok());
                let mut turns = in_flight.lock().await;
                match targets {
                    Some(session_id) => {
                        if let Some(handle) = turns.remove(&session_id) {
                            handle.cancel();
                            info!(session_id = %session_id, "Turn cancelled via frame");
                        }
                    }
                    None => {
                        for (_, handle) in turns.drain() {
                            handle.cancel();
                        }
                    }
                }
            }
            Ok(ClientFrame::Chat {
                session_id,
                message,
                provider_override,
            }) => {
                let Some(principal) = principal else {
                    send_invalid(&tx);
                    continue;
                };
                handle_chat_frame(
                    &resources,
                    &tx,
                    &in_flight,
                    principal,
                    &session_id,
                    message,
                    provider_override,
                )
                .await;
            }
            Err(e) => {
                debug!(error = %e, "Malformed WebSocket frame");
                send_invalid(&tx);
            }
        }
    }

    // Connection gone: cancel whatever is still streaming
    for (_, handle) in in_flight.lock().await.drain() {
        handle.cancel();
    }
    writer.abort();
}

/// Admit and spawn one chat turn
async fn handle_chat_frame(
    resources: &Arc<ServerResources>,
    tx: &UnboundedSender<Message>,
    in_flight: &Arc<Mutex<HashMap<Uuid, CancelHandle>>>,
    principal: Principal,
    raw_session_id: &str,
    message: String,
    provider_override: Option<String>,
) {
    let correlation_id = format!("ws_{}", Uuid::new_v4().simple());

    let Ok(session_id) = Uuid::parse_str(raw_session_id) else {
        send_json(
            tx,
            &json!({
                "type": "error",
                "message": "Invalid sessionId: expected UUID",
                "retryable": false,
            }),
        );
        return;
    };

    let admitted = match resources
        .orchestrator
        .admit(TurnRequest {
            principal,
            session_id,
            content: message,
            provider_override,
            correlation_id,
        })
        .await
    {
        Ok(admitted) => admitted,
        Err(e) => {
            send_json(
                tx,
                &json!({
                    "type": "error",
                    "message": e.sanitized_message(),
                    "retryable": e.code.retryable(),
                    "sessionId": session_id,
                }),
            );
            return;
        }
    };

    let cancel = CancelHandle::new();
    in_flight.lock().await.insert(session_id, cancel.clone());

    let orchestrator = resources.orchestrator.clone();
    let tx = tx.clone();
    let in_flight = in_flight.clone();
    tokio::spawn(async move {
        // Bounded buffer between the orchestrator and the socket writer;
        // the pump rewrites each event with the sessionId field.
        let buffer = EventBuffer::new();
        let sink = buffer.clone();

        let pump = {
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(event) = buffer.next().await {
                    let terminal = event.is_terminal();
                    match serde_json::to_value(&event) {
                        Ok(Value::Object(mut frame)) => {
                            frame.insert("sessionId".to_owned(), json!(session_id));
                            send_json(&tx, &Value::Object(frame));
                        }
                        Ok(_) | Err(_) => {
                            warn!("Failed to encode turn event frame");
                        }
                    }
                    if terminal {
                        break;
                    }
                }
            })
        };

        orchestrator.stream_turn(admitted, &sink, Some(cancel)).await;
        sink.close();
        let _ = pump.await;
        in_flight.lock().await.remove(&session_id);
    });
}

fn send_json(tx: &UnboundedSender<Message>, value: &Value) {
    if let Ok(text) = serde_json::to_string(value) {
        if tx.send(Message::Text(text)).is_err() {
            debug!("WebSocket writer gone; frame dropped");
        }
    }
}

fn send_invalid(tx: &UnboundedSender<Message>) {
    send_json(
        tx,
        &json!({
            "type": "error",
            "message": "Invalid message type or not authenticated",
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_parse() {
        let auth: ClientFrame =
            serde_json::from_str(r#"{"type":"auth","token":"abc"}"#).unwrap();
        assert!(matches!(auth, ClientFrame::Auth { token } if token == "abc"));

        let chat: ClientFrame = serde_json::from_str(
            r#"{"type":"chat","sessionId":"3f2e9a54-0c1b-4b6e-9a5e-2f6d8c7b1a90","message":"hi"}"#,
        )
        .unwrap();
        match chat {
            ClientFrame::Chat {
                session_id,
                message,
                provider_override,
            } => {
                assert_eq!(session_id, "3f2e9a54-0c1b-4b6e-9a5e-2f6d8c7b1a90");
                assert_eq!(message, "hi");
                assert!(provider_override.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"ping"}"#).unwrap(),
            ClientFrame::Ping
        ));
        assert!(matches!(
            serde_json::from_str::<ClientFrame>(r#"{"type":"cancel"}"#).unwrap(),
            ClientFrame::Cancel { session_id: None }
        ));
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"subscribe"}"#).is_err());
    }
}
