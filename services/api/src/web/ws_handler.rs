//! services/api/src/web/ws_handler.rs
//!
//! This is the entry point for the live bookmark WebSocket. It translates
//! socket frames to and from the protocol types and hands the session to
//! `sync_process`.

use crate::web::{
    protocol::{ClientMessage, ServerMessage},
    state::{AppState, AuthSessionId},
    sync_task::sync_process,
};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
    Extension,
};
use bookmark_sync_core::User;
use futures::{future, SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Outbound messages buffered per connection before the loop waits on the socket.
const OUTBOUND_BUFFER: usize = 64;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<Arc<AppState>>,
    Extension(user): Extension<User>,
    Extension(auth_session): Extension<AuthSessionId>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, user, auth_session))
}

async fn handle_socket(
    socket: WebSocket,
    app_state: Arc<AppState>,
    user: User,
    AuthSessionId(auth_session_id): AuthSessionId,
) {
    info!("New WebSocket connection established for user: {}", user.user_id);

    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<ServerMessage>(OUTBOUND_BUFFER);

    // --- Writer: protocol messages -> text frames ---
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize server message: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                error!("Failed to send message to client. Closing writer.");
                break;
            }
        }
        let _ = sender.close().await;
    });

    // --- Reader: text frames -> protocol messages, until close or error ---
    let inbound = receiver
        .take_while(|frame| {
            let open = matches!(frame, Ok(msg) if !matches!(msg, Message::Close(_)));
            future::ready(open)
        })
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("Failed to deserialize client message: {}", e);
                        None
                    }
                },
                _ => None,
            })
        });

    let signed_out = app_state.sign_outs.acquire(&auth_session_id);
    sync_process(app_state.clone(), user.user_id, Box::pin(inbound), tx, signed_out.clone()).await;
    app_state.sign_outs.release(&auth_session_id, &signed_out);

    // `tx` was moved into the session, so the writer drains and exits.
    if let Err(e) = writer.await {
        error!("WebSocket writer task failed: {:?}", e);
    }
    info!("WebSocket connection closed.");
}
