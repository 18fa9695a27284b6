//! WebSocket endpoint feeding the connection registry.
//!
//! Each socket is registered on connect and unregistered when either side
//! closes. Push frames are written as `{"event": kind, "data": payload}`.
//! Inbound client messages are ignored apart from close frames.

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use uuid::Uuid;

use beacon_notifier::registry::ConnectionRegistry;

use crate::middleware::auth::AuthUser;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(ws: WebSocketUpgrade, auth: AuthUser, State(state): State<AppState>) -> Response {
    let registry = state.registry().clone();
    ws.on_upgrade(move |socket| serve_socket(socket, auth.user_id, registry))
}

async fn serve_socket(socket: WebSocket, user_id: Uuid, registry: Arc<ConnectionRegistry>) {
    let (handle, mut frames) = registry.register(user_id).await;
    let connection_id = handle.connection_id.clone();
    let (mut sink, mut inbound) = socket.split();

    let hello = json!({
        "event": "connected",
        "data": { "connection_id": handle.connection_id },
    });
    if sink.send(Message::Text(hello.to_string().into())).await.is_err() {
        registry.unregister(&connection_id).await;
        return;
    }

    let mut outbound = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to encode push frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = inbound.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    tokio::select! {
        _ = &mut outbound => reader.abort(),
        _ = &mut reader => outbound.abort(),
    }

    registry.unregister(&connection_id).await;
    tracing::debug!(user_id = %user_id, connection_id = %connection_id, "WebSocket closed");
}
