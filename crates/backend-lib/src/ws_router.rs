// ============================
// pika-backend-lib/src/ws_router.rs
// ============================
//! WebSocket router and connection handling.
//!
//! One socket task pair per connection: the read loop decodes inbound
//! envelopes and drives the `SessionHandler`, the writer task drains the
//! connection's frame channel and retires bytes from its backpressure
//! counter as frames reach the socket.
use crate::broadcast::ConnectionHandle;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION};
use crate::storage::Storage;
use crate::websocket::SessionHandler;
use crate::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, gauge};
use pika_common::{Inbound, ServerMessage};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower_http::trace::TraceLayer;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Create the application router
pub fn create_router<S: Storage + Send + Sync + Clone + 'static>(
    state: Arc<AppState<S>>,
) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// Handler for WebSocket connections
pub async fn ws_handler<S: Storage + Send + Sync + Clone + 'static>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<S>>>,
) -> impl IntoResponse {
    counter!(WS_CONNECTION).increment(1);
    gauge!(WS_ACTIVE).increment(1.0);

    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection<S: Storage + Send + Sync + Clone + 'static>(
    socket: WebSocket,
    state: Arc<AppState<S>>,
) {
    let (mut sink, mut stream) = socket.split();

    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (frame_tx, mut frame_rx) = mpsc::unbounded_channel::<String>();
    let conn = ConnectionHandle::new(conn_id, frame_tx);

    // Writer: drain the frame channel into the socket and retire the
    // bytes from the backpressure counter once each frame is written.
    let writer_conn = conn.clone();
    let writer = tokio::spawn(async move {
        while let Some(frame) = frame_rx.recv().await {
            let bytes = frame.len();
            if sink.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
            writer_conn.mark_flushed(bytes);
        }
    });

    let mut handler = SessionHandler::new(state, conn.clone());

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => dispatch(&mut handler, &conn, &text).await,
            Message::Close(_) => break,
            _ => {},
        }
    }

    // A listener drop is absorbed by the sticky presence window; a DJ
    // drop ends the session.
    handler.handle_disconnect().await;

    gauge!(WS_ACTIVE).decrement(1.0);
    writer.abort();
}

/// Decode one inbound frame and run it, converting the outcome into an
/// ACK or NACK when the frame carried a correlation ID. A fault never
/// tears down the connection.
async fn dispatch<S: Storage + Send + Sync + Clone + 'static>(
    handler: &mut SessionHandler<S>,
    conn: &ConnectionHandle,
    text: &str,
) {
    let inbound: Inbound = match serde_json::from_str(text) {
        Ok(inbound) => inbound,
        Err(e) => {
            // malformed frame: the correlation ID may still be readable
            let correlation_id = serde_json::from_str::<serde_json::Value>(text)
                .ok()
                .and_then(|v| v.get("correlationId").and_then(|c| c.as_str()).map(String::from));
            tracing::warn!(error = %e, "malformed inbound frame");
            if correlation_id.is_some() {
                conn.send(&ServerMessage::Nack {
                    code: "JSON_001".to_string(),
                    message: "malformed message".to_string(),
                    correlation_id,
                });
            }
            return;
        },
    };

    let correlation_id = inbound.correlation_id;
    match handler.handle_message(inbound.message).await {
        Ok(()) => {
            if correlation_id.is_some() {
                conn.send(&ServerMessage::Ack { correlation_id });
            }
        },
        Err(e) => {
            tracing::warn!(code = e.error_code(), error = %e, "request failed");
            if correlation_id.is_some() {
                conn.send(&ServerMessage::Nack {
                    code: e.error_code().to_string(),
                    message: e.sanitized_message(),
                    correlation_id,
                });
            }
        },
    }
}
