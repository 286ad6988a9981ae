use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use uuid::Uuid;

use crate::app_state::AppState;

/// GET /ws/vehicles — stream completed vehicles as JSON text frames.
///
/// The connection is held until the system is ready; past the readiness
/// ceiling the request is refused with 503 instead of upgraded.
pub async fn vehicle_updates(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    if !state.readiness.wait_ready(state.readiness_ceiling).await {
        tracing::warn!("Live subscriber refused, system not ready");
        return (StatusCode::SERVICE_UNAVAILABLE, "System not ready").into_response();
    }

    // Subscribe before upgrading so nothing published in between is missed.
    let updates = state.live.subscribe();
    ws.on_upgrade(move |socket| stream_updates(socket, updates))
}

async fn stream_updates(socket: WebSocket, mut updates: broadcast::Receiver<Arc<str>>) {
    let conn_id = Uuid::new_v4();
    tracing::info!(%conn_id, "Live subscriber connected");
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(json) => {
                    if sender.send(Message::Text(json.as_ref().into())).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(%conn_id, skipped, "Live subscriber lagging, updates skipped");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(%conn_id, "Live subscriber disconnected");
}
