//! Live post feed
//!
//! Each upgraded socket becomes one hub connection. The first frame the
//! client receives is `Connected` carrying its connection id.

use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::StreamExt;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::api::middleware::AuthenticatedUser;
use crate::api::server::AppState;
use crate::hub::{EnqueueOutcome, EventKind, HubHandle, Message};

/// WebSocket handler for the post feed
///
/// Authentication runs before the upgrade is checked, so a missing token is
/// a 401 even for a plain GET.
pub async fn feed_ws(
    user: AuthenticatedUser,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_feed_ws(socket, state.hub, user.user_id))
}

async fn handle_feed_ws(socket: WebSocket, hub: HubHandle, user_id: Uuid) {
    let (sender, receiver) = socket.split();

    let conn = hub.new_connection();
    let id = conn.id();
    info!(connection_id = %id, user_id = %user_id, "Feed WebSocket connected");

    let welcome = Message::new(EventKind::Connected, json!({ "connection_id": id }));
    if conn.handle().enqueue(Arc::new(welcome)) != EnqueueOutcome::Queued {
        debug!(connection_id = %id, "Welcome frame not queued");
    }

    hub.register(conn.handle()).await;
    conn.serve(sender, receiver, &hub).await;

    info!(connection_id = %id, user_id = %user_id, "Feed WebSocket disconnected");
}
