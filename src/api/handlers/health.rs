//! Liveness, landing and status endpoints

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::api::middleware::AuthenticatedUser;
use crate::api::server::AppState;

/// Landing endpoint
pub async fn home() -> impl IntoResponse {
    Json(json!({
        "message": "Welcome to postfeed",
        "status": true
    }))
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "postfeed"
        })),
    )
}

/// Uptime, database reachability and hub counters
pub async fn status(_user: AuthenticatedUser, State(state): State<AppState>) -> impl IntoResponse {
    let uptime_secs = state.started_at.elapsed().as_secs();

    let database = match state.db.ping().await {
        Ok(latency) => json!({
            "status": "up",
            "latency_ms": latency.as_millis() as u64,
            "pool": state.db.pool_stats(),
        }),
        Err(e) => {
            warn!("Database health check failed: {}", e);
            json!({
                "status": "down",
                "error": e.public_message(),
            })
        }
    };

    Json(json!({
        "uptime_secs": uptime_secs,
        "database": database,
        "hub": state.hub.stats(),
    }))
}
