//! API route definitions

use axum::routing::{get, post};
use axum::Router;

use super::handlers;
use super::server::AppState;
use super::websocket;

/// Create the API router with all routes
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Public
        .route("/", get(handlers::health::home))
        .route("/health", get(handlers::health::health_check))
        .route("/api/signup", post(handlers::auth::signup))
        .route("/api/login", post(handlers::auth::login))
        // Authenticated; each handler takes an AuthenticatedUser
        .nest("/api", protected_routes())
        .with_state(state)
}

fn protected_routes() -> Router<AppState> {
    Router::new()
        .route("/status", get(handlers::health::status))
        .route("/me", get(handlers::auth::me))
        .route(
            "/posts",
            get(handlers::post::list_posts).post(handlers::post::create_post),
        )
        .route(
            "/posts/:id",
            get(handlers::post::get_post)
                .put(handlers::post::update_post)
                .delete(handlers::post::delete_post),
        )
        .route("/ws", get(websocket::feed::feed_ws))
}
