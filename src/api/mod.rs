//! API server implementation
//!
//! REST endpoints for users and posts, and the WebSocket feed.

pub mod handlers;
pub mod middleware;
pub mod routes;
pub mod server;
pub mod websocket;

pub use server::ApiServer;
