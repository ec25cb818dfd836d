//! WebSocket endpoints

pub mod feed;

/// Header a client sends with its hub connection id so its own writes are
/// not echoed back to it
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";
