//! Real-time fan-out hub
//!
//! Pushes post events to every connected WebSocket client. One dispatcher
//! task owns the set of live connections; HTTP handlers and upgrade
//! handlers reach it only through a [`HubHandle`].

pub mod connection;
pub mod dispatcher;
pub mod message;
mod registry;

pub use connection::{
    Connection, ConnectionHandle, ConnectionId, ConnectionSettings, ConnectionState,
    EnqueueOutcome,
};
pub use dispatcher::{Hub, HubConfig, HubHandle, HubStats, SlowConsumerPolicy};
pub use message::{EventKind, Message};
