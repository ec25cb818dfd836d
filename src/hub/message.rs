//! Broadcast payloads
//!
//! A [`Message`] is built once by the caller and shared read-only (behind an
//! `Arc`) with every connection it is fanned out to.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, Result};

/// Kind of event carried by a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "Post_Created")]
    PostCreated,
    #[serde(rename = "Post_Updated")]
    PostUpdated,
    #[serde(rename = "Post_Deleted")]
    PostDeleted,
    /// Sent once to a freshly upgraded client, never broadcast
    #[serde(rename = "Connected")]
    Connected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PostCreated => "Post_Created",
            EventKind::PostUpdated => "Post_Updated",
            EventKind::PostDeleted => "Post_Deleted",
            EventKind::Connected => "Connected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One event, as delivered to clients: `{"type": ..., "payload": ...}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub payload: Value,
}

impl Message {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Build a message from any serializable payload
    pub fn from_payload<T: Serialize>(kind: EventKind, payload: &T) -> Result<Self> {
        let payload = serde_json::to_value(payload).map_err(|e| {
            AppError::Internal(format!("Failed to serialize {} payload: {}", kind, e))
        })?;

        Ok(Self::new(kind, payload))
    }

    /// Encode as a single text frame
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| AppError::Internal(format!("Failed to encode message: {}", e)))
    }
}
