use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{CONNECTED_NOTICE, RelayMessage};

/// Request body for `POST /sendMessage`.
#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    /// Text to publish
    #[serde(default = "default_message")]
    pub message: String,
}

fn default_message() -> String {
    "Default message".to_string()
}

/// Acknowledgement returned after a publish.
#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    /// Human-readable outcome
    pub status: String,
    /// The text that was published
    pub message: String,
}

/// JSON carried by one SSE `data:` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFrame {
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl StreamFrame {
    /// The synthetic notification sent first on every stream.
    pub fn connected() -> Self {
        Self {
            message: CONNECTED_NOTICE.to_string(),
            timestamp: Utc::now(),
        }
    }
}

impl From<&RelayMessage> for StreamFrame {
    fn from(message: &RelayMessage) -> Self {
        Self {
            message: message.text().to_string(),
            timestamp: message.timestamp(),
        }
    }
}

/// Response for `GET /subscriber/messages`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BufferedMessagesResponse {
    /// Buffered lines, oldest first, each prefixed with `[HH:MM:SS]`
    pub messages: Vec<String>,
}

/// Response for `GET /subscriber/clear`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClearResponse {
    pub status: String,
    /// Number of entries removed
    pub cleared: usize,
}

/// Response for `GET /subscriber/status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ConsumerStatusResponse {
    /// `disconnected`, `connecting` or `subscribed`
    pub state: String,
    /// Consecutive failed attempts in the current connect cycle
    pub attempts: u32,
    /// Whether the consumer gave up and needs a manual restart
    pub terminal: bool,
    /// Topic the consumer subscribes to
    pub topic: String,
    /// Entries currently buffered
    pub buffered: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `healthy` or `degraded`
    pub status: String,
    /// Broker implementation in use
    pub broker: String,
    /// Consumer state, `disabled` or `failed`
    pub consumer: String,
    /// Event streams currently open
    pub active_streams: usize,
    /// Service version
    pub version: String,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}
