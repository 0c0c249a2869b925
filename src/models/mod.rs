mod api;
mod message;

pub use api::{
    BufferedMessagesResponse, ClearResponse, ConsumerStatusResponse, HealthResponse,
    PublishResponse, SendMessageRequest, StreamFrame,
};
pub use message::{CONNECTED_NOTICE, FALLBACK_SOURCE, RelayMessage};
