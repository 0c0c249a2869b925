mod consumer;
mod health;
mod relay;

pub use consumer::{clear_messages, consumer_status, list_messages, restart_consumer};
pub use health::{health_check, readiness_check, root};
pub use relay::{message_stream, publish_message, send_message};
