//! Broker abstraction used by the relay services.
//!
//! Every publish and every stream opens its own connection; nothing is pooled.
//! The two traits split the lifecycle in the same way:
//!
//! ```text
//! ┌──────────────┐ connect() ┌─────────────────────┐ disconnect(self) ┌────────┐
//! │    Broker    │ ────────► │  BrokerConnection   │ ───────────────► │ closed │
//! └──────────────┘           │  publish/subscribe  │                  └────────┘
//!                            └─────────────────────┘
//! ```
//!
//! `disconnect` consumes the connection, so it can run at most once. The
//! [`ConnectionGuard`] makes sure it runs at least once, including when the
//! owning future or stream is dropped half way.
//!
//! # Module Structure
//!
//! - `guard` - Scoped ownership of a connection with release on drop
//! - `memory` - In-process broker for development and tests
//! - `mqtt` - MQTT 3.1.1 broker over TCP (rumqttc)
//! - `retry` - Retry policy and backoff for long-lived subscribers

mod guard;
mod memory;
mod mqtt;
mod retry;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

use crate::config::{BrokerKind, Config};
use crate::error::AppResult;
use crate::models::RelayMessage;

pub use guard::ConnectionGuard;
pub use memory::{MemoryBroker, MemoryBrokerStats};
pub use mqtt::MqttBroker;
pub use retry::{Backoff, RetryPolicy, rand_jitter};

/// Receiving half of a subscription. Closed when the connection goes away.
pub type MessageReceiver = mpsc::UnboundedReceiver<BrokerMessage>;

/// A message as delivered by the broker to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Concrete topic the message was published on
    pub topic: String,
    /// Raw payload bytes
    pub payload: Vec<u8>,
    /// When this process received it
    pub received_at: DateTime<Utc>,
}

impl BrokerMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Decode the payload into a relay message.
    pub fn decode(&self) -> RelayMessage {
        RelayMessage::from_payload(&self.payload, self.received_at)
    }
}

/// Factory for broker connections.
#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Short name used in logs and `/health`.
    fn kind(&self) -> &'static str;

    /// Open a new connection and complete the protocol handshake.
    ///
    /// # Errors
    ///
    /// `AppError::ConnectionFailed` if the broker is unreachable, refuses the
    /// handshake or does not answer in time.
    async fn connect(&self) -> AppResult<Box<dyn BrokerConnection>>;
}

/// One open broker connection.
#[async_trait]
pub trait BrokerConnection: Send + 'static {
    /// Publish a payload to a concrete topic and wait for the broker to take it.
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> AppResult<()>;

    /// Subscribe to a topic filter.
    ///
    /// Messages are delivered in broker order on the returned receiver. The
    /// receiver yields `None` once the connection is closed or lost.
    async fn subscribe(&mut self, filter: &str) -> AppResult<MessageReceiver>;

    /// Close the connection and release its resources.
    async fn disconnect(self: Box<Self>) -> AppResult<()>;
}

/// Build the broker selected by the configuration.
pub fn build_broker(config: &Config) -> Arc<dyn Broker> {
    match config.broker_kind {
        BrokerKind::Mqtt => Arc::new(MqttBroker::from_config(config)),
        BrokerKind::Memory => Arc::new(MemoryBroker::new()),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_message_decode_envelope() {
        let payload = RelayMessage::new("hello", "mqtt-relay").to_payload().unwrap();
        let message = BrokerMessage::new("demo/messages", payload);

        let decoded = message.decode();
        assert_eq!(decoded.text(), "hello");
        assert_eq!(decoded.source(), "mqtt-relay");
    }

    #[test]
    fn test_build_broker_kind() {
        let config = Config {
            broker_kind: BrokerKind::Memory,
            ..Config::default()
        };
        assert_eq!(build_broker(&config).kind(), "memory");
        assert_eq!(build_broker(&Config::default()).kind(), "mqtt");
    }
}
