use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use crate::broker::{Broker, ConnectionGuard};
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{PublishResponse, RelayMessage};
use crate::validation::validate_message_text;

/// Where a publish goes and how the message is tagged.
#[derive(Debug, Clone)]
struct Target {
    topic: String,
    source: String,
}

/// Publishes single messages, one broker connection per call.
///
/// Every publish is a single attempt: connect, publish, disconnect. Failures
/// are returned to the caller and never retried here.
///
/// The `messages_published` counter uses `Ordering::Relaxed`; it only feeds
/// diagnostics.
#[derive(Clone)]
pub struct PublisherService {
    broker: Arc<dyn Broker>,
    relay: Arc<Target>,
    publisher: Arc<Target>,
    max_message_length: usize,
    operation_timeout: Duration,
    messages_published: Arc<AtomicU64>,
}

impl PublisherService {
    pub fn new(broker: Arc<dyn Broker>, config: &Config) -> Self {
        Self {
            broker,
            relay: Arc::new(Target {
                topic: config.relay_topic.clone(),
                source: config.message_source.clone(),
            }),
            publisher: Arc::new(Target {
                topic: config.consumer_topic.clone(),
                source: config.publisher_source.clone(),
            }),
            max_message_length: config.max_message_length,
            operation_timeout: config.operation_timeout,
            messages_published: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Relay a message to the stream topic (`POST /sendMessage`).
    pub async fn send_message(&self, text: &str) -> AppResult<PublishResponse> {
        let message = self
            .publish_to(&self.relay.topic, &self.relay.source, text)
            .await?;

        Ok(PublishResponse {
            status: "Message sent".to_string(),
            message: message.text().to_string(),
        })
    }

    /// Publish a message to the consumer topic (`GET /publish/{message}`).
    pub async fn publish_message(&self, text: &str) -> AppResult<PublishResponse> {
        let message = self
            .publish_to(&self.publisher.topic, &self.publisher.source, text)
            .await?;

        Ok(PublishResponse {
            status: "Message published".to_string(),
            message: message.text().to_string(),
        })
    }

    /// Run one connect, publish, disconnect cycle.
    ///
    /// # Errors
    ///
    /// - `AppError::BadRequest` if the text is too long or contains NUL
    ///   (checked before any connection is opened)
    /// - `AppError::ConnectionFailed` if the broker cannot be reached
    /// - `AppError::PublishFailed` if the broker does not take the message
    /// - `AppError::OperationTimeout` if the publish is not acknowledged in time
    #[instrument(skip(self, text), fields(len = text.len()))]
    pub async fn publish_to(
        &self,
        topic: &str,
        source: &str,
        text: &str,
    ) -> AppResult<RelayMessage> {
        validate_message_text(text, self.max_message_length)?;

        let message = RelayMessage::new(text, source);
        let payload = message.to_payload()?;

        let started = Instant::now();
        let result = self.publish_once(topic, payload).await;
        metrics::record_publish_duration(topic, started.elapsed().as_secs_f64());

        match result {
            Ok(()) => {
                metrics::record_message_published(topic, "success");
                self.messages_published.fetch_add(1, Ordering::Relaxed);
                debug!("Message published");
                Ok(message)
            }
            Err(e) => {
                metrics::record_message_published(topic, "failure");
                warn!(error = %e, "Publish failed");
                Err(e)
            }
        }
    }

    /// Total messages accepted by the broker since startup.
    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    async fn publish_once(&self, topic: &str, payload: Vec<u8>) -> AppResult<()> {
        let mut guard = ConnectionGuard::open(self.broker.as_ref(), "publish").await?;

        let outcome = timeout(self.operation_timeout, guard.publish(topic, payload))
            .await
            .unwrap_or_else(|_| {
                Err(AppError::OperationTimeout(format!(
                    "publish to '{topic}' exceeded {:?}",
                    self.operation_timeout
                )))
            });

        guard.release().await;
        outcome
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn service(broker: &MemoryBroker) -> PublisherService {
        PublisherService::new(Arc::new(broker.clone()), &Config::default())
    }

    #[tokio::test]
    async fn test_send_message_uses_one_connection() {
        let broker = MemoryBroker::new();
        let publisher = service(&broker);

        let response = publisher.send_message("hello").await.unwrap();
        assert_eq!(response.status, "Message sent");
        assert_eq!(response.message, "hello");

        let stats = broker.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.publishes, 1);
        assert_eq!(stats.disconnects, 1);
        assert_eq!(publisher.messages_published(), 1);
    }

    #[tokio::test]
    async fn test_send_message_payload_reaches_relay_topic() {
        let broker = MemoryBroker::new();
        let mut listener = broker.connect().await.unwrap();
        let mut rx = listener.subscribe("demo/messages").await.unwrap();

        service(&broker).send_message("hello").await.unwrap();

        let decoded = rx.recv().await.unwrap().decode();
        assert_eq!(decoded.text(), "hello");
        assert_eq!(decoded.source(), "mqtt-relay");
    }

    #[tokio::test]
    async fn test_publish_message_targets_consumer_topic() {
        let broker = MemoryBroker::new();
        let mut listener = broker.connect().await.unwrap();
        let mut rx = listener.subscribe("aspire/demo/messages").await.unwrap();

        let response = service(&broker).publish_message("hi").await.unwrap();
        assert_eq!(response.status, "Message published");

        let message = rx.recv().await.unwrap();
        assert_eq!(message.topic, "aspire/demo/messages");
        assert_eq!(message.decode().source(), "MqttPublisher");
    }

    #[tokio::test]
    async fn test_connect_failure_is_not_retried() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let err = service(&broker).send_message("hello").await.unwrap_err();
        assert!(matches!(err, AppError::ConnectionFailed(_)));

        let stats = broker.stats();
        assert_eq!(stats.connect_attempts, 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_invalid_text_rejected_before_connect() {
        let broker = MemoryBroker::new();
        let publisher = PublisherService::new(
            Arc::new(broker.clone()),
            &Config {
                max_message_length: 4,
                ..Config::default()
            },
        );

        let err = publisher.send_message("too long").await.unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
        assert_eq!(broker.stats().connect_attempts, 0);
    }
}
