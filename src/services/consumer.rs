//! Background consumer with a bounded-retry connector.
//!
//! One long-lived subscription to the consumer topic, independent of any
//! request. Received messages land in a [`MessageBuffer`] that clients poll.
//!
//! ```text
//!                 connect + subscribe ok
//!  Disconnected ──► Connecting ────────────────► Subscribed
//!       ▲               │ failure                     │ subscription lost
//!       │               ▼                             │ (fresh budget)
//!       └──── wait delay (budget left) ◄──────────────┘
//!                       │ budget spent
//!                       ▼
//!               Disconnected + terminal
//! ```
//!
//! A terminal connector stays down until [`BackgroundConsumer::start`] is
//! called again.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::buffer::{Cleared, MessageBuffer};
use crate::broker::{Broker, ConnectionGuard, MessageReceiver, RetryPolicy};
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Connector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Disconnected,
    Connecting,
    Subscribed,
}

impl ConnectorState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorState::Disconnected => "disconnected",
            ConnectorState::Connecting => "connecting",
            ConnectorState::Subscribed => "subscribed",
        }
    }

    fn gauge_value(&self) -> u8 {
        match self {
            ConnectorState::Disconnected => 0,
            ConnectorState::Connecting => 1,
            ConnectorState::Subscribed => 2,
        }
    }
}

impl fmt::Display for ConnectorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the connector, published on a watch channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorStatus {
    pub state: ConnectorState,
    /// Consecutive failures in the current cycle
    pub attempts: u32,
    /// Retry budget spent; no further automatic attempts
    pub terminal: bool,
    pub last_error: Option<String>,
}

impl Default for ConnectorStatus {
    fn default() -> Self {
        Self {
            state: ConnectorState::Disconnected,
            attempts: 0,
            terminal: false,
            last_error: None,
        }
    }
}

struct Inner {
    broker: Arc<dyn Broker>,
    topic: String,
    policy: RetryPolicy,
    buffer: MessageBuffer,
    status: watch::Sender<ConnectorStatus>,
    running: AtomicBool,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

/// Handle to the background consumer. Cheap to clone.
#[derive(Clone)]
pub struct BackgroundConsumer {
    inner: Arc<Inner>,
}

impl BackgroundConsumer {
    /// Create a stopped consumer. The connector task is spawned on `tracker`
    /// by [`start`](Self::start) and stops when `cancel` fires.
    pub fn new(
        broker: Arc<dyn Broker>,
        topic: &str,
        policy: RetryPolicy,
        buffer_capacity: usize,
        tracker: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(ConnectorStatus::default());
        Self {
            inner: Arc::new(Inner {
                broker,
                topic: topic.to_string(),
                policy,
                buffer: MessageBuffer::new(buffer_capacity),
                status,
                running: AtomicBool::new(false),
                tracker,
                cancel,
            }),
        }
    }

    /// Spawn the connector with a fresh retry budget.
    ///
    /// # Errors
    ///
    /// `AppError::Conflict` if a connector task is already running.
    pub fn start(&self) -> AppResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(AppError::Conflict(
                "background consumer is already running".to_string(),
            ));
        }

        self.inner.status.send_replace(ConnectorStatus::default());
        let inner = self.inner.clone();
        self.inner.tracker.spawn(async move { inner.run().await });

        info!(topic = %self.inner.topic, "Background consumer started");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ConnectorStatus {
        self.inner.status.borrow().clone()
    }

    /// Watch status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectorStatus> {
        self.inner.status.subscribe()
    }

    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Buffered lines, oldest first.
    pub fn messages(&self) -> Vec<String> {
        self.inner.buffer.snapshot()
    }

    pub fn clear(&self) -> Cleared {
        let cleared = self.inner.buffer.clear();
        metrics::set_consumer_buffer_size(0);
        debug!(count = cleared.count, watermark = cleared.watermark, "Consumer buffer cleared");
        cleared
    }

    pub fn buffered(&self) -> usize {
        self.inner.buffer.len()
    }
}

impl Inner {
    async fn run(&self) {
        let mut failures = 0u32;
        let mut terminal = false;

        loop {
            self.update(|status| status.state = ConnectorState::Connecting);

            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                attempt = self.connect_and_subscribe() => attempt,
            };

            match attempt {
                Ok((mut guard, mut receiver)) => {
                    failures = 0;
                    self.update(|status| {
                        status.state = ConnectorState::Subscribed;
                        status.attempts = 0;
                        status.last_error = None;
                    });
                    info!(topic = %self.topic, "Background consumer subscribed");

                    let cancelled = self.pump(&mut receiver).await;
                    guard.release().await;
                    if cancelled {
                        break;
                    }

                    warn!(topic = %self.topic, "Background consumer lost its subscription, reconnecting");
                    self.update(|status| status.state = ConnectorState::Disconnected);
                }
                Err(e) => {
                    failures += 1;
                    let reason = e.to_string();
                    self.update(|status| {
                        status.state = ConnectorState::Disconnected;
                        status.attempts = failures;
                        status.last_error = Some(reason);
                    });

                    let Some(delay) = self.policy.delay_after(failures) else {
                        error!(
                            attempts = failures,
                            topic = %self.topic,
                            error = %e,
                            "Background consumer gave up, manual restart required"
                        );
                        terminal = true;
                        break;
                    };

                    warn!(
                        attempt = failures,
                        max_attempts = self.policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Background consumer connect failed, retrying"
                    );

                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        self.finish(terminal);
        debug!("Background consumer task shutting down");
    }

    /// Publish the final status and mark the task stopped under the status
    /// lock, so a `start` that observes the stop cannot be overwritten by it.
    fn finish(&self, terminal: bool) {
        self.status.send_modify(|status| {
            status.state = ConnectorState::Disconnected;
            status.terminal = terminal;
            metrics::set_consumer_state(status.state.gauge_value());
            self.running.store(false, Ordering::SeqCst);
        });
    }

    async fn connect_and_subscribe(&self) -> AppResult<(ConnectionGuard, MessageReceiver)> {
        let mut guard = ConnectionGuard::open(self.broker.as_ref(), "consumer").await?;
        match guard.subscribe(&self.topic).await {
            Ok(receiver) => Ok((guard, receiver)),
            Err(e) => {
                guard.release().await;
                Err(e)
            }
        }
    }

    /// Move messages into the buffer until the subscription ends (`false`)
    /// or shutdown is requested (`true`).
    async fn pump(&self, receiver: &mut MessageReceiver) -> bool {
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return true,
                message = receiver.recv() => match message {
                    Some(message) => {
                        self.buffer.push(message.decode().text());
                        metrics::record_message_forwarded(&self.topic);
                        metrics::set_consumer_buffer_size(self.buffer.len());
                    }
                    None => return false,
                },
            }
        }
    }

    fn update(&self, change: impl FnOnce(&mut ConnectorStatus)) {
        self.status.send_modify(|status| {
            change(status);
            metrics::set_consumer_state(status.state.gauge_value());
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::models::RelayMessage;
    use std::time::Duration;
    use tokio::time::Instant;

    const TOPIC: &str = "aspire/demo/messages";

    fn consumer(broker: &MemoryBroker, policy: RetryPolicy) -> (BackgroundConsumer, TaskTracker, CancellationToken) {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let consumer = BackgroundConsumer::new(
            Arc::new(broker.clone()),
            TOPIC,
            policy,
            0,
            tracker.clone(),
            cancel.clone(),
        );
        (consumer, tracker, cancel)
    }

    async fn wait_for(consumer: &BackgroundConsumer, check: impl FnMut(&ConnectorStatus) -> bool) {
        let mut rx = consumer.subscribe_status();
        tokio::time::timeout(Duration::from_secs(120), rx.wait_for(check))
            .await
            .expect("status not reached")
            .expect("status channel closed");
    }

    async fn publish(broker: &MemoryBroker, text: &str) {
        let mut connection = broker.connect().await.unwrap();
        let payload = RelayMessage::new(text, "test").to_payload().unwrap();
        connection.publish(TOPIC, payload).await.unwrap();
        connection.disconnect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_after_exactly_five_failures() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (consumer, _tracker, _cancel) = consumer(&broker, RetryPolicy::default());

        let started = Instant::now();
        consumer.start().unwrap();
        wait_for(&consumer, |status| status.terminal).await;

        // Four waits of 2 s between five attempts, none after the last.
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(8), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_secs(9), "elapsed {elapsed:?}");

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(broker.stats().connect_attempts, 5);

        let status = consumer.status();
        assert_eq!(status.state, ConnectorState::Disconnected);
        assert_eq!(status.attempts, 5);
        assert!(status.last_error.is_some());
        assert!(!consumer.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_before_budget_is_spent() {
        let broker = MemoryBroker::new();
        broker.fail_next_connects(4);
        let (consumer, _tracker, _cancel) = consumer(&broker, RetryPolicy::default());

        consumer.start().unwrap();
        wait_for(&consumer, |status| status.state == ConnectorState::Subscribed).await;

        assert_eq!(broker.stats().connect_attempts, 5);
        assert_eq!(consumer.status().attempts, 0);
        assert!(!consumer.status().terminal);
    }

    #[tokio::test]
    async fn test_buffers_received_messages() {
        let broker = MemoryBroker::new();
        let (consumer, _tracker, _cancel) = consumer(&broker, RetryPolicy::default());

        consumer.start().unwrap();
        wait_for(&consumer, |status| status.state == ConnectorState::Subscribed).await;

        publish(&broker, "first").await;
        publish(&broker, "second").await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.buffered() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let lines = consumer.messages();
        assert!(lines[0].starts_with('[') && lines[0].ends_with("] first"));
        assert!(lines[1].ends_with("] second"));

        let cleared = consumer.clear();
        assert_eq!(cleared.count, 2);
        assert!(consumer.messages().is_empty());
    }

    #[tokio::test]
    async fn test_start_while_running_conflicts() {
        let broker = MemoryBroker::new();
        let (consumer, _tracker, _cancel) = consumer(&broker, RetryPolicy::default());

        consumer.start().unwrap();
        let err = consumer.start().unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_restart_after_terminal() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (consumer, _tracker, _cancel) =
            consumer(&broker, RetryPolicy::fixed(2, Duration::from_millis(500)));

        consumer.start().unwrap();
        wait_for(&consumer, |status| status.terminal).await;
        assert!(!consumer.is_running());

        broker.set_available(true);
        consumer.start().unwrap();
        wait_for(&consumer, |status| status.state == ConnectorState::Subscribed).await;
        assert!(!consumer.status().terminal);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_status_is_restartable_immediately() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let (consumer, _tracker, _cancel) =
            consumer(&broker, RetryPolicy::fixed(1, Duration::from_millis(100)));

        let mut rx = consumer.subscribe_status();
        consumer.start().unwrap();
        rx.wait_for(|status| status.terminal).await.unwrap();

        // Whoever sees the terminal status can restart without waiting.
        assert!(!consumer.is_running());
        consumer.start().unwrap();
        assert!(!consumer.status().terminal);
    }

    #[tokio::test]
    async fn test_lost_subscription_reconnects() {
        let broker = MemoryBroker::new();
        let (consumer, _tracker, _cancel) = consumer(&broker, RetryPolicy::default());

        consumer.start().unwrap();
        wait_for(&consumer, |status| status.state == ConnectorState::Subscribed).await;
        assert_eq!(broker.stats().connects, 1);

        broker.sever_subscriptions();

        tokio::time::timeout(Duration::from_secs(2), async {
            while broker.stats().connects < 2 || broker.subscription_count() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(broker.open_connections(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_task_and_disconnects() {
        let broker = MemoryBroker::new();
        let (consumer, tracker, cancel) = consumer(&broker, RetryPolicy::default());

        consumer.start().unwrap();
        wait_for(&consumer, |status| status.state == ConnectorState::Subscribed).await;

        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        assert!(!consumer.is_running());
        assert_eq!(broker.open_connections(), 0);
        assert_eq!(consumer.status().state, ConnectorState::Disconnected);
    }
}
