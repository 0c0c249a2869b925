//! Shared application state for Axum handlers.
//!
//! Cloned for every request; everything inside is behind an `Arc` or is a
//! cheap handle.
//!
//! # Structured Concurrency
//!
//! The background consumer runs on a `tokio_util::task::TaskTracker` and
//! watches a `CancellationToken`. Call `shutdown()` to stop it before the
//! process exits.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::broker::{Broker, RetryPolicy};
use crate::config::Config;
use crate::services::{BackgroundConsumer, PublisherService, StreamService};

/// Shared application state for Axum handlers.
///
/// ```rust,ignore
/// let state = AppState::new(broker, config);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Broker every service connects through
    pub broker: Arc<dyn Broker>,
    /// Single-shot publishes
    pub publisher: PublisherService,
    /// Request-scoped event streams
    pub streamer: StreamService,
    /// Background consumer, `None` when disabled
    pub consumer: Option<BackgroundConsumer>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Application configuration
    pub config: Arc<Config>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build the services and, if enabled, start the background consumer.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(broker: Arc<dyn Broker>, config: Config) -> Self {
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let publisher = PublisherService::new(broker.clone(), &config);
        let streamer = StreamService::new(broker.clone(), &config.relay_topic)
            .with_shutdown(cancellation_token.clone());

        let consumer = config.consumer_enabled.then(|| {
            BackgroundConsumer::new(
                broker.clone(),
                &config.consumer_topic,
                RetryPolicy::from_config(&config),
                config.consumer_buffer_capacity,
                task_tracker.clone(),
                cancellation_token.clone(),
            )
        });

        if let Some(consumer) = &consumer {
            // A fresh consumer is never running, so this cannot conflict.
            if let Err(e) = consumer.start() {
                warn!(error = %e, "Background consumer did not start");
            }
        }

        Self {
            broker,
            publisher,
            streamer,
            consumer,
            started_at: Instant::now(),
            config: Arc::new(config),
            task_tracker,
            cancellation_token,
        }
    }

    /// Ask open event streams and the background consumer to stop without
    /// waiting. The HTTP server can only drain once streams have ended.
    pub fn begin_shutdown(&self) {
        self.cancellation_token.cancel();
    }

    /// Stop background tasks and wait for them to finish.
    ///
    /// 1. Signals all tasks to stop via cancellation token
    /// 2. Closes the task tracker
    /// 3. Waits for all tasks to complete
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks have completed");
    }

    /// Get the application uptime in seconds.
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
