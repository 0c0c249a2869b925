use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_stream::stream;
use futures::Stream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broker::{Broker, ConnectionGuard};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::StreamFrame;

/// Opens request-scoped subscriptions and turns them into frame streams.
///
/// Each stream owns its connection exclusively. Nothing is shared between
/// streams except the `active` counter.
#[derive(Clone)]
pub struct StreamService {
    broker: Arc<dyn Broker>,
    topic: Arc<str>,
    active: Arc<AtomicUsize>,
    shutdown: CancellationToken,
}

impl StreamService {
    pub fn new(broker: Arc<dyn Broker>, topic: &str) -> Self {
        Self {
            broker,
            topic: Arc::from(topic),
            active: Arc::new(AtomicUsize::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// End every stream, open or future, once `token` is cancelled.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Number of streams currently open.
    pub fn active_streams(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Connect and subscribe, then hand back the frame stream.
    ///
    /// Setup happens before this returns, so a failure can still become an
    /// HTTP error. The stream yields the connected notice first, then one
    /// frame per broker message in delivery order. It ends when the broker
    /// ends the subscription or the server shuts down. Dropping it
    /// disconnects the broker connection.
    ///
    /// # Errors
    ///
    /// - `AppError::ConnectionFailed` if the broker cannot be reached
    /// - `AppError::StreamSetup` if the subscription is not acknowledged
    #[instrument(skip(self), fields(topic = %self.topic))]
    pub async fn open(
        &self,
    ) -> AppResult<impl Stream<Item = StreamFrame> + Send + 'static + use<>> {
        let mut guard = ConnectionGuard::open(self.broker.as_ref(), "stream").await?;

        let mut receiver = match guard.subscribe(&self.topic).await {
            Ok(receiver) => receiver,
            Err(e) => {
                guard.release().await;
                return Err(match e {
                    AppError::StreamSetup(_) => e,
                    other => AppError::StreamSetup(other.to_string()),
                });
            }
        };

        let session = StreamSession::start(self.active.clone());
        let topic = self.topic.clone();
        let shutdown = self.shutdown.clone();
        info!("Event stream opened");

        Ok(stream! {
            let _session = session;

            yield StreamFrame::connected();

            loop {
                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => None,
                    message = receiver.recv() => Some(message),
                };

                match next {
                    Some(Some(message)) => {
                        metrics::record_message_forwarded(&topic);
                        yield StreamFrame::from(&message.decode());
                    }
                    Some(None) => {
                        warn!(topic = %topic, "Broker ended the subscription, closing event stream");
                        break;
                    }
                    None => {
                        debug!(topic = %topic, "Server shutting down, closing event stream");
                        break;
                    }
                }
            }

            guard.release().await;
        })
    }
}

/// Counts a stream as active for as long as it lives.
struct StreamSession {
    active: Arc<AtomicUsize>,
}

impl StreamSession {
    fn start(active: Arc<AtomicUsize>) -> Self {
        let count = active.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_streams(count);
        Self { active }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let count = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_active_streams(count);
        debug!(active_streams = count, "Event stream closed");
    }
}
