//! Scoped ownership of a broker connection.

use tokio::runtime::Handle;
use tracing::{debug, warn};

use super::{Broker, BrokerConnection, MessageReceiver};
use crate::error::{AppError, AppResult};
use crate::metrics;

/// Owns a broker connection and guarantees it is disconnected exactly once.
///
/// Call [`release`](Self::release) on the normal path. If the guard is dropped
/// first (client went away, future cancelled, panic unwinding), the disconnect
/// is spawned onto the current Tokio runtime instead.
pub struct ConnectionGuard {
    connection: Option<Box<dyn BrokerConnection>>,
    purpose: &'static str,
}

impl ConnectionGuard {
    /// Take ownership of `connection`. `purpose` labels log lines.
    pub fn new(connection: Box<dyn BrokerConnection>, purpose: &'static str) -> Self {
        Self {
            connection: Some(connection),
            purpose,
        }
    }

    /// Connect through `broker` and guard the new connection.
    pub async fn open(broker: &dyn Broker, purpose: &'static str) -> AppResult<Self> {
        match broker.connect().await {
            Ok(connection) => {
                metrics::record_connect_attempt("success");
                Ok(Self::new(connection, purpose))
            }
            Err(e) => {
                metrics::record_connect_attempt("failure");
                Err(e)
            }
        }
    }

    /// Whether the connection has not been released yet.
    pub fn is_open(&self) -> bool {
        self.connection.is_some()
    }

    pub async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> AppResult<()> {
        self.connection_mut()?.publish(topic, payload).await
    }

    pub async fn subscribe(&mut self, filter: &str) -> AppResult<MessageReceiver> {
        self.connection_mut()?.subscribe(filter).await
    }

    /// Disconnect now. Errors are logged, not returned: there is nothing a
    /// caller could do about a failed disconnect.
    pub async fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            match connection.disconnect().await {
                Ok(()) => debug!(purpose = self.purpose, "Broker connection released"),
                Err(e) => {
                    warn!(purpose = self.purpose, error = %e, "Broker disconnect failed")
                }
            }
        }
    }

    fn connection_mut(&mut self) -> AppResult<&mut (dyn BrokerConnection + 'static)> {
        self.connection
            .as_deref_mut()
            .ok_or_else(|| AppError::Disconnected("connection already released".to_string()))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let purpose = self.purpose;

        match Handle::try_current() {
            Ok(handle) => {
                debug!(purpose, "Connection guard dropped, disconnecting in background");
                handle.spawn(async move {
                    if let Err(e) = connection.disconnect().await {
                        warn!(purpose, error = %e, "Background broker disconnect failed");
                    }
                });
            }
            Err(_) => {
                warn!(
                    purpose,
                    "No async runtime available, broker connection dropped without disconnect"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};
    use std::time::Duration;

    async fn wait_for_open(broker: &MemoryBroker, expected: u64) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while broker.open_connections() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("open connection count did not settle");
    }

    #[tokio::test]
    async fn test_release_disconnects_once() {
        let broker = MemoryBroker::new();
        let mut guard = ConnectionGuard::new(broker.connect().await.unwrap(), "test");
        assert!(guard.is_open());

        guard.release().await;
        guard.release().await;
        drop(guard);
        tokio::task::yield_now().await;

        assert_eq!(broker.open_connections(), 0);
        assert_eq!(broker.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn test_drop_disconnects_in_background() {
        let broker = MemoryBroker::new();
        let guard = ConnectionGuard::new(broker.connect().await.unwrap(), "test");
        assert_eq!(broker.open_connections(), 1);

        drop(guard);
        wait_for_open(&broker, 0).await;
        assert_eq!(broker.stats().disconnects, 1);
    }

    #[tokio::test]
    async fn test_open_propagates_connect_failure() {
        let broker = MemoryBroker::new();
        broker.set_available(false);

        let err = ConnectionGuard::open(&broker, "test").await.err().unwrap();
        assert!(matches!(err, AppError::ConnectionFailed(_)));
        assert_eq!(broker.stats().connect_attempts, 1);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_operations_after_release_fail() {
        let broker = MemoryBroker::new();
        let mut guard = ConnectionGuard::new(broker.connect().await.unwrap(), "test");
        guard.release().await;

        let err = guard.publish("demo/messages", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, AppError::Disconnected(_)));
        assert!(guard.subscribe("demo/messages").await.is_err());
    }
}
