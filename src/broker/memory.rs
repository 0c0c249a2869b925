//! In-process broker.
//!
//! Behaves like a minimal MQTT broker without QoS or retained messages:
//! topic filters with `+` and `#` wildcards, per-connection subscriptions,
//! delivery in publish order. Used with `BROKER_KIND=memory` and by the test
//! suite, which also relies on its counters and failure injection.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use super::{Broker, BrokerConnection, BrokerMessage, MessageReceiver};
use crate::error::{AppError, AppResult};
use crate::validation::{topic_matches, validate_topic_filter, validate_topic_name};

/// Counter snapshot for a [`MemoryBroker`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryBrokerStats {
    /// Every call to `connect`, successful or not
    pub connect_attempts: u64,
    /// Successful connects
    pub connects: u64,
    /// Accepted publishes
    pub publishes: u64,
    /// Completed disconnects
    pub disconnects: u64,
}

struct Subscriber {
    connection_id: u64,
    filter: String,
    sender: mpsc::UnboundedSender<BrokerMessage>,
}

struct Inner {
    subscribers: Mutex<Vec<Subscriber>>,
    next_connection_id: AtomicU64,
    available: AtomicBool,
    failures_remaining: AtomicU32,
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    publishes: AtomicU64,
    disconnects: AtomicU64,
}

impl Inner {
    fn subscribers(&self) -> MutexGuard<'_, Vec<Subscriber>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cheaply clonable handle to an in-process broker.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                next_connection_id: AtomicU64::new(1),
                available: AtomicBool::new(true),
                failures_remaining: AtomicU32::new(0),
                connect_attempts: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                publishes: AtomicU64::new(0),
                disconnects: AtomicU64::new(0),
            }),
        }
    }

    /// Refuse (`false`) or accept (`true`) all new connections.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Refuse the next `count` connection attempts.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Drop every subscription, as a broker restart would.
    ///
    /// Receivers observe end-of-stream. Connections stay open and still have
    /// to be disconnected. Returns the number of subscriptions removed.
    pub fn sever_subscriptions(&self) -> usize {
        let mut subscribers = self.inner.subscribers();
        let count = subscribers.len();
        subscribers.clear();
        debug!(count, "Severed all subscriptions");
        count
    }

    /// Number of live subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscribers().len()
    }

    /// Connections opened and not yet disconnected.
    pub fn open_connections(&self) -> u64 {
        let stats = self.stats();
        stats.connects - stats.disconnects
    }

    pub fn stats(&self) -> MemoryBrokerStats {
        MemoryBrokerStats {
            connect_attempts: self.inner.connect_attempts.load(Ordering::SeqCst),
            connects: self.inner.connects.load(Ordering::SeqCst),
            publishes: self.inner.publishes.load(Ordering::SeqCst),
            disconnects: self.inner.disconnects.load(Ordering::SeqCst),
        }
    }

    fn take_injected_failure(&self) -> bool {
        self.inner
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self) -> AppResult<Box<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);

        if !self.inner.available.load(Ordering::SeqCst) || self.take_injected_failure() {
            return Err(AppError::ConnectionFailed(
                "memory broker refused the connection".to_string(),
            ));
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        trace!(connection_id = id, "Memory broker connection opened");

        Ok(Box::new(MemoryConnection {
            id,
            broker: self.inner.clone(),
        }))
    }
}

struct MemoryConnection {
    id: u64,
    broker: Arc<Inner>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn publish(&mut self, topic: &str, payload: Vec<u8>) -> AppResult<()> {
        validate_topic_name(topic)?;

        let message = BrokerMessage::new(topic, payload);
        let mut subscribers = self.broker.subscribers();
        subscribers.retain(|subscriber| {
            if topic_matches(&subscriber.filter, topic) {
                subscriber.sender.send(message.clone()).is_ok()
            } else {
                true
            }
        });
        self.broker.publishes.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }

    async fn subscribe(&mut self, filter: &str) -> AppResult<MessageReceiver> {
        validate_topic_filter(filter)?;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.broker.subscribers().push(Subscriber {
            connection_id: self.id,
            filter: filter.to_string(),
            sender,
        });

        Ok(receiver)
    }

    async fn disconnect(self: Box<Self>) -> AppResult<()> {
        self.broker
            .subscribers()
            .retain(|subscriber| subscriber.connection_id != self.id);
        self.broker.disconnects.fetch_add(1, Ordering::SeqCst);
        trace!(connection_id = self.id, "Memory broker connection closed");

        Ok(())
    }
}
