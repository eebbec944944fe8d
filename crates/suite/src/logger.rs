//! Topic-bound publisher with its own clock.

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use tonetest_broker::BrokerConnection;
use tonetest_core::error::BrokerError;
use tonetest_core::message::{Category, Message, now_nanos};

const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Publishes to one topic, stamping each message with the seconds elapsed
/// since the logger's clock epoch.
///
/// Clones share the clock.
#[derive(Debug, Clone)]
pub struct TopicLogger {
    topic: String,
    source: String,
    connection: BrokerConnection,
    epoch: Arc<AtomicI64>,
}

impl TopicLogger {
    pub fn new(
        connection: BrokerConnection,
        topic: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            source: source.into(),
            connection,
            epoch: Arc::new(AtomicI64::new(now_nanos())),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Restarts the clock at the current time.
    pub fn reset_clock(&self) {
        self.epoch.store(now_nanos(), Ordering::Release);
    }

    /// Whole seconds since the clock epoch.
    pub fn elapsed_secs(&self) -> u64 {
        let elapsed = now_nanos().saturating_sub(self.epoch.load(Ordering::Acquire));
        u64::try_from(elapsed / NANOS_PER_SEC).unwrap_or(0)
    }

    pub fn info(&self, text: impl Into<String>) -> Result<(), BrokerError> {
        self.publish(Category::Info, text)
    }

    pub fn warn(&self, text: impl Into<String>) -> Result<(), BrokerError> {
        self.publish(Category::Warn, text)
    }

    pub fn error(&self, text: impl Into<String>) -> Result<(), BrokerError> {
        self.publish(Category::Error, text)
    }

    /// Builds and queues one message.
    pub fn publish(&self, category: Category, text: impl Into<String>) -> Result<(), BrokerError> {
        self.connection.publish(self.message(category, text))
    }

    /// The message [`publish`](Self::publish) would send.
    pub fn message(&self, category: Category, text: impl Into<String>) -> Message {
        Message::new(self.topic.clone(), category, text)
            .with_source(self.source.clone())
            .with_elapsed(self.elapsed_secs())
    }
}
