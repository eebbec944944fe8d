//! Per-step facade over the suite's broker connection.
//!
//! # Wait algorithm
//!
//! Every `wait_*_after_action` call follows the same sequence:
//!
//! 1. Subscribe to the topic (idempotent, suite-scoped) and wait until the
//!    broker has registered it.
//! 2. Run the action. Anything it publishes, even synchronously, lands in the
//!    subscription buffer.
//! 3. Start the deadline, then scan the buffer from its oldest entry and keep
//!    scanning live arrivals. A message qualifies only if its timestamp is at
//!    or after the step's start clock (`T0`) and its rendered line contains a
//!    pending pattern.
//!
//! The buffer is never consumed, and a timed-out wait leaves the
//! subscription open for later steps. Older traffic on the same topic is
//! excluded by the `T0` bound alone.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use tonetest_broker::BrokerConnection;
use tonetest_core::error::{BrokerError, StepError};
use tonetest_core::message::{Category, Message};
use tonetest_core::metrics as m;
use tonetest_core::topic;

use crate::logger::TopicLogger;
use crate::subtone::{SubtoneBridge, SubtoneInvocation, SubtoneOutput};

struct ContextInner {
    step_name: String,
    suite_topic: String,
    step_topic: String,
    error_topic: String,
    broker_url: String,
    started_at: i64,
    connection: BrokerConnection,
    step_logger: TopicLogger,
    error_logger: TopicLogger,
    subtones: SubtoneBridge,
}

/// Everything a step function can touch. Cheap to clone.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step", &self.inner.step_name)
            .field("step_topic", &self.inner.step_topic)
            .field("started_at", &self.inner.started_at)
            .finish()
    }
}

/// Inputs for [`StepContext::new`].
#[derive(Debug, Clone)]
pub struct ContextParts {
    pub step_name: String,
    pub suite_topic: String,
    pub broker_url: String,
    /// Step start clock, Unix nanoseconds.
    pub started_at: i64,
    pub connection: BrokerConnection,
    pub step_logger: TopicLogger,
    pub subtones: SubtoneBridge,
}

impl StepContext {
    pub fn new(parts: ContextParts) -> Self {
        let step_topic = parts.step_logger.topic().to_owned();
        let error_topic = topic::error_topic(&parts.suite_topic);
        let error_logger = TopicLogger::new(
            parts.connection.clone(),
            error_topic.clone(),
            parts.step_name.clone(),
        );
        Self {
            inner: Arc::new(ContextInner {
                step_name: parts.step_name,
                suite_topic: parts.suite_topic,
                step_topic,
                error_topic,
                broker_url: parts.broker_url,
                started_at: parts.started_at,
                connection: parts.connection,
                step_logger: parts.step_logger,
                error_logger,
                subtones: parts.subtones,
            }),
        }
    }

    // ─── Accessors ──────────────────────────────────────────────────

    pub fn step_name(&self) -> &str {
        &self.inner.step_name
    }

    pub fn suite_topic(&self) -> &str {
        &self.inner.suite_topic
    }

    /// This step's canonical topic.
    pub fn step_topic(&self) -> &str {
        &self.inner.step_topic
    }

    pub fn error_topic(&self) -> &str {
        &self.inner.error_topic
    }

    pub fn broker_url(&self) -> &str {
        &self.inner.broker_url
    }

    /// Step start clock (`T0`), Unix nanoseconds.
    pub fn started_at(&self) -> i64 {
        self.inner.started_at
    }

    /// The suite's broker connection.
    pub fn connection(&self) -> &BrokerConnection {
        &self.inner.connection
    }

    // ─── Logging ────────────────────────────────────────────────────

    /// Publishes an `info` message on the step topic.
    pub fn info(&self, text: impl Into<String>) -> Result<(), StepError> {
        self.inner.step_logger.info(text)?;
        Ok(())
    }

    pub fn warn(&self, text: impl Into<String>) -> Result<(), StepError> {
        self.inner.step_logger.warn(text)?;
        Ok(())
    }

    /// Publishes an `error` message on the step topic and mirrors it to the
    /// suite error topic.
    pub fn error(&self, text: impl Into<String>) -> Result<(), StepError> {
        let text = text.into();
        self.inner.step_logger.error(text.clone())?;
        self.inner.error_logger.error(text)?;
        Ok(())
    }

    /// A publisher bound to an arbitrary topic, sourced as this step.
    pub fn new_topic_logger(&self, topic: impl Into<String>) -> TopicLogger {
        TopicLogger::new(
            self.inner.connection.clone(),
            topic,
            self.inner.step_name.clone(),
        )
    }

    /// Restarts the step logger's `T+` clock. Does not move `T0`.
    pub fn reset_step_log_clock(&self) {
        self.inner.step_logger.reset_clock();
    }

    // ─── Subtones ───────────────────────────────────────────────────

    /// Runs a child command through the suite's subtone bridge.
    pub async fn spawn_subtone(
        &self,
        invocation: SubtoneInvocation,
    ) -> Result<SubtoneOutput, StepError> {
        self.inner.subtones.spawn(invocation).await
    }

    /// Topic a subtone for `plugin` relays to.
    pub fn subtone_topic(&self, plugin: &str) -> String {
        self.inner.subtones.topic_for(plugin)
    }

    // ─── Waits ──────────────────────────────────────────────────────

    /// Waits for a message on `topic` containing `pattern` after running `action`.
    ///
    /// `action` is not polled until the subscription is live.
    pub async fn wait_for_message_after_action<Fut>(
        &self,
        topic: &str,
        pattern: &str,
        timeout: Duration,
        action: Fut,
    ) -> Result<(), StepError>
    where
        Fut: Future<Output = Result<(), StepError>>,
    {
        self.wait_after_action(topic, &[pattern], None, timeout, action)
            .await
    }

    /// Like [`wait_for_message_after_action`](Self::wait_for_message_after_action),
    /// restricted to `error` messages.
    pub async fn wait_for_error_message_after_action<Fut>(
        &self,
        topic: &str,
        pattern: &str,
        timeout: Duration,
        action: Fut,
    ) -> Result<(), StepError>
    where
        Fut: Future<Output = Result<(), StepError>>,
    {
        self.wait_after_action(topic, &[pattern], Some(Category::Error), timeout, action)
            .await
    }

    /// Waits until every pattern has been matched, in any order.
    ///
    /// Each message satisfies at most one pending pattern. On timeout the
    /// error lists the patterns still pending. An empty pattern list is
    /// rejected before the action runs.
    pub async fn wait_for_all_messages_after_action<Fut>(
        &self,
        topic: &str,
        patterns: &[&str],
        timeout: Duration,
        action: Fut,
    ) -> Result<(), StepError>
    where
        Fut: Future<Output = Result<(), StepError>>,
    {
        self.wait_after_action(topic, patterns, None, timeout, action)
            .await
    }

    /// Waits on this step's own topic.
    pub async fn wait_for_step_message_after_action<Fut>(
        &self,
        pattern: &str,
        timeout: Duration,
        action: Fut,
    ) -> Result<(), StepError>
    where
        Fut: Future<Output = Result<(), StepError>>,
    {
        let topic = self.inner.step_topic.clone();
        self.wait_after_action(&topic, &[pattern], None, timeout, action)
            .await
    }

    /// Waits without an action.
    pub async fn wait_for_message(
        &self,
        topic: &str,
        pattern: &str,
        timeout: Duration,
    ) -> Result<(), StepError> {
        self.wait_after_action(topic, &[pattern], None, timeout, async { Ok(()) })
            .await
    }

    async fn wait_after_action<Fut>(
        &self,
        topic: &str,
        patterns: &[&str],
        category: Option<Category>,
        timeout: Duration,
        action: Fut,
    ) -> Result<(), StepError>
    where
        Fut: Future<Output = Result<(), StepError>>,
    {
        if patterns.is_empty() {
            return Err(StepError::failed(format!(
                "no patterns provided for wait on {topic}"
            )));
        }

        let subscription = self.inner.connection.subscribe(topic).await?;

        action.await?;

        let deadline = Instant::now() + timeout;
        let mut pending: Vec<&str> = patterns.to_vec();

        let mut cursor = 0;
        loop {
            let Some(batch) = subscription.read_from(cursor, deadline).await else {
                metrics::counter!(m::WAIT_TIMEOUTS_TOTAL).increment(1);
                warn!(
                    step = %self.inner.step_name,
                    topic,
                    missing = ?pending,
                    ?timeout,
                    "wait timed out"
                );
                return Err(StepError::WaitTimeout {
                    topic: topic.to_owned(),
                    missing: pending.into_iter().map(str::to_owned).collect(),
                    timeout,
                });
            };
            cursor = batch.next;

            for message in &batch.messages {
                if !self.qualifies(message, category) {
                    continue;
                }
                let rendered = message.render();
                if let Some(pos) = pending.iter().position(|p| rendered.contains(p)) {
                    let matched = pending.remove(pos);
                    debug!(step = %self.inner.step_name, topic, pattern = matched, "wait matched");
                }
                if pending.is_empty() {
                    metrics::counter!(m::WAIT_MATCHED_TOTAL).increment(1);
                    return Ok(());
                }
            }

            if batch.closed {
                return Err(StepError::Broker(BrokerError::Closed));
            }
        }
    }

    fn qualifies(&self, message: &Message, category: Option<Category>) -> bool {
        message.timestamp >= self.inner.started_at
            && category.is_none_or(|c| message.category == c)
    }
}
