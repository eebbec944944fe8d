//! Suite-scoped subscription buffers.
//!
//! A [`Subscription`] retains every message delivered to it, up to its
//! capacity, tagged with a sequence number. Readers keep a cursor and ask for
//! everything at or after it, so any number of wait calls can scan the same
//! buffer without consuming it. The subscription stays open after a wait
//! gives up; later steps keep observing the same topic.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use tonetest_core::message::Message;
use tonetest_core::metrics as m;

/// Messages read from a subscription in one call.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    /// Messages at or after the requested cursor, in delivery order.
    pub messages: Vec<Message>,
    /// Cursor to pass next time.
    pub next: u64,
    /// The subscription will not receive anything else.
    pub closed: bool,
}

#[derive(Debug, Default)]
struct Buffer {
    entries: VecDeque<(u64, Message)>,
    next_seq: u64,
    closed: bool,
}

/// A topic subscription owned by a broker connection.
#[derive(Debug)]
pub struct Subscription {
    sid: u64,
    topic: String,
    capacity: usize,
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl Subscription {
    pub(crate) fn new(sid: u64, topic: impl Into<String>, capacity: usize) -> Self {
        Self {
            sid,
            topic: topic.into(),
            capacity: capacity.max(1),
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
        }
    }

    /// Subscription id on the wire.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Topic pattern this subscription was registered with.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Appends a delivered message, evicting the oldest when full.
    pub(crate) async fn push(&self, message: Message) {
        {
            let mut buffer = self.buffer.lock().await;
            if buffer.closed {
                return;
            }
            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            buffer.entries.push_back((seq, message));
            if buffer.entries.len() > self.capacity {
                buffer.entries.pop_front();
                metrics::counter!(m::BROKER_MESSAGES_DROPPED_TOTAL).increment(1);
            }
        }
        metrics::counter!(m::BROKER_MESSAGES_DELIVERED_TOTAL).increment(1);
        self.notify.notify_waiters();
    }

    /// Marks the subscription closed and wakes every reader.
    pub(crate) async fn close(&self) {
        self.buffer.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Whether the subscription has been closed.
    pub async fn is_closed(&self) -> bool {
        self.buffer.lock().await.closed
    }

    /// Number of messages currently retained.
    pub async fn len(&self) -> usize {
        self.buffer.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Cursor pointing past everything delivered so far.
    pub async fn head(&self) -> u64 {
        self.buffer.lock().await.next_seq
    }

    /// Everything retained at or after `cursor`, without waiting.
    ///
    /// A cursor older than the oldest retained entry starts at that entry.
    pub async fn since(&self, cursor: u64) -> Batch {
        let buffer = self.buffer.lock().await;
        let messages = buffer
            .entries
            .iter()
            .filter(|(seq, _)| *seq >= cursor)
            .map(|(_, message)| message.clone())
            .collect();
        Batch {
            messages,
            next: buffer.next_seq,
            closed: buffer.closed,
        }
    }

    /// Waits for entries at or after `cursor`.
    ///
    /// Returns `None` if `deadline` passes first. A closed subscription
    /// returns immediately with `closed` set.
    pub async fn read_from(&self, cursor: u64, deadline: Instant) -> Option<Batch> {
        loop {
            // Register interest before inspecting the buffer so a push between
            // the inspection and the await still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let batch = self.since(cursor).await;
            if !batch.messages.is_empty() || batch.closed {
                return Some(batch);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }
}
