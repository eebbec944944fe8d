//! Broker client connection.
//!
//! A [`BrokerConnection`] owns one TCP stream split into a reader task and a
//! writer task. Every publish, subscribe and ping goes through a single
//! ordered outbound queue, so writes from different callers are serialized
//! and per-topic order is preserved.
//!
//! Subscriptions are idempotent per topic: subscribing twice to the same
//! pattern returns the same [`Subscription`] and its buffer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use tonetest_core::error::BrokerError;
use tonetest_core::message::Message;
use tonetest_core::metrics as m;
use tonetest_core::topic;

use crate::subscription::Subscription;
use crate::wire::{self, Frame};

/// Connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Limit for the TCP connect plus the initial handshake ping.
    pub connect_timeout: Duration,
    /// Messages retained per subscription.
    pub subscription_buffer: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(1200),
            subscription_buffer: 4096,
        }
    }
}

#[derive(Default)]
struct Routes {
    by_sid: HashMap<u64, Arc<Subscription>>,
    by_topic: HashMap<String, Arc<Subscription>>,
}

struct Inner {
    addr: String,
    options: ConnectOptions,
    outbound: mpsc::UnboundedSender<Frame>,
    routes: Mutex<Routes>,
    pending: Mutex<HashMap<u64, oneshot::Sender<()>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A live connection to a broker. Cheap to clone.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("addr", &self.inner.addr)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl BrokerConnection {
    /// Connects to `addr` (`host:port`) and verifies the peer answers a ping.
    pub async fn connect(addr: &str, options: ConnectOptions) -> Result<Self, BrokerError> {
        let stream = tokio::time::timeout(options.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| {
                BrokerError::Connection(format!(
                    "connect to {addr} timed out after {:?}",
                    options.connect_timeout
                ))
            })?
            .map_err(|e| BrokerError::Connection(format!("connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();

        let (read_half, write_half) = stream.into_split();
        let (outbound, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let inner = Arc::new(Inner {
            addr: addr.to_owned(),
            options: options.clone(),
            outbound,
            routes: Mutex::new(Routes::default()),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            cancel: cancel.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        let writer = tokio::spawn(writer_loop(write_half, rx, cancel.clone()));
        let reader = tokio::spawn(reader_loop(read_half, Arc::downgrade(&inner), cancel));
        inner.tasks.lock().await.extend([writer, reader]);

        let connection = Self { inner };
        if let Err(e) = connection.flush(options.connect_timeout).await {
            connection.close().await;
            return Err(BrokerError::Connection(format!(
                "{addr} did not answer the handshake: {e}"
            )));
        }

        debug!(addr, "broker connection established");
        Ok(connection)
    }

    /// Address this connection was opened against.
    pub fn addr(&self) -> &str {
        &self.inner.addr
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Queues a message for publishing.
    ///
    /// Returns once the frame is queued; use [`flush`](Self::flush) to wait
    /// until the broker has routed it.
    pub fn publish(&self, message: Message) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if !topic::is_valid_topic(&message.topic) {
            return Err(BrokerError::Protocol(format!(
                "invalid publish topic '{}'",
                message.topic
            )));
        }
        wire::check_message_size(&message)?;
        let category = message.category.to_string();
        self.send(Frame::Pub { message })?;
        metrics::counter!(m::BROKER_MESSAGES_PUBLISHED_TOTAL, m::LABEL_CATEGORY => category)
            .increment(1);
        Ok(())
    }

    /// Subscribes to a topic pattern, reusing an existing subscription.
    ///
    /// The broker has registered the subscription when this returns, so
    /// anything published afterwards is buffered.
    pub async fn subscribe(&self, pattern: &str) -> Result<Arc<Subscription>, BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        if !topic::is_valid_pattern(pattern) {
            return Err(BrokerError::Protocol(format!(
                "invalid subscription pattern '{pattern}'"
            )));
        }

        let (subscription, created) = {
            let mut routes = self.inner.routes.lock().await;
            match routes.by_topic.get(pattern).cloned() {
                Some(existing) => (existing, false),
                None => {
                    let sid = self.next_id();
                    let subscription = Arc::new(Subscription::new(
                        sid,
                        pattern,
                        self.inner.options.subscription_buffer,
                    ));
                    self.send(Frame::Sub {
                        sid,
                        topic: pattern.to_owned(),
                    })?;
                    routes.by_sid.insert(sid, Arc::clone(&subscription));
                    routes
                        .by_topic
                        .insert(pattern.to_owned(), Arc::clone(&subscription));
                    (subscription, true)
                }
            }
        };

        // Also flushed on reuse: a concurrent first subscriber may still be
        // waiting for the broker to register the pattern.
        self.flush(self.inner.options.connect_timeout).await?;
        if created {
            debug!(topic = pattern, sid = subscription.sid(), "subscribed");
        }
        Ok(subscription)
    }

    /// Drops the subscription for `pattern`, if any.
    pub async fn unsubscribe(&self, pattern: &str) -> Result<(), BrokerError> {
        let removed = {
            let mut routes = self.inner.routes.lock().await;
            let removed = routes.by_topic.remove(pattern);
            if let Some(sub) = &removed {
                routes.by_sid.remove(&sub.sid());
            }
            removed
        };
        if let Some(sub) = removed {
            sub.close().await;
            if !self.is_closed() {
                self.send(Frame::Unsub { sid: sub.sid() })?;
            }
        }
        Ok(())
    }

    /// Number of live subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.inner.routes.lock().await.by_sid.len()
    }

    /// Waits until the broker has routed every frame queued before this call.
    pub async fn flush(&self, timeout: Duration) -> Result<(), BrokerError> {
        if self.is_closed() {
            return Err(BrokerError::Closed);
        }
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send(Frame::Ping { id }) {
            self.inner.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BrokerError::Closed),
            Err(_) => {
                self.inner.pending.lock().await.remove(&id);
                Err(BrokerError::FlushTimeout(timeout))
            }
        }
    }

    /// Closes the connection. Idempotent.
    ///
    /// Every subscription is closed, which wakes pending wait calls.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.cancel.cancel();

        let tasks: Vec<_> = self.inner.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(Duration::from_secs(2), task).await.is_err() {
                warn!(addr = %self.inner.addr, "broker connection task did not stop in time");
            }
        }

        close_routes(&self.inner).await;
        debug!(addr = %self.inner.addr, "broker connection closed");
    }

    fn send(&self, frame: Frame) -> Result<(), BrokerError> {
        self.inner
            .outbound
            .send(frame)
            .map_err(|_| BrokerError::Closed)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

async fn close_routes(inner: &Inner) {
    let subs: Vec<_> = {
        let mut routes = inner.routes.lock().await;
        routes.by_topic.clear();
        routes.by_sid.drain().map(|(_, sub)| sub).collect()
    };
    for sub in subs {
        sub.close().await;
    }
    // Dropping the senders fails every outstanding flush with `Closed`.
    inner.pending.lock().await.clear();
}

async fn writer_loop(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Frame>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                match wire::write_frame(&mut write_half, &frame).await {
                    Ok(()) => {}
                    Err(BrokerError::Protocol(reason)) => {
                        warn!(%reason, op = frame.op(), "dropping frame that cannot be encoded");
                    }
                    Err(e) => {
                        warn!(error = %e, op = frame.op(), "failed to write frame to broker");
                        cancel.cancel();
                        break;
                    }
                }
            }
            _ = cancel.cancelled() => {
                // Frames already queued (e.g. a final publish) still go out.
                while let Ok(frame) = rx.try_recv() {
                    if wire::write_frame(&mut write_half, &frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
}

async fn reader_loop(read_half: OwnedReadHalf, inner: Weak<Inner>, cancel: CancellationToken) {
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        let frame = tokio::select! {
            result = wire::read_frame(&mut reader, &mut line) => result,
            _ = cancel.cancelled() => {
                // The writer gives up on a dead socket; later calls must see
                // `Closed` and pending waits must wake.
                if let Some(inner) = inner.upgrade() {
                    inner.closed.store(true, Ordering::Release);
                    close_routes(&inner).await;
                }
                break;
            }
        };

        let Some(inner) = inner.upgrade() else { break };
        match frame {
            Ok(Some(Frame::Msg { sid, message })) => {
                let sub = inner.routes.lock().await.by_sid.get(&sid).cloned();
                match sub {
                    Some(sub) => sub.push(message).await,
                    None => debug!(sid, "message for unknown subscription dropped"),
                }
            }
            Ok(Some(Frame::Pong { id })) => {
                if let Some(tx) = inner.pending.lock().await.remove(&id) {
                    let _ = tx.send(());
                }
            }
            Ok(Some(Frame::Err { reason })) => {
                warn!(addr = %inner.addr, %reason, "broker rejected a frame");
            }
            Ok(Some(other)) => {
                warn!(op = other.op(), "unexpected frame from broker");
            }
            Ok(None) => {
                debug!(addr = %inner.addr, "broker closed the connection");
                inner.closed.store(true, Ordering::Release);
                cancel.cancel();
                close_routes(&inner).await;
                break;
            }
            Err(e) => {
                warn!(addr = %inner.addr, error = %e, "broker connection read failed");
                inner.closed.store(true, Ordering::Release);
                cancel.cancel();
                close_routes(&inner).await;
                break;
            }
        }
    }
}
