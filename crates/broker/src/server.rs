//! Embedded broker.
//!
//! Accepts TCP connections and routes `pub` frames to every matching
//! subscription. Each connection gets its own task and an ordered outbound
//! queue; frames from one connection are handled strictly in order.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tonetest_core::error::BrokerError;
use tonetest_core::topic;

use crate::wire::{self, Frame};

/// Maximum concurrent client connections.
pub const MAX_CONNECTIONS: usize = 256;

struct Route {
    conn: u64,
    sid: u64,
    pattern: String,
}

#[derive(Default)]
struct Router {
    next_conn: u64,
    clients: HashMap<u64, mpsc::UnboundedSender<Frame>>,
    routes: Vec<Route>,
}

impl Router {
    fn register(&mut self, tx: mpsc::UnboundedSender<Frame>) -> u64 {
        self.next_conn += 1;
        let id = self.next_conn;
        self.clients.insert(id, tx);
        id
    }

    fn deregister(&mut self, conn: u64) {
        self.clients.remove(&conn);
        self.routes.retain(|r| r.conn != conn);
    }

    fn subscribe(&mut self, conn: u64, sid: u64, pattern: String) {
        self.routes.retain(|r| !(r.conn == conn && r.sid == sid));
        self.routes.push(Route { conn, sid, pattern });
    }

    fn unsubscribe(&mut self, conn: u64, sid: u64) {
        self.routes.retain(|r| !(r.conn == conn && r.sid == sid));
    }

    fn route(&self, frame_topic: &str, deliver: impl Fn(u64) -> Frame) -> usize {
        let mut delivered = 0;
        for route in &self.routes {
            if !topic::topic_matches(&route.pattern, frame_topic) {
                continue;
            }
            if let Some(tx) = self.clients.get(&route.conn) {
                if tx.send(deliver(route.sid)).is_ok() {
                    delivered += 1;
                }
            }
        }
        delivered
    }
}

/// An in-process broker bound to a TCP address.
///
/// Dropping it stops the accept loop and every connection handler.
pub struct EmbeddedBroker {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for EmbeddedBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedBroker")
            .field("local_addr", &self.local_addr)
            .field("running", &self.is_running())
            .finish()
    }
}

impl EmbeddedBroker {
    /// Binds `addr` (`host:port`, port `0` for an ephemeral one) and starts serving.
    pub async fn bind(addr: &str) -> Result<Self, BrokerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BrokerError::Connection(format!("failed to bind to {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BrokerError::Connection(format!("failed to read local address: {e}")))?;

        let cancel = CancellationToken::new();
        let router = Arc::new(Mutex::new(Router::default()));
        let task = tokio::spawn(accept_loop(listener, router, cancel.clone()));

        info!(%local_addr, "embedded broker listening");
        Ok(Self {
            local_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Client URL for the bound address.
    pub fn url(&self) -> String {
        format!("nats://{}", self.local_addr)
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Stops accepting and disconnects every client. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "embedded broker task ended abnormally");
            }
            info!(local_addr = %self.local_addr, "embedded broker stopped");
        }
    }
}

impl Drop for EmbeddedBroker {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    router: Arc<Mutex<Router>>,
    cancel: CancellationToken,
) {
    let connection_semaphore = Arc::new(Semaphore::new(MAX_CONNECTIONS));
    let mut handlers = Vec::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer) = match result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        error!(error = %e, "broker accept error");
                        continue;
                    }
                };

                let permit = match Arc::clone(&connection_semaphore).try_acquire_owned() {
                    Ok(p) => p,
                    Err(_) => {
                        warn!(%peer, "max connections reached, rejecting connection");
                        continue;
                    }
                };

                debug!(%peer, "broker accepted connection");
                let router = Arc::clone(&router);
                let cancel = cancel.child_token();
                handlers.retain(|h: &JoinHandle<()>| !h.is_finished());
                handlers.push(tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, router, cancel).await {
                        debug!(%peer, error = %e, "broker connection ended with error");
                    }
                    drop(permit);
                }));
            }
            _ = cancel.cancelled() => {
                debug!("broker accept loop received shutdown signal");
                break;
            }
        }
    }

    for handler in handlers {
        let _ = handler.await;
    }
}

async fn handle_connection(
    stream: TcpStream,
    router: Arc<Mutex<Router>>,
    cancel: CancellationToken,
) -> Result<(), BrokerError> {
    stream.set_nodelay(true).ok();
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let conn = router.lock().await.register(tx.clone());

    let writer_cancel = cancel.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                frame = rx.recv() => {
                    let Some(frame) = frame else { break };
                    match wire::write_frame(&mut write_half, &frame).await {
                        Ok(()) => {}
                        Err(BrokerError::Protocol(reason)) => {
                            warn!(conn, %reason, op = frame.op(), "dropping undeliverable frame");
                        }
                        Err(_) => {
                            writer_cancel.cancel();
                            break;
                        }
                    }
                }
                _ = writer_cancel.cancelled() => break,
            }
        }
        let _ = tokio::io::AsyncWriteExt::shutdown(&mut write_half).await;
    });

    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    let result = loop {
        let frame = tokio::select! {
            result = wire::read_frame(&mut reader, &mut line) => result,
            _ = cancel.cancelled() => break Ok(()),
        };

        match frame {
            Ok(Some(frame)) => handle_frame(conn, frame, &router, &tx).await,
            Ok(None) => break Ok(()),
            Err(BrokerError::Protocol(reason)) => {
                warn!(conn, %reason, "rejecting malformed frame");
                let _ = tx.send(Frame::Err { reason });
            }
            Err(e) => break Err(e),
        }
    };

    router.lock().await.deregister(conn);
    cancel.cancel();
    let _ = writer.await;
    debug!(conn, "broker connection closed");
    result
}

async fn handle_frame(
    conn: u64,
    frame: Frame,
    router: &Mutex<Router>,
    tx: &mpsc::UnboundedSender<Frame>,
) {
    match frame {
        Frame::Sub { sid, topic: pattern } => {
            if !topic::is_valid_pattern(&pattern) {
                let _ = tx.send(Frame::Err {
                    reason: format!("invalid subscription pattern '{pattern}'"),
                });
                return;
            }
            router.lock().await.subscribe(conn, sid, pattern);
        }
        Frame::Unsub { sid } => {
            router.lock().await.unsubscribe(conn, sid);
        }
        Frame::Pub { message } => {
            if !topic::is_valid_topic(&message.topic) {
                let _ = tx.send(Frame::Err {
                    reason: format!("invalid publish topic '{}'", message.topic),
                });
                return;
            }
            if let Err(e) = wire::check_message_size(&message) {
                let _ = tx.send(Frame::Err {
                    reason: e.to_string(),
                });
                return;
            }
            let topic = message.topic.clone();
            let delivered = router.lock().await.route(&topic, |sid| Frame::Msg {
                sid,
                message: message.clone(),
            });
            debug!(conn, %topic, delivered, "routed message");
        }
        Frame::Ping { id } => {
            let _ = tx.send(Frame::Pong { id });
        }
        other => {
            let _ = tx.send(Frame::Err {
                reason: format!("unexpected '{}' frame from client", other.op()),
            });
        }
    }
}
