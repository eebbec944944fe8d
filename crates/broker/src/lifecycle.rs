//! Broker lifecycle: reach an existing broker or start an embedded one.
//!
//! [`BrokerManager::ensure`] first tries the configured URL. If nothing
//! answers and auto-start is enabled, it binds an [`EmbeddedBroker`] on the
//! same address and retries the connection with a doubling backoff.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info, warn};

use tonetest_core::config::{BrokerSettings, SuiteConfig, broker_host_port};
use tonetest_core::error::BrokerError;
use tonetest_core::metrics as m;

use crate::client::{BrokerConnection, ConnectOptions};
use crate::server::EmbeddedBroker;

/// Resolves a broker URL into a live [`BrokerHandle`].
#[derive(Debug, Clone)]
pub struct BrokerManager {
    settings: BrokerSettings,
    auto_start: bool,
}

impl BrokerManager {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            auto_start: true,
        }
    }

    /// Manager configured from a suite's broker settings.
    pub fn from_config(config: &SuiteConfig) -> Self {
        Self::new(config.broker.clone()).auto_start(config.auto_start_broker)
    }

    /// Whether an embedded broker may be started when none answers.
    pub fn auto_start(mut self, enabled: bool) -> Self {
        self.auto_start = enabled;
        self
    }

    /// Connects to `url`, starting an embedded broker if allowed.
    ///
    /// `timeout` bounds each individual connection attempt.
    pub async fn ensure(&self, url: &str, timeout: Duration) -> Result<BrokerHandle, BrokerError> {
        let (host, port) = broker_host_port(url).ok_or_else(|| BrokerError::Unavailable {
            url: url.to_owned(),
            reason: "malformed broker URL".to_owned(),
        })?;
        let addr = format!("{host}:{port}");
        let options = ConnectOptions {
            connect_timeout: timeout,
            subscription_buffer: self.settings.subscription_buffer,
        };

        let first_error = match BrokerConnection::connect(&addr, options.clone()).await {
            Ok(connection) => {
                info!(url, "connected to existing broker");
                return Ok(BrokerHandle::new(url.to_owned(), connection, None));
            }
            Err(e) => e,
        };

        if !self.auto_start {
            return Err(BrokerError::Unavailable {
                url: url.to_owned(),
                reason: first_error.to_string(),
            });
        }

        debug!(url, error = %first_error, "no broker answered, starting embedded broker");
        let embedded = EmbeddedBroker::bind(&addr)
            .await
            .map_err(|e| BrokerError::Unavailable {
                url: url.to_owned(),
                reason: format!("embedded broker failed to start: {e}"),
            })?;
        metrics::counter!(m::BROKER_EMBEDDED_STARTS_TOTAL).increment(1);

        let attempts = self.settings.start_attempts.max(1);
        let mut backoff = self.settings.start_backoff();
        let mut last_error = None;
        for attempt in 1..=attempts {
            match BrokerConnection::connect(&addr, options.clone()).await {
                Ok(connection) => {
                    info!(url, attempt, "connected to embedded broker");
                    return Ok(BrokerHandle::new(url.to_owned(), connection, Some(embedded)));
                }
                Err(e) => {
                    warn!(url, attempt, attempts, error = %e, "embedded broker not reachable yet");
                    last_error = Some(e);
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff = backoff.saturating_mul(2);
                    }
                }
            }
        }

        embedded.shutdown().await;
        Err(BrokerError::Unavailable {
            url: url.to_owned(),
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "embedded broker never answered".to_owned()),
        })
    }
}

/// A connected broker, optionally owning the embedded server behind it.
#[derive(Debug)]
pub struct BrokerHandle {
    url: String,
    connection: BrokerConnection,
    embedded: Option<EmbeddedBroker>,
    closed: AtomicBool,
}

impl BrokerHandle {
    fn new(url: String, connection: BrokerConnection, embedded: Option<EmbeddedBroker>) -> Self {
        Self {
            url,
            connection,
            embedded,
            closed: AtomicBool::new(false),
        }
    }

    /// The client connection. Cloning it shares the same stream.
    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether this handle started the broker it talks to.
    pub fn is_embedded(&self) -> bool {
        self.embedded.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Closes the connection and stops the embedded broker, if any. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connection.close().await;
        if let Some(embedded) = &self.embedded {
            embedded.shutdown().await;
        }
        debug!(url = %self.url, "broker handle closed");
    }
}
