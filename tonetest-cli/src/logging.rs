//! Logging initialization for the tonetest CLI.
//!
//! Diagnostics go to stderr so command output on stdout stays parseable.
//! `RUST_LOG` wins over the configured level.

use anyhow::Result;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use tonetest_core::config::LoggingConfig;

/// Initialize the global tracing subscriber.
///
/// Must be called at most once per process.
///
/// # Formats
///
/// * `"json"` - machine-parseable JSON lines
/// * `"pretty"` - multi-line human-readable output
/// * `"compact"` - one short line per event
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match config.format.as_str() {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize JSON tracing subscriber: {e}"))?,
        "pretty" => registry
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize pretty tracing subscriber: {e}"))?,
        "compact" => registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
            .map_err(|e| anyhow::anyhow!("failed to initialize compact tracing subscriber: {e}"))?,
        other => {
            return Err(anyhow::anyhow!(
                "unknown log format '{other}', expected 'json', 'pretty' or 'compact'"
            ));
        }
    }

    Ok(())
}
