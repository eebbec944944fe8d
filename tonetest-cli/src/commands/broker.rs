//! `tonetest broker` command handler

use std::io::Write;

use serde::Serialize;
use tracing::info;

use tonetest_broker::EmbeddedBroker;
use tonetest_core::config::{SuiteConfig, broker_host_port};

use crate::cli::BrokerArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `broker` command: serve until Ctrl-C.
pub async fn execute(
    args: BrokerArgs,
    config: &SuiteConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let url = args.url.as_deref().unwrap_or(&config.broker_url);
    let listen_addr = listen_address(url)?;

    let broker = EmbeddedBroker::bind(&listen_addr).await?;
    writer.render(&BrokerStarted {
        url: broker.url(),
        listen_addr: broker.local_addr().to_string(),
    })?;

    tokio::signal::ctrl_c().await?;
    info!("received Ctrl-C, stopping broker");
    broker.shutdown().await;
    Ok(())
}

fn listen_address(url: &str) -> Result<String, CliError> {
    let (host, port) = broker_host_port(url)
        .ok_or_else(|| CliError::Config(format!("malformed broker url '{url}'")))?;
    Ok(format!("{host}:{port}"))
}

#[derive(Serialize)]
pub struct BrokerStarted {
    pub url: String,
    pub listen_addr: String,
}

impl Render for BrokerStarted {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "broker listening on {} (Ctrl-C to stop)", self.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listen_address_from_url() {
        assert_eq!(
            listen_address("nats://127.0.0.1:4333").expect("valid"),
            "127.0.0.1:4333"
        );
    }

    #[test]
    fn test_listen_address_rejects_garbage() {
        let err = listen_address("http://host:80").expect_err("malformed");
        assert_eq!(err.exit_code(), 2);
    }
}
