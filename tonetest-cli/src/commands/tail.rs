//! `tonetest tail` command handler

use std::io::Write;
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use tonetest_core::config::SuiteConfig;
use tonetest_core::message::Message;

use crate::cli::TailArgs;
use crate::commands::connect_existing;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// How long one read waits before checking for Ctrl-C again.
const READ_SLICE: Duration = Duration::from_millis(500);

/// Execute the `tail` command: print messages until Ctrl-C or `--count`.
pub async fn execute(
    args: TailArgs,
    config: &SuiteConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    if args.count == Some(0) {
        return Ok(());
    }

    let handle = connect_existing(config).await?;
    let result = follow(&handle, &args, writer).await;
    handle.close().await;
    result
}

async fn follow(
    handle: &tonetest_broker::BrokerHandle,
    args: &TailArgs,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let subscription = handle.connection().subscribe(&args.topic).await?;
    info!(topic = %args.topic, broker = %handle.url(), "tailing");

    let stdout = std::io::stdout();
    let mut cursor = 0;
    let mut printed = 0usize;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        let batch = tokio::select! {
            _ = &mut ctrl_c => return Ok(()),
            batch = subscription.read_from(cursor, Instant::now() + READ_SLICE) => batch,
        };
        let Some(batch) = batch else { continue };
        cursor = batch.next;

        {
            let mut out = stdout.lock();
            for message in batch.messages {
                writer.render_line(&TailLine(message), &mut out)?;
                printed += 1;
                if args.count.is_some_and(|limit| printed >= limit) {
                    out.flush()?;
                    return Ok(());
                }
            }
            out.flush()?;
        }

        if batch.closed {
            warn!(topic = %args.topic, "broker closed the subscription");
            return Err(CliError::Command("broker connection closed".to_owned()));
        }
    }
}

#[derive(Serialize)]
#[serde(transparent)]
pub struct TailLine(pub Message);

impl Render for TailLine {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "{} {}", self.0.topic, self.0.render())
    }
}
