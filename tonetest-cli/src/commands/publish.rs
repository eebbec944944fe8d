//! `tonetest publish` command handler

use std::io::Write;

use serde::Serialize;
use tracing::debug;

use tonetest_core::config::SuiteConfig;
use tonetest_core::message::{Category, Message};
use tonetest_core::topic;

use crate::cli::{CategoryArg, PublishArgs};
use crate::commands::connect_existing;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Publisher label on messages sent from the command line.
pub const CLI_SOURCE: &str = "cli";

/// Execute the `publish` command.
pub async fn execute(
    args: PublishArgs,
    config: &SuiteConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    if !topic::is_valid_topic(&args.topic) {
        return Err(CliError::Command(format!(
            "invalid topic '{}': publish needs a concrete topic",
            args.topic
        )));
    }

    let handle = connect_existing(config).await?;
    let message = Message::new(&args.topic, category(args.category), &args.text)
        .with_source(CLI_SOURCE);
    let report = PublishReport {
        broker: handle.url().to_owned(),
        topic: message.topic.clone(),
        category: message.category,
        timestamp: message.timestamp,
    };

    let result = async {
        handle.connection().publish(message)?;
        handle
            .connection()
            .flush(config.broker.connect_timeout())
            .await
    }
    .await;
    handle.close().await;
    result?;

    debug!(topic = %report.topic, "published");
    writer.render(&report)
}

fn category(arg: CategoryArg) -> Category {
    match arg {
        CategoryArg::Info => Category::Info,
        CategoryArg::Warn => Category::Warn,
        CategoryArg::Error => Category::Error,
    }
}

#[derive(Serialize)]
pub struct PublishReport {
    pub broker: String,
    pub topic: String,
    pub category: Category,
    pub timestamp: i64,
}

impl Render for PublishReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(
            w,
            "published {} message to {} via {}",
            self.category, self.topic, self.broker
        )
    }
}
