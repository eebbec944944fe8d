//! tonetest CLI entry point.

mod cli;
mod commands;
mod error;
mod logging;
mod output;

use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;

use tonetest_core::config::{LoggingConfig, SuiteConfig};

use crate::cli::{Cli, Commands};
use crate::commands::ConfigSource;
use crate::error::CliError;
use crate::output::OutputWriter;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e}", "error:".red().bold());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
        }
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let source = commands::config_source(cli.config.as_deref());
    let writer = OutputWriter::new(cli.output);

    let command = match cli.command {
        // `config validate` has to report a broken file instead of failing on it.
        Commands::Config(args) => {
            init_logging(
                LoggingConfig::default(),
                cli.log_level.as_deref(),
                cli.log_format.as_deref(),
            )?;
            return commands::config::execute(args, &source, &writer).await;
        }
        other => other,
    };

    // A suite run exits 1 on any setup failure, like on a failed step.
    let runs_suite = matches!(command, Commands::Selfcheck(_));
    let result = dispatch(command, &source, cli.log_level, cli.log_format, &writer).await;
    if runs_suite {
        result.map_err(CliError::into_suite_failure)
    } else {
        result
    }
}

async fn dispatch(
    command: Commands,
    source: &ConfigSource,
    log_level: Option<String>,
    log_format: Option<String>,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    let config = commands::load_config(source).await?;
    init_logging(
        config.logging.clone(),
        log_level.as_deref(),
        log_format.as_deref(),
    )?;
    log_start(source, &config);

    match command {
        Commands::Selfcheck(args) => commands::selfcheck::execute(args, config, writer).await,
        Commands::Broker(args) => commands::broker::execute(args, &config, writer).await,
        Commands::Publish(args) => commands::publish::execute(args, &config, writer).await,
        Commands::Tail(args) => commands::tail::execute(args, &config, writer).await,
        Commands::Config(_) => Ok(()),
    }
}

fn init_logging(
    mut logging: LoggingConfig,
    level: Option<&str>,
    format: Option<&str>,
) -> Result<(), CliError> {
    if let Some(level) = level {
        logging.level = level.to_owned();
    }
    if let Some(format) = format {
        logging.format = format.to_owned();
    }
    logging::init_tracing(&logging).map_err(|e| CliError::Config(e.to_string()))
}

fn log_start(source: &ConfigSource, config: &SuiteConfig) {
    tracing::debug!(
        config = %source,
        version = %config.version,
        broker = %config.broker_url,
        "tonetest starting"
    );
}
