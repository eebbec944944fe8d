//! CLI argument parsing using clap derive API
//!
//! Purely declarative; no side effects or I/O.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// tonetest -- step-based test orchestration over an event broker.
///
/// Use `tonetest <COMMAND> --help` for subcommand details.
#[derive(Parser, Debug)]
#[command(name = "tonetest", version, about, long_about = None)]
pub struct Cli {
    /// Path to the configuration file. `tonetest.toml` is used when present.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Override log format (json, pretty, compact).
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    /// Output format.
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Supported output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    Text,
    /// Machine-readable JSON.
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the built-in self-check suite.
    Selfcheck(SelfcheckArgs),

    /// Run a standalone broker until Ctrl-C.
    Broker(BrokerArgs),

    /// Publish one message.
    Publish(PublishArgs),

    /// Print messages from a topic.
    Tail(TailArgs),

    /// Manage configuration.
    Config(ConfigArgs),
}

// ---- selfcheck ----

#[derive(Args, Debug)]
pub struct SelfcheckArgs {
    /// Write a report (`.json` for JSON, anything else for Markdown).
    #[arg(long)]
    pub report: Option<PathBuf>,

    /// Write every suite message to this file.
    #[arg(long)]
    pub log: Option<PathBuf>,

    /// Write error messages to this file.
    #[arg(long)]
    pub error_log: Option<PathBuf>,

    /// Keep running after a failed step.
    #[arg(long)]
    pub continue_on_failure: bool,
}

// ---- broker ----

#[derive(Args, Debug)]
pub struct BrokerArgs {
    /// Address to listen on (defaults to the configured broker URL).
    #[arg(long)]
    pub url: Option<String>,
}

// ---- publish ----

#[derive(Args, Debug)]
pub struct PublishArgs {
    /// Concrete topic, e.g. `logs.test.v1.boot`.
    pub topic: String,

    /// Message text.
    pub text: String,

    /// Message category.
    #[arg(long, default_value = "info")]
    pub category: CategoryArg,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CategoryArg {
    Info,
    Warn,
    Error,
}

// ---- tail ----

#[derive(Args, Debug)]
pub struct TailArgs {
    /// Topic or pattern (`*` one token, trailing `>` the rest).
    pub topic: String,

    /// Exit after this many messages.
    #[arg(short = 'n', long)]
    pub count: Option<usize>,
}

// ---- config ----

#[derive(Args, Debug)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Validate the configuration and report errors.
    Validate,
    /// Show the effective configuration (file + env overrides + defaults).
    Show,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_debug_assert() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_parse_selfcheck_defaults() {
        let cli = Cli::try_parse_from(["tonetest", "selfcheck"]).expect("parse succeeded");
        assert!(cli.config.is_none());
        assert_eq!(cli.output, OutputFormat::Text);
        match cli.command {
            Commands::Selfcheck(args) => {
                assert!(args.report.is_none());
                assert!(!args.continue_on_failure);
            }
            _ => panic!("expected Selfcheck command"),
        }
    }

    #[test]
    fn test_cli_parse_selfcheck_with_artifacts() {
        let cli = Cli::try_parse_from([
            "tonetest",
            "selfcheck",
            "--report",
            "out/report.md",
            "--log",
            "out/test.log",
            "--error-log",
            "out/error.log",
            "--continue-on-failure",
        ])
        .expect("parse succeeded");
        match cli.command {
            Commands::Selfcheck(args) => {
                assert_eq!(args.report, Some(PathBuf::from("out/report.md")));
                assert_eq!(args.log, Some(PathBuf::from("out/test.log")));
                assert_eq!(args.error_log, Some(PathBuf::from("out/error.log")));
                assert!(args.continue_on_failure);
            }
            _ => panic!("expected Selfcheck command"),
        }
    }

    #[test]
    fn test_cli_parse_publish_with_category() {
        let cli = Cli::try_parse_from([
            "tonetest",
            "publish",
            "logs.test.v1",
            "hello world",
            "--category",
            "error",
        ])
        .expect("parse succeeded");
        match cli.command {
            Commands::Publish(args) => {
                assert_eq!(args.topic, "logs.test.v1");
                assert_eq!(args.text, "hello world");
                assert_eq!(args.category, CategoryArg::Error);
            }
            _ => panic!("expected Publish command"),
        }
    }

    #[test]
    fn test_cli_parse_tail_count() {
        let cli = Cli::try_parse_from(["tonetest", "tail", "logs.>", "-n", "3"])
            .expect("parse succeeded");
        match cli.command {
            Commands::Tail(args) => {
                assert_eq!(args.topic, "logs.>");
                assert_eq!(args.count, Some(3));
            }
            _ => panic!("expected Tail command"),
        }
    }

    #[test]
    fn test_cli_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "tonetest",
            "config",
            "show",
            "--output",
            "json",
            "--config",
            "custom.toml",
            "--log-level",
            "debug",
        ])
        .expect("parse succeeded");
        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert!(matches!(
            cli.command,
            Commands::Config(ConfigArgs {
                action: ConfigAction::Show
            })
        ));
    }

    #[test]
    fn test_cli_rejects_unknown_category() {
        let result = Cli::try_parse_from(["tonetest", "publish", "a", "b", "--category", "fatal"]);
        assert!(result.is_err());
    }
}
