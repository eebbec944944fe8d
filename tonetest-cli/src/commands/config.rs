//! `tonetest config` command handler

use std::io::Write;

use serde::Serialize;
use tracing::info;

use crate::cli::{ConfigAction, ConfigArgs};
use crate::commands::{ConfigSource, load_config};
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `config` command.
pub async fn execute(
    args: ConfigArgs,
    source: &ConfigSource,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    match args.action {
        ConfigAction::Validate => execute_validate(source, writer).await,
        ConfigAction::Show => execute_show(source, writer).await,
    }
}

async fn execute_validate(source: &ConfigSource, writer: &OutputWriter) -> Result<(), CliError> {
    info!(source = %source, "validating configuration");

    let report = match load_config(source).await {
        Ok(_) => ConfigValidationReport {
            source: source.to_string(),
            valid: true,
            errors: Vec::new(),
        },
        Err(e) => ConfigValidationReport {
            source: source.to_string(),
            valid: false,
            errors: vec![e.to_string()],
        },
    };

    writer.render(&report)?;

    if !report.valid {
        return Err(CliError::Config("configuration is invalid".to_owned()));
    }
    Ok(())
}

async fn execute_show(source: &ConfigSource, writer: &OutputWriter) -> Result<(), CliError> {
    info!(source = %source, "loading configuration");
    let config = load_config(source).await?;

    let report = ConfigReport {
        source: source.to_string(),
        suite_topic: config.suite_topic(),
        config_toml: toml::to_string_pretty(&config)
            .map_err(|e| CliError::Config(format!("failed to serialize configuration: {e}")))?,
    };
    writer.render(&report)
}

#[derive(Serialize)]
pub struct ConfigValidationReport {
    pub source: String,
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Render for ConfigValidationReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        if self.valid {
            writeln!(w, "Configuration OK: {}", self.source)
        } else {
            writeln!(w, "Configuration INVALID: {}", self.source)?;
            for error in &self.errors {
                writeln!(w, "  - {error}")?;
            }
            Ok(())
        }
    }
}

#[derive(Serialize)]
pub struct ConfigReport {
    pub source: String,
    pub suite_topic: String,
    pub config_toml: String,
}

impl Render for ConfigReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        writeln!(w, "# source: {}", self.source)?;
        writeln!(w, "# suite topic: {}", self.suite_topic)?;
        write!(w, "{}", self.config_toml)
    }
}
