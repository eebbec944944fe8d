//! `tonetest selfcheck` command handler

use std::io::Write;

use colored::Colorize;
use serde::Serialize;
use tracing::info;

use tonetest_core::config::{FailurePolicy, SuiteConfig};
use tonetest_suite::{StepStatus, SuiteSummary, run_suite, selfcheck_suite};

use crate::cli::SelfcheckArgs;
use crate::error::CliError;
use crate::output::{OutputWriter, Render};

/// Execute the `selfcheck` command.
pub async fn execute(
    args: SelfcheckArgs,
    mut config: SuiteConfig,
    writer: &OutputWriter,
) -> Result<(), CliError> {
    apply_args(&args, &mut config);
    info!(
        version = %config.version,
        broker = %config.broker_url,
        policy = %config.failure_policy,
        "running self-check suite"
    );

    let suite = selfcheck_suite(config)
        .map_err(|e| CliError::Command(format!("failed to build self-check suite: {e}")))?;
    let summary = run_suite(suite).await?;

    let report = SelfcheckReport(summary);
    writer.render(&report)?;

    if report.0.is_success() {
        Ok(())
    } else {
        Err(CliError::Command(format!(
            "{} step(s) failed",
            report.0.failed()
        )))
    }
}

fn apply_args(args: &SelfcheckArgs, config: &mut SuiteConfig) {
    if args.continue_on_failure {
        config.failure_policy = FailurePolicy::Continue;
    }
    if let Some(path) = &args.report {
        config.report_path = Some(path.display().to_string());
    }
    if let Some(path) = &args.log {
        config.log_path = Some(path.display().to_string());
    }
    if let Some(path) = &args.error_log {
        config.error_log_path = Some(path.display().to_string());
    }
}

#[derive(Serialize)]
#[serde(transparent)]
pub struct SelfcheckReport(pub SuiteSummary);

impl Render for SelfcheckReport {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()> {
        let summary = &self.0;
        for result in &summary.results {
            let label = match result.status {
                StepStatus::Passed => "PASS".green().bold(),
                StepStatus::Failed => "FAIL".red().bold(),
                StepStatus::NotRun => "SKIP".yellow(),
            };
            write!(w, "{label} {}", result.name)?;
            if result.status != StepStatus::NotRun {
                write!(w, " ({} ms)", result.duration.as_millis())?;
            }
            writeln!(w)?;
            if let Some(error) = &result.error {
                writeln!(w, "     {error}")?;
            }
        }
        writeln!(w)?;
        writeln!(
            w,
            "{} passed, {} failed, {} not run in {} ms",
            summary.passed(),
            summary.failed(),
            summary.not_run(),
            summary.total_duration.as_millis()
        )
    }
}
