//! Report artifacts for a finished suite.
//!
//! A `.json` path gets the serialized [`SuiteSummary`]; anything else gets
//! Markdown.

use std::fmt::Write as _;
use std::path::Path;

use tonetest_core::error::TonetestError;

use crate::runner::{StepStatus, SuiteSummary};

/// Writes the report, creating parent directories as needed.
pub async fn write_report(summary: &SuiteSummary, path: &Path) -> Result<(), TonetestError> {
    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"));
    let body = if is_json {
        render_json(summary)?
    } else {
        render_markdown(summary)
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, body).await?;
    Ok(())
}

/// Pretty-printed JSON.
pub fn render_json(summary: &SuiteSummary) -> Result<String, TonetestError> {
    serde_json::to_string_pretty(summary)
        .map_err(|e| TonetestError::Io(std::io::Error::other(e)))
}

/// Human-readable Markdown.
pub fn render_markdown(summary: &SuiteSummary) -> String {
    let mut out = String::new();
    let status = if summary.is_success() { "PASS" } else { "FAIL" };
    let total = summary.results.len();

    let _ = writeln!(out, "# Test Report: {}", summary.version);
    let _ = writeln!(out);
    let _ = writeln!(
        out,
        "- **Date**: {}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(out, "- **Run**: `{}`", summary.run_id);
    let _ = writeln!(out, "- **Total Duration**: {:?}", summary.total_duration);
    let _ = writeln!(out, "- **Passed**: {}/{}", summary.passed(), total);
    if summary.not_run() > 0 {
        let _ = writeln!(out, "- **Not Run**: {}", summary.not_run());
    }
    let _ = writeln!(out, "- **Status**: {status}");

    for result in &summary.results {
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}", result.name);
        let _ = writeln!(out);
        let label = match result.status {
            StepStatus::Passed => "✅ PASSED",
            StepStatus::Failed => "❌ FAILED",
            StepStatus::NotRun => "⏭ NOT RUN",
        };
        let _ = writeln!(out, "- **Status**: {label}");
        if result.status != StepStatus::NotRun {
            let _ = writeln!(out, "- **Duration**: {:?}", result.duration);
        }
        if let Some(error) = &result.error {
            let _ = writeln!(out, "- **Error**: `{error}`");
        }
        if let Some(report) = result.report.as_deref().filter(|r| !r.trim().is_empty()) {
            let _ = writeln!(out);
            let _ = writeln!(out, "### Report");
            let _ = writeln!(out);
            let _ = writeln!(out, "{}", report.trim_end());
        }
    }
    out
}
