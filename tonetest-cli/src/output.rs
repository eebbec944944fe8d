//! Output formatting: text vs JSON
//!
//! All subcommand output flows through [`OutputWriter`]; handlers never
//! branch on the format themselves.

use std::io::Write;

use serde::Serialize;

use crate::cli::OutputFormat;
use crate::error::CliError;

/// Writes payloads to stdout in the selected format.
pub struct OutputWriter {
    format: OutputFormat,
}

impl OutputWriter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    /// Render a payload to stdout.
    pub fn render<T: Render + Serialize>(&self, payload: &T) -> Result<(), CliError> {
        let stdout = std::io::stdout();
        let mut handle = stdout.lock();
        self.render_to(payload, &mut handle)?;
        handle.flush()?;
        Ok(())
    }

    /// Render a payload to any writer.
    pub fn render_to<T: Render + Serialize>(
        &self,
        payload: &T,
        w: &mut dyn Write,
    ) -> Result<(), CliError> {
        match self.format {
            OutputFormat::Text => payload.render_text(w)?,
            OutputFormat::Json => {
                serde_json::to_writer_pretty(&mut *w, payload)?;
                writeln!(w)?;
            }
        }
        Ok(())
    }

    /// Render one record per line (`tail`): compact JSON or text.
    pub fn render_line<T: Render + Serialize>(
        &self,
        payload: &T,
        w: &mut dyn Write,
    ) -> Result<(), CliError> {
        match self.format {
            OutputFormat::Text => payload.render_text(w)?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut *w, payload)?;
                writeln!(w)?;
            }
        }
        Ok(())
    }
}

/// Human-readable text rendering.
///
/// Implemented by every CLI output payload alongside `serde::Serialize`.
pub trait Render {
    fn render_text(&self, w: &mut dyn Write) -> std::io::Result<()>;
}
