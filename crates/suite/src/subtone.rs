//! Subtone bridge: run a child command and relay it into the event stream.
//!
//! For plugin `p` under suite topic `s`, everything goes to `s.subtone.p`:
//!
//! ```text
//! [INFO] spawning subtone for p
//! [INFO] subtone started (pid 4242): sh -c "echo MARKER; exit 3"
//! [INFO] MARKER
//! [INFO] subtone for p exited with code 3
//! ```
//!
//! The exit message is published only after every output line.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use tonetest_broker::BrokerConnection;
use tonetest_core::error::StepError;
use tonetest_core::message::Category;
use tonetest_core::metrics as m;
use tonetest_core::topic;

use crate::logger::TopicLogger;

/// Exit code reported when the child was terminated by a signal.
pub const SIGNALLED_EXIT_CODE: i32 = -1;

/// Longest output line relayed as one message; the rest is cut off.
/// Captured lines keep their full text.
pub const MAX_RELAYED_LINE_BYTES: usize = 64 * 1024;

/// A child command to run on behalf of a plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtoneInvocation {
    plugin: String,
    command: String,
    args: Vec<String>,
    working_dir: Option<PathBuf>,
}

impl SubtoneInvocation {
    pub fn new(plugin: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            command: command.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn plugin(&self) -> &str {
        &self.plugin
    }

    /// `command arg1 arg2`, for log lines.
    pub fn command_line(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Result of a finished subtone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubtoneOutput {
    pub plugin: String,
    pub exit_code: i32,
    /// Topic the output was relayed to.
    pub topic: String,
    /// Combined stdout and stderr lines in arrival order.
    pub lines: Vec<String>,
}

impl SubtoneOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a nonzero exit into [`StepError::SubtoneFailure`].
    pub fn expect_success(self) -> Result<Self, StepError> {
        if self.success() {
            Ok(self)
        } else {
            Err(StepError::SubtoneFailure {
                plugin: self.plugin,
                code: self.exit_code,
                output: self.lines,
            })
        }
    }
}

/// Spawns subtones over a shared broker connection.
///
/// One spawn runs at a time per bridge; clones share the gate.
#[derive(Debug, Clone)]
pub struct SubtoneBridge {
    connection: BrokerConnection,
    suite_topic: String,
    gate: Arc<Mutex<()>>,
}

impl SubtoneBridge {
    pub fn new(connection: BrokerConnection, suite_topic: impl Into<String>) -> Self {
        Self {
            connection,
            suite_topic: suite_topic.into(),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// Topic output for `plugin` is relayed to.
    pub fn topic_for(&self, plugin: &str) -> String {
        topic::subtone_topic(&self.suite_topic, plugin)
    }

    /// Runs the invocation to completion.
    ///
    /// A nonzero exit is not an error here; see [`SubtoneOutput::expect_success`].
    pub async fn spawn(&self, invocation: SubtoneInvocation) -> Result<SubtoneOutput, StepError> {
        let _guard = self.gate.lock().await;

        let plugin = invocation.plugin.clone();
        let topic = self.topic_for(&plugin);
        let logger = TopicLogger::new(self.connection.clone(), topic.clone(), plugin.clone());

        logger.info(format!("spawning subtone for {plugin}"))?;

        let mut command = Command::new(&invocation.command);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                let reason = e.to_string();
                warn!(%plugin, command = %invocation.command_line(), error = %reason, "subtone failed to start");
                logger.error(format!("subtone for {plugin} failed to start: {reason}"))?;
                return Err(StepError::SubtoneSpawn { plugin, reason });
            }
        };
        metrics::counter!(m::SUBTONE_SPAWNED_TOTAL).increment(1);

        let pid = child.id().unwrap_or_default();
        info!(%plugin, pid, command = %invocation.command_line(), "subtone started");
        logger.info(format!(
            "subtone started (pid {pid}): {}",
            invocation.command_line()
        ))?;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(forward_lines(stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(forward_lines(stderr, tx.clone())));
        }
        drop(tx);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            logger.publish(Category::Info, relay_text(&line))?;
            lines.push(line);
        }
        for reader in readers {
            let _ = reader.await;
        }

        let status = child.wait().await?;
        let exit_code = status.code().unwrap_or(SIGNALLED_EXIT_CODE);
        if exit_code != 0 {
            metrics::counter!(m::SUBTONE_NONZERO_EXIT_TOTAL).increment(1);
        }

        logger.info(format!("subtone for {plugin} exited with code {exit_code}"))?;
        debug!(%plugin, exit_code, lines = lines.len(), "subtone finished");

        Ok(SubtoneOutput {
            plugin,
            exit_code,
            topic,
            lines,
        })
    }
}

/// Cuts `line` to [`MAX_RELAYED_LINE_BYTES`] on a char boundary.
fn relay_text(line: &str) -> String {
    if line.len() <= MAX_RELAYED_LINE_BYTES {
        return line.to_owned();
    }
    let mut end = MAX_RELAYED_LINE_BYTES;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!(
        "{} [truncated {} bytes]",
        &line[..end],
        line.len() - end
    )
}

async fn forward_lines<R>(stream: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "subtone output stream ended with error");
                break;
            }
        }
    }
}
