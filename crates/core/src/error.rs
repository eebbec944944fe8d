//! Error taxonomy shared by every tonetest crate.
//!
//! Setup failures ([`BrokerError::Unavailable`], [`RegistryError::DuplicateStepName`])
//! abort a run before the first step. Everything under [`StepError`] is contained to
//! the step that produced it and only ends the run through the configured
//! [`FailurePolicy`](crate::config::FailurePolicy).

use std::time::Duration;

/// Top-level tonetest error.
#[derive(Debug, thiserror::Error)]
pub enum TonetestError {
    /// Configuration loading or validation failed.
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Broker connection or lifecycle failure.
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),

    /// Step registration failure.
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// A step failed.
    #[error("step error: {0}")]
    Step(#[from] StepError),

    /// I/O error (report or log artifacts).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file does not exist.
    #[error("config file not found: {path}")]
    FileNotFound { path: String },

    /// TOML could not be parsed.
    #[error("failed to parse config: {reason}")]
    ParseFailed { reason: String },

    /// A field holds an unusable value.
    #[error("invalid config value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Broker connection and lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Neither an external broker nor an embedded one could be reached.
    #[error("broker unavailable at {url}: {reason}")]
    Unavailable { url: String, reason: String },

    /// Socket level failure (connect, bind, read, write).
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed frame or unexpected reply.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The connection has been closed.
    #[error("connection closed")]
    Closed,

    /// The broker did not answer a flush in time.
    #[error("flush timed out after {0:?}")]
    FlushTimeout(Duration),
}

/// Step registration errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// A step with this name is already registered.
    #[error("duplicate step name: {name}")]
    DuplicateStepName { name: String },

    /// A differently spelled name maps to the same step topic token.
    #[error("step name '{name}' shares topic token '{token}' with step '{existing}'")]
    StepTopicCollision {
        name: String,
        existing: String,
        token: String,
    },
}

/// Errors produced while a step runs.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// A wait call saw no qualifying message before its deadline.
    #[error("timeout after {timeout:?} waiting for {missing:?} on {topic}")]
    WaitTimeout {
        topic: String,
        missing: Vec<String>,
        timeout: Duration,
    },

    /// The step's overall ceiling elapsed.
    #[error("step '{step}' timed out after {timeout:?}")]
    StepTimeout { step: String, timeout: Duration },

    /// A subtone exited nonzero when success was expected.
    #[error("subtone for {plugin} exited with code {code}{}", render_output(.output))]
    SubtoneFailure {
        plugin: String,
        code: i32,
        output: Vec<String>,
    },

    /// A subtone could not be started at all.
    #[error("subtone for {plugin} failed to start: {reason}")]
    SubtoneSpawn { plugin: String, reason: String },

    /// The step function panicked.
    #[error("step '{step}' panicked: {reason}")]
    Panicked { step: String, reason: String },

    /// Broker failure inside a step.
    #[error(transparent)]
    Broker(#[from] BrokerError),

    /// I/O failure inside a step.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Free-form failure raised by step logic.
    #[error("{0}")]
    Failed(String),
}

impl StepError {
    /// Shorthand for [`StepError::Failed`].
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self::Failed(reason.to_string())
    }

    /// Whether this error is a missed wait.
    pub fn is_wait_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }
}

fn render_output(output: &[String]) -> String {
    if output.is_empty() {
        String::new()
    } else {
        format!("; output:\n{}", output.join("\n"))
    }
}
