//! CLI-specific error types and exit code mapping

use tonetest_core::error::{BrokerError, TonetestError};

/// CLI-specific error type.
///
/// `exit_code()` maps each variant to the process exit status.
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Configuration loading or validation failure.
    #[error("configuration error: {0}")]
    Config(String),

    /// A subcommand failed, including a suite with failed steps.
    #[error("{0}")]
    Command(String),

    /// No broker answered and none could be started.
    #[error("broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// A suite could not get as far as its first step.
    #[error("suite setup failed: {0}")]
    SuiteSetup(String),

    /// JSON serialisation failed during output rendering.
    #[error("json output error: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    /// IO error (file read, stdout write, etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Map the error to a process exit code.
    ///
    /// | Code | Meaning                             |
    /// |------|-------------------------------------|
    /// | 0    | Success                             |
    /// | 1    | Step, suite setup or command failure |
    /// | 2    | Configuration error                 |
    /// | 3    | Broker unavailable                  |
    /// | 10   | IO error                            |
    ///
    /// A suite run never exits 2, 3 or 10; see [`CliError::into_suite_failure`].
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config(_) => 2,
            Self::BrokerUnavailable(_) => 3,
            Self::Io(_) => 10,
            Self::JsonSerialize(_) | Self::Command(_) | Self::SuiteSetup(_) => 1,
        }
    }

    /// Folds a failure on a suite-running path into the suite's exit
    /// contract: step failures stay as they are, everything else is a setup
    /// failure (exit 1).
    pub fn into_suite_failure(self) -> Self {
        match self {
            Self::Command(_) | Self::SuiteSetup(_) => self,
            other => Self::SuiteSetup(other.to_string()),
        }
    }
}

impl From<TonetestError> for CliError {
    fn from(e: TonetestError) -> Self {
        match e {
            TonetestError::Config(e) => Self::Config(e.to_string()),
            TonetestError::Broker(e) => e.into(),
            TonetestError::Io(e) => Self::Io(e),
            other => Self::Command(other.to_string()),
        }
    }
}

impl From<BrokerError> for CliError {
    fn from(e: BrokerError) -> Self {
        match e {
            BrokerError::Unavailable { .. } => Self::BrokerUnavailable(e.to_string()),
            other => Self::Command(other.to_string()),
        }
    }
}
