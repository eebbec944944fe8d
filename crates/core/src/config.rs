//! Suite configuration: `tonetest.toml` parsing and runtime settings.
//!
//! [`SuiteConfig`] is the top-level structure. It corresponds to one suite
//! run: the version tag, where the broker lives, which failure policy to
//! apply, and where report/log artifacts go.
//!
//! # Loading precedence
//! 1. CLI flags (applied by the caller)
//! 2. Environment variables (`TONETEST_BROKER_URL=...`)
//! 3. Configuration file
//! 4. Field defaults
//!
//! `failure_policy` has no default: every suite states whether it halts on
//! the first failing step or runs to completion.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), tonetest_core::error::TonetestError> {
//! use tonetest_core::config::SuiteConfig;
//!
//! let config = SuiteConfig::load("tonetest.toml").await?;
//!
//! let config = SuiteConfig::parse("version = \"src_v1\"\nfailure_policy = \"halt\"")?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, TonetestError};
use crate::topic;

/// Broker URL used when none is configured.
pub const DEFAULT_BROKER_URL: &str = "nats://127.0.0.1:4222";

/// Step ceiling used when a step declares none.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 30;

/// What the runner does after a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Stop at the first failing step; the rest are recorded as not run.
    Halt,
    /// Run every step regardless of earlier failures.
    Continue,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Halt => write!(f, "halt"),
            Self::Continue => write!(f, "continue"),
        }
    }
}

impl std::str::FromStr for FailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "halt" => Ok(Self::Halt),
            "continue" => Ok(Self::Continue),
            other => Err(format!("unknown failure policy '{other}'")),
        }
    }
}

/// Top-level suite configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteConfig {
    /// Version tag of the suite (also the default topic suffix).
    pub version: String,
    /// Broker address (`nats://host:port`, `tcp://host:port` or `host:port`).
    #[serde(default = "default_broker_url")]
    pub broker_url: String,
    /// Explicit suite topic; derived from `version` when absent.
    #[serde(default)]
    pub default_topic: Option<String>,
    /// Start an embedded broker when nothing answers at `broker_url`.
    #[serde(default = "default_true")]
    pub auto_start_broker: bool,
    /// Halt on first failure or continue.
    pub failure_policy: FailurePolicy,
    /// Ceiling for steps that do not declare their own.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,
    /// Structured report output path.
    #[serde(default)]
    pub report_path: Option<String>,
    /// Combined plain-text log path.
    #[serde(default)]
    pub log_path: Option<String>,
    /// Error-only log path.
    #[serde(default)]
    pub error_log_path: Option<String>,
    /// Broker connection tuning.
    #[serde(default)]
    pub broker: BrokerSettings,
    /// Tracing output.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Broker connection tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrokerSettings {
    /// Timeout for one connect attempt (milliseconds).
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Connect attempts after an embedded broker was started.
    #[serde(default = "default_start_attempts")]
    pub start_attempts: u32,
    /// Initial backoff between those attempts (milliseconds, doubled each time).
    #[serde(default = "default_start_backoff_ms")]
    pub start_backoff_ms: u64,
    /// Messages retained per subscription.
    #[serde(default = "default_subscription_buffer")]
    pub subscription_buffer: usize,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            start_attempts: default_start_attempts(),
            start_backoff_ms: default_start_backoff_ms(),
            subscription_buffer: default_subscription_buffer(),
        }
    }
}

impl BrokerSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn start_backoff(&self) -> Duration {
        Duration::from_millis(self.start_backoff_ms)
    }
}

/// Tracing output settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (json, pretty, compact).
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl SuiteConfig {
    /// Creates a configuration with every optional field at its default.
    pub fn new(version: impl Into<String>, failure_policy: FailurePolicy) -> Self {
        Self {
            version: version.into(),
            broker_url: default_broker_url(),
            default_topic: None,
            auto_start_broker: true,
            failure_policy,
            default_step_timeout_secs: DEFAULT_STEP_TIMEOUT_SECS,
            report_path: None,
            log_path: None,
            error_log_path: None,
            broker: BrokerSettings::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Loads a TOML file, applies environment overrides and validates.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, TonetestError> {
        let mut config = Self::from_file(path).await?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file without environment overrides.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, TonetestError> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                TonetestError::Config(ConfigError::FileNotFound {
                    path: path.display().to_string(),
                })
            } else {
                TonetestError::Io(e)
            }
        })?;
        let config = Self::parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parses a TOML string.
    pub fn parse(toml_str: &str) -> Result<Self, TonetestError> {
        toml::from_str(toml_str).map_err(|e| {
            TonetestError::Config(ConfigError::ParseFailed {
                reason: e.to_string(),
            })
        })
    }

    /// Applies `TONETEST_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        override_string(&mut self.version, "TONETEST_VERSION");
        override_string(&mut self.broker_url, "TONETEST_BROKER_URL");
        override_opt_string(&mut self.default_topic, "TONETEST_DEFAULT_TOPIC");
        override_bool(&mut self.auto_start_broker, "TONETEST_AUTO_START_BROKER");
        override_policy(&mut self.failure_policy, "TONETEST_FAILURE_POLICY");
        override_u64(
            &mut self.default_step_timeout_secs,
            "TONETEST_DEFAULT_STEP_TIMEOUT_SECS",
        );
        override_opt_string(&mut self.report_path, "TONETEST_REPORT_PATH");
        override_opt_string(&mut self.log_path, "TONETEST_LOG_PATH");
        override_opt_string(&mut self.error_log_path, "TONETEST_ERROR_LOG_PATH");

        // Broker
        override_u64(
            &mut self.broker.connect_timeout_ms,
            "TONETEST_BROKER_CONNECT_TIMEOUT_MS",
        );
        override_u32(
            &mut self.broker.start_attempts,
            "TONETEST_BROKER_START_ATTEMPTS",
        );
        override_u64(
            &mut self.broker.start_backoff_ms,
            "TONETEST_BROKER_START_BACKOFF_MS",
        );
        override_usize(
            &mut self.broker.subscription_buffer,
            "TONETEST_BROKER_SUBSCRIPTION_BUFFER",
        );

        // Logging
        override_string(&mut self.logging.level, "TONETEST_LOG_LEVEL");
        override_string(&mut self.logging.format, "TONETEST_LOG_FORMAT");
    }

    /// Validates field values.
    pub fn validate(&self) -> Result<(), TonetestError> {
        if self.version.trim().is_empty() {
            return Err(invalid("version", "must not be empty"));
        }

        if broker_host_port(&self.broker_url).is_none() {
            return Err(invalid(
                "broker_url",
                "expected nats://host:port, tcp://host:port or host:port",
            ));
        }

        if let Some(topic) = self.default_topic.as_deref() {
            if !topic.trim().is_empty() && !topic::is_valid_topic(topic.trim()) {
                return Err(invalid(
                    "default_topic",
                    "must be dot-separated tokens without wildcards or whitespace",
                ));
            }
        }

        if self.default_step_timeout_secs == 0 {
            return Err(invalid("default_step_timeout_secs", "must be greater than 0"));
        }

        if self.broker.connect_timeout_ms == 0 {
            return Err(invalid("broker.connect_timeout_ms", "must be greater than 0"));
        }

        if self.broker.start_attempts == 0 {
            return Err(invalid("broker.start_attempts", "must be at least 1"));
        }

        if self.broker.subscription_buffer == 0 {
            return Err(invalid("broker.subscription_buffer", "must be at least 1"));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(invalid(
                "logging.level",
                &format!("must be one of: {}", valid_levels.join(", ")),
            ));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.logging.format.as_str()) {
            return Err(invalid(
                "logging.format",
                &format!("must be one of: {}", valid_formats.join(", ")),
            ));
        }

        Ok(())
    }

    /// Topic shared by every step of this suite.
    pub fn suite_topic(&self) -> String {
        topic::suite_topic(&self.version, self.default_topic.as_deref())
    }

    /// Ceiling applied to steps without their own timeout.
    pub fn default_step_timeout(&self) -> Duration {
        Duration::from_secs(self.default_step_timeout_secs)
    }
}

/// Splits a broker URL into `(host, port)`.
///
/// Accepts `nats://`, `tcp://` or no scheme. The port defaults to 4222 and
/// the host to `127.0.0.1`.
pub fn broker_host_port(url: &str) -> Option<(String, u16)> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let rest = match trimmed.split_once("://") {
        Some((scheme, rest)) => {
            if !matches!(scheme, "nats" | "tcp") {
                return None;
            }
            rest
        }
        None => trimmed,
    };
    let rest = rest.trim_end_matches('/');
    if rest.contains('/') {
        return None;
    }

    let (host, port) = match rest.rsplit_once(':') {
        Some((host, port)) => (host, port.parse::<u16>().ok()?),
        None => (rest, 4222),
    };
    let host = if host.is_empty() { "127.0.0.1" } else { host };
    Some((host.to_owned(), port))
}

fn invalid(field: &str, reason: &str) -> TonetestError {
    ConfigError::InvalidValue {
        field: field.to_owned(),
        reason: reason.to_owned(),
    }
    .into()
}

fn default_broker_url() -> String {
    DEFAULT_BROKER_URL.to_owned()
}

fn default_true() -> bool {
    true
}

fn default_step_timeout_secs() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_connect_timeout_ms() -> u64 {
    1200
}

fn default_start_attempts() -> u32 {
    5
}

fn default_start_backoff_ms() -> u64 {
    50
}

fn default_subscription_buffer() -> usize {
    4096
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "pretty".to_owned()
}

// --- environment override helpers ---

fn override_string(target: &mut String, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = val;
    }
}

fn override_opt_string(target: &mut Option<String>, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        *target = if val.trim().is_empty() { None } else { Some(val) };
    }
}

fn override_bool(target: &mut bool, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<bool>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse bool from env var, ignoring"
            ),
        }
    }
}

fn override_policy(target: &mut FailurePolicy, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<FailurePolicy>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse failure policy from env var, ignoring"
            ),
        }
    }
}

fn override_usize(target: &mut usize, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<usize>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse usize from env var, ignoring"
            ),
        }
    }
}

fn override_u32(target: &mut u32, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u32>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u32 from env var, ignoring"
            ),
        }
    }
}

fn override_u64(target: &mut u64, env_key: &str) {
    if let Ok(val) = std::env::var(env_key) {
        match val.parse::<u64>() {
            Ok(parsed) => *target = parsed,
            Err(_) => warn!(
                env_key,
                value = val.as_str(),
                "failed to parse u64 from env var, ignoring"
            ),
        }
    }
}
