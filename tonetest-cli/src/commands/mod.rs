//! Command handlers -- one module per subcommand

pub mod broker;
pub mod config;
pub mod publish;
pub mod selfcheck;
pub mod tail;

use std::path::{Path, PathBuf};

use tonetest_broker::{BrokerHandle, BrokerManager};
use tonetest_core::config::{FailurePolicy, SuiteConfig};

use crate::error::CliError;

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "tonetest.toml";

/// Version tag used when no configuration file exists.
pub const DEFAULT_VERSION: &str = "local";

/// Where the effective configuration comes from.
#[derive(Debug, Clone)]
pub enum ConfigSource {
    File(PathBuf),
    Defaults,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Defaults => write!(f, "(defaults + environment)"),
        }
    }
}

/// Picks the configuration source.
///
/// An explicit path must exist. Without one, `tonetest.toml` is used if
/// present, otherwise built-in defaults.
pub fn config_source(explicit: Option<&Path>) -> ConfigSource {
    match explicit {
        Some(path) => ConfigSource::File(path.to_path_buf()),
        None => {
            let default = PathBuf::from(DEFAULT_CONFIG_PATH);
            if default.is_file() {
                ConfigSource::File(default)
            } else {
                ConfigSource::Defaults
            }
        }
    }
}

/// Loads and validates the effective configuration.
pub async fn load_config(source: &ConfigSource) -> Result<SuiteConfig, CliError> {
    let config = match source {
        ConfigSource::File(path) => SuiteConfig::load(path).await?,
        ConfigSource::Defaults => {
            let mut config = SuiteConfig::new(DEFAULT_VERSION, FailurePolicy::Halt);
            config.apply_env_overrides();
            config.validate()?;
            config
        }
    };
    Ok(config)
}

/// Connects to the configured broker without starting one.
pub async fn connect_existing(config: &SuiteConfig) -> Result<BrokerHandle, CliError> {
    let handle = BrokerManager::from_config(config)
        .auto_start(false)
        .ensure(&config.broker_url, config.broker.connect_timeout())
        .await?;
    Ok(handle)
}
