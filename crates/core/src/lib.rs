//! Shared building blocks for the tonetest workspace.
//!
//! Every other crate depends on this one for the error taxonomy, the suite
//! configuration, the [`Message`] shape carried over the broker, and the
//! topic naming helpers.

pub mod config;
pub mod error;
pub mod message;
pub mod metrics;
pub mod topic;

// --- re-exports ---

pub use config::{BrokerSettings, FailurePolicy, LoggingConfig, SuiteConfig};
pub use error::{BrokerError, ConfigError, RegistryError, StepError, TonetestError};
pub use message::{Category, Message};
pub use topic::{sanitize_token, topic_matches};
