//! The message shape carried by the broker.
//!
//! A [`Message`] is what publishers emit and subscribers buffer. Ordering is
//! per topic; the broker never reorders messages of one publisher on one topic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Message severity category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Info,
    Warn,
    Error,
}

impl Category {
    /// Upper-case label used in rendered log lines.
    pub fn label(self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warn => write!(f, "warn"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown category '{other}'")),
        }
    }
}

/// One published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Concrete topic the message was published on.
    pub topic: String,
    /// Severity category.
    pub category: Category,
    /// Message body.
    pub text: String,
    /// Publish time, Unix nanoseconds.
    pub timestamp: i64,
    /// Publisher label (step name, plugin, `cli`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    /// Seconds since the publishing logger's clock epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_s: Option<u64>,
}

impl Message {
    /// Creates a message stamped with the current time.
    pub fn new(topic: impl Into<String>, category: Category, text: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            category,
            text: text.into(),
            timestamp: now_nanos(),
            source: None,
            elapsed_s: None,
        }
    }

    /// Shorthand for an `info` message.
    pub fn info(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(topic, Category::Info, text)
    }

    /// Shorthand for an `error` message.
    pub fn error(topic: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(topic, Category::Error, text)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_elapsed(mut self, elapsed_s: u64) -> Self {
        self.elapsed_s = Some(elapsed_s);
        self
    }

    /// Overrides the timestamp. Mostly useful in tests.
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Renders the plain log line: `[T+0003s|INFO|source] text`.
    pub fn render(&self) -> String {
        let source = match self.source.as_deref().map(str::trim) {
            Some(s) if !s.is_empty() => s,
            _ => "unknown",
        };
        format!(
            "[T+{:04}s|{}|{}] {}",
            self.elapsed_s.unwrap_or(0),
            self.category.label(),
            source,
            self.text.trim()
        )
    }

    /// Whether the rendered line contains `pattern`.
    pub fn contains(&self, pattern: &str) -> bool {
        self.render().contains(pattern)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> i64 {
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
