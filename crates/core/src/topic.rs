//! Topic naming and matching.
//!
//! Topics are dot-separated tokens (`logs.test.src-v1.boot`). Subscription
//! patterns may use `*` for exactly one token and a trailing `>` for one or
//! more remaining tokens.

/// Prefix for topics derived from a suite version.
pub const SUITE_TOPIC_PREFIX: &str = "logs.test";

/// Suffix of the suite-wide error topic.
pub const ERROR_TOPIC_SUFFIX: &str = "error";

/// Token placed between the suite topic and a plugin name for subtone output.
pub const SUBTONE_TOPIC_TOKEN: &str = "subtone";

/// Normalises free text into a single topic token.
///
/// Lower-cases, maps separators to `-`, drops quotes and parentheses,
/// collapses repeated dashes and trims them from both ends. An input that
/// normalises to nothing becomes `"default"`.
pub fn sanitize_token(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().to_lowercase().chars() {
        match ch {
            ' ' | '/' | '\\' | '|' | ':' | '.' | '_' | '\t' => out.push('-'),
            '(' | ')' | '\'' | '"' | '*' | '>' => {}
            other => out.push(other),
        }
    }

    let mut collapsed = String::with_capacity(out.len());
    for ch in out.chars() {
        if ch == '-' && collapsed.ends_with('-') {
            continue;
        }
        collapsed.push(ch);
    }

    let trimmed = collapsed.trim_matches('-');
    if trimmed.is_empty() {
        "default".to_owned()
    } else {
        trimmed.to_owned()
    }
}

/// Suite topic: the configured default topic, or `logs.test.<version>`.
pub fn suite_topic(version: &str, default_topic: Option<&str>) -> String {
    match default_topic.map(str::trim) {
        Some(topic) if !topic.is_empty() => topic.to_owned(),
        _ => format!("{SUITE_TOPIC_PREFIX}.{}", sanitize_token(version)),
    }
}

/// Canonical topic for one step of a suite.
pub fn step_topic(suite_topic: &str, step_name: &str) -> String {
    format!("{suite_topic}.{}", sanitize_token(step_name))
}

/// Suite-wide error topic.
pub fn error_topic(suite_topic: &str) -> String {
    format!("{suite_topic}.{ERROR_TOPIC_SUFFIX}")
}

/// Topic carrying the relayed output of subtones for `plugin`.
pub fn subtone_topic(prefix: &str, plugin: &str) -> String {
    format!("{prefix}.{SUBTONE_TOPIC_TOKEN}.{}", sanitize_token(plugin))
}

/// Wildcard pattern covering every topic below `prefix`.
pub fn all_below(prefix: &str) -> String {
    format!("{prefix}.>")
}

/// Returns `true` if `topic` is a well-formed concrete topic (no wildcards).
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.split('.').all(|token| {
            !token.is_empty()
                && token != "*"
                && token != ">"
                && !token.chars().any(char::is_whitespace)
        })
}

/// Returns `true` if `pattern` is a well-formed subscription pattern.
pub fn is_valid_pattern(pattern: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    let last = tokens.len() - 1;
    tokens.iter().enumerate().all(|(i, token)| {
        !token.is_empty()
            && !token.chars().any(char::is_whitespace)
            && (*token != ">" || i == last)
    })
}

/// Matches a concrete topic against a subscription pattern.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut topic_tokens = topic.split('.');

    loop {
        match (pattern_tokens.next(), topic_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(t)) if p == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
