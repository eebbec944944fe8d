//! Metric names and descriptions.
//!
//! Every crate emits through the `metrics` facade using these constants.
//! Nothing here installs a recorder; without one the macros are no-ops.
//!
//! # Naming
//!
//! - prefix: `tonetest_`
//! - area: `broker_`, `wait_`, `step_`, `subtone_`
//! - suffix: `_total` (counter), `_seconds` (histogram)
//!
//! ```ignore
//! metrics::counter!(tonetest_core::metrics::BROKER_MESSAGES_PUBLISHED_TOTAL).increment(1);
//! ```

// ─── Label keys ─────────────────────────────────────────────────────

/// Step outcome label (passed, failed, not_run).
pub const LABEL_STATUS: &str = "status";

/// Message category label (info, warn, error).
pub const LABEL_CATEGORY: &str = "category";

// ─── Broker ─────────────────────────────────────────────────────────

/// Messages published by client connections (counter, label: category).
pub const BROKER_MESSAGES_PUBLISHED_TOTAL: &str = "tonetest_broker_messages_published_total";

/// Messages delivered into subscription buffers (counter).
pub const BROKER_MESSAGES_DELIVERED_TOTAL: &str = "tonetest_broker_messages_delivered_total";

/// Messages evicted from full subscription buffers (counter).
pub const BROKER_MESSAGES_DROPPED_TOTAL: &str = "tonetest_broker_messages_dropped_total";

/// Embedded brokers started (counter).
pub const BROKER_EMBEDDED_STARTS_TOTAL: &str = "tonetest_broker_embedded_starts_total";

// ─── Waits ──────────────────────────────────────────────────────────

/// Wait calls that matched (counter).
pub const WAIT_MATCHED_TOTAL: &str = "tonetest_wait_matched_total";

/// Wait calls that timed out (counter).
pub const WAIT_TIMEOUTS_TOTAL: &str = "tonetest_wait_timeouts_total";

// ─── Steps ──────────────────────────────────────────────────────────

/// Finished steps (counter, label: status).
pub const STEP_RESULTS_TOTAL: &str = "tonetest_step_results_total";

/// Step wall time (histogram, seconds).
pub const STEP_DURATION_SECONDS: &str = "tonetest_step_duration_seconds";

// ─── Subtones ───────────────────────────────────────────────────────

/// Subtones spawned (counter).
pub const SUBTONE_SPAWNED_TOTAL: &str = "tonetest_subtone_spawned_total";

/// Subtones that exited nonzero (counter).
pub const SUBTONE_NONZERO_EXIT_TOTAL: &str = "tonetest_subtone_nonzero_exit_total";

/// Registers descriptions for every metric with the installed recorder.
///
/// Call once after installing a recorder.
pub fn describe_all() {
    use metrics::{describe_counter, describe_histogram};

    describe_counter!(
        BROKER_MESSAGES_PUBLISHED_TOTAL,
        "Messages published through broker client connections"
    );
    describe_counter!(
        BROKER_MESSAGES_DELIVERED_TOTAL,
        "Messages delivered into subscription buffers"
    );
    describe_counter!(
        BROKER_MESSAGES_DROPPED_TOTAL,
        "Messages evicted from full subscription buffers"
    );
    describe_counter!(
        BROKER_EMBEDDED_STARTS_TOTAL,
        "Embedded brokers started by the lifecycle manager"
    );
    describe_counter!(WAIT_MATCHED_TOTAL, "Wait calls that found their messages");
    describe_counter!(WAIT_TIMEOUTS_TOTAL, "Wait calls that hit their deadline");
    describe_counter!(STEP_RESULTS_TOTAL, "Finished steps by status");
    describe_histogram!(STEP_DURATION_SECONDS, "Step wall time in seconds");
    describe_counter!(SUBTONE_SPAWNED_TOTAL, "Subtone child processes spawned");
    describe_counter!(
        SUBTONE_NONZERO_EXIT_TOTAL,
        "Subtone child processes that exited nonzero"
    );
}
