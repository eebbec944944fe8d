//! Suite Runner.
//!
//! Drives a [`Suite`] against a live broker:
//!
//! ```text
//! ensure broker ─► start sinks ─► for each step:
//!                                   T0 = now, reset step clock
//!                                   spawn step fn under its ceiling
//!                                   record StepResult
//!                                   halt? ─► remaining steps NotRun
//!                 flush ─► finish sinks ─► write report ─► close broker (once)
//! ```

use std::any::Any;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use tonetest_broker::{BrokerHandle, BrokerManager};
use tonetest_core::config::FailurePolicy;
use tonetest_core::error::{StepError, TonetestError};
use tonetest_core::message::now_nanos;
use tonetest_core::metrics as m;
use tonetest_core::topic;

use crate::context::{ContextParts, StepContext};
use crate::logger::TopicLogger;
use crate::report;
use crate::sink::LogSink;
use crate::step::Step;
use crate::subtone::SubtoneBridge;
use crate::suite::Suite;

/// Flush limit used before draining log sinks.
const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

// ─── Results ────────────────────────────────────────────────────────

/// Outcome of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Passed,
    Failed,
    NotRun,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::NotRun => write!(f, "not-run"),
        }
    }
}

/// One step's recorded outcome.
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    /// Report text returned by a passing step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    /// Error detail of a failing step.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(rename = "duration_ms", serialize_with = "as_millis")]
    pub duration: Duration,
}

impl StepResult {
    fn passed(name: &str, report: String, duration: Duration) -> Self {
        Self {
            name: name.to_owned(),
            status: StepStatus::Passed,
            report: Some(report),
            error: None,
            duration,
        }
    }

    fn failed(name: &str, error: &StepError, duration: Duration) -> Self {
        Self {
            name: name.to_owned(),
            status: StepStatus::Failed,
            report: None,
            error: Some(error.to_string()),
            duration,
        }
    }

    fn not_run(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            status: StepStatus::NotRun,
            report: None,
            error: None,
            duration: Duration::ZERO,
        }
    }
}

/// Aggregated outcome of a suite run.
#[derive(Debug, Clone, Serialize)]
pub struct SuiteSummary {
    pub run_id: String,
    pub version: String,
    pub results: Vec<StepResult>,
    #[serde(rename = "total_duration_ms", serialize_with = "as_millis")]
    pub total_duration: Duration,
}

impl SuiteSummary {
    pub fn passed(&self) -> usize {
        self.count(StepStatus::Passed)
    }

    pub fn failed(&self) -> usize {
        self.count(StepStatus::Failed)
    }

    pub fn not_run(&self) -> usize {
        self.count(StepStatus::NotRun)
    }

    /// No step failed.
    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    /// Process exit code: `0` on success, `1` if any step failed.
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    pub fn result(&self, name: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.name == name)
    }

    fn count(&self, status: StepStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ─── Runner ─────────────────────────────────────────────────────────

/// Connects the broker described by the suite's configuration, runs the
/// suite and closes the broker.
pub async fn run_suite(suite: Suite) -> Result<SuiteSummary, TonetestError> {
    let config = suite.config();
    let handle = BrokerManager::from_config(config)
        .ensure(&config.broker_url, config.broker.connect_timeout())
        .await?;
    SuiteRunner::new(suite, handle).run().await
}

/// Runs a suite over a broker handle it owns.
pub struct SuiteRunner {
    suite: Suite,
    broker: BrokerHandle,
    suite_topic: String,
    subtones: SubtoneBridge,
}

impl SuiteRunner {
    pub fn new(suite: Suite, broker: BrokerHandle) -> Self {
        let suite_topic = suite.config().suite_topic();
        let subtones = SubtoneBridge::new(broker.connection().clone(), suite_topic.clone());
        Self {
            suite,
            broker,
            suite_topic,
            subtones,
        }
    }

    pub fn suite_topic(&self) -> &str {
        &self.suite_topic
    }

    /// Runs every step, writes artifacts and closes the broker.
    ///
    /// Step failures are recorded in the summary. Only setup and artifact
    /// failures are returned as errors; the broker is closed either way.
    pub async fn run(self) -> Result<SuiteSummary, TonetestError> {
        let result = self.run_inner().await;
        self.broker.close().await;
        result
    }

    async fn run_inner(&self) -> Result<SuiteSummary, TonetestError> {
        let config = self.suite.config();
        let connection = self.broker.connection();

        let log_sink = match config.log_path.as_deref() {
            Some(path) => {
                let pattern = topic::all_below(&self.suite_topic);
                Some(LogSink::start(connection, &pattern, path).await?)
            }
            None => None,
        };
        let error_sink = match config.error_log_path.as_deref() {
            Some(path) => {
                let error_topic = topic::error_topic(&self.suite_topic);
                Some(LogSink::start(connection, &error_topic, path).await?)
            }
            None => None,
        };

        info!(
            version = %config.version,
            steps = self.suite.registry().len(),
            policy = %config.failure_policy,
            broker = %self.broker.url(),
            "suite started"
        );

        let summary = self.run_steps().await;

        if let Err(e) = connection.flush(FINAL_FLUSH_TIMEOUT).await {
            warn!(error = %e, "final broker flush failed; log files may be incomplete");
        }
        for sink in [log_sink, error_sink].into_iter().flatten() {
            sink.finish().await?;
        }
        if let Some(path) = config.report_path.as_deref() {
            report::write_report(&summary, Path::new(path)).await?;
            info!(path, "report written");
        }

        info!(
            passed = summary.passed(),
            failed = summary.failed(),
            not_run = summary.not_run(),
            duration_ms = summary.total_duration.as_millis() as u64,
            "suite finished"
        );
        Ok(summary)
    }

    /// Runs the steps in registration order.
    async fn run_steps(&self) -> SuiteSummary {
        let config = self.suite.config();
        let started = Instant::now();
        let mut results = Vec::with_capacity(self.suite.registry().len());
        let mut halted = false;

        for step in self.suite.registry().iter() {
            if halted {
                info!(step = step.name(), "step not run");
                results.push(StepResult::not_run(step.name()));
                continue;
            }

            let result = self.run_step(step).await;
            if result.status == StepStatus::Failed
                && config.failure_policy == FailurePolicy::Halt
            {
                warn!(step = step.name(), "halting suite after failed step");
                halted = true;
            }
            results.push(result);
        }

        SuiteSummary {
            run_id: uuid::Uuid::new_v4().to_string(),
            version: config.version.clone(),
            results,
            total_duration: started.elapsed(),
        }
    }

    async fn run_step(&self, step: &Step) -> StepResult {
        let config = self.suite.config();
        let connection = self.broker.connection().clone();
        let step_topic = topic::step_topic(&self.suite_topic, step.name());
        let ceiling = step.timeout().unwrap_or_else(|| config.default_step_timeout());

        let started_at = now_nanos();
        let step_logger = TopicLogger::new(connection.clone(), step_topic, step.name());
        step_logger.reset_clock();
        let error_logger = TopicLogger::new(
            connection.clone(),
            topic::error_topic(&self.suite_topic),
            step.name(),
        );

        let ctx = StepContext::new(ContextParts {
            step_name: step.name().to_owned(),
            suite_topic: self.suite_topic.clone(),
            broker_url: self.broker.url().to_owned(),
            started_at,
            connection,
            step_logger: step_logger.clone(),
            subtones: self.subtones.clone(),
        });

        if let Err(e) = step_logger.info("step started") {
            warn!(step = step.name(), error = %e, "failed to publish step start");
        }
        debug!(step = step.name(), ?ceiling, "step started");

        let clock = Instant::now();
        let outcome = run_with_ceiling(step, ctx, ceiling).await;
        let duration = clock.elapsed();
        metrics::histogram!(m::STEP_DURATION_SECONDS).record(duration.as_secs_f64());

        match outcome {
            Ok(report) => {
                let _ = step_logger.info(format!("report: {report}"));
                metrics::counter!(m::STEP_RESULTS_TOTAL, m::LABEL_STATUS => "passed").increment(1);
                info!(step = step.name(), duration_ms = duration.as_millis() as u64, "PASS");
                StepResult::passed(step.name(), report, duration)
            }
            Err(e) => {
                let text = format!("step failed: {e}");
                let _ = step_logger.error(text.clone());
                let _ = error_logger.error(text);
                metrics::counter!(m::STEP_RESULTS_TOTAL, m::LABEL_STATUS => "failed").increment(1);
                error!(step = step.name(), duration_ms = duration.as_millis() as u64, error = %e, "FAIL");
                StepResult::failed(step.name(), &e, duration)
            }
        }
    }
}

/// Runs the step function on its own task, bounded by `ceiling`.
///
/// On breach the task is aborted, which drops any subtone it was running.
async fn run_with_ceiling(
    step: &Step,
    ctx: StepContext,
    ceiling: Duration,
) -> Result<String, StepError> {
    let mut handle = tokio::spawn(step.invoke(ctx));

    match tokio::time::timeout(ceiling, &mut handle).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) => Err(StepError::Panicked {
            step: step.name().to_owned(),
            reason: join_error_reason(join_error),
        }),
        Err(_) => {
            handle.abort();
            let _ = handle.await;
            Err(StepError::StepTimeout {
                step: step.name().to_owned(),
                timeout: ceiling,
            })
        }
    }
}

fn join_error_reason(err: tokio::task::JoinError) -> String {
    if err.is_panic() {
        panic_message(err.into_panic())
    } else {
        err.to_string()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
