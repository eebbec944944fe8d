//! Step-based test orchestration over the tonetest event broker.
//!
//! A [`Suite`] is an ordered [`Registry`] of [`Step`]s plus a
//! [`SuiteConfig`](tonetest_core::SuiteConfig). The [`SuiteRunner`] executes
//! the steps one at a time, each with its own [`StepContext`] whose wait
//! operations only see messages published after that step started.
//!
//! ```ignore
//! let suite = Suite::new(SuiteConfig::new("v1", FailurePolicy::Halt))
//!     .step(Step::new("boot", |ctx| async move {
//!         ctx.wait_for_step_message_after_action("ready", Duration::from_secs(2), async {
//!             ctx.info("ready")?;
//!             Ok(())
//!         })
//!         .await?;
//!         Ok("boot ok".to_owned())
//!     }))?;
//! let summary = run_suite(suite).await?;
//! std::process::exit(summary.exit_code());
//! ```

pub mod context;
pub mod logger;
pub mod registry;
pub mod report;
pub mod runner;
pub mod selfcheck;
pub mod sink;
pub mod step;
pub mod subtone;
pub mod suite;

pub use context::{ContextParts, StepContext};
pub use logger::TopicLogger;
pub use registry::Registry;
pub use runner::{StepResult, StepStatus, SuiteRunner, SuiteSummary, run_suite};
pub use selfcheck::selfcheck_suite;
pub use step::{BoxFuture, Step, StepFn, StepOutcome};
pub use subtone::{SubtoneBridge, SubtoneInvocation, SubtoneOutput};
pub use suite::Suite;
