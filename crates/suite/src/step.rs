//! Step definition.
//!
//! A [`Step`] is plain data: a name, an optional ceiling and a function that
//! receives everything it needs through its [`StepContext`] argument.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tonetest_core::error::StepError;

use crate::context::StepContext;

/// Boxed future returned by step functions.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// What a step function returns: report text on success.
pub type StepOutcome = Result<String, StepError>;

/// Type-erased step function.
pub type StepFn = Arc<dyn Fn(StepContext) -> BoxFuture<'static, StepOutcome> + Send + Sync>;

/// One named, independently timed unit of verification.
#[derive(Clone)]
pub struct Step {
    name: String,
    timeout: Option<Duration>,
    run: StepFn,
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Step")
            .field("name", &self.name)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Step {
    /// Creates a step from an async function.
    ///
    /// ```ignore
    /// Step::new("boot", |ctx| async move {
    ///     ctx.wait_for_step_message_after_action("ready", Duration::from_secs(2), async {
    ///         ctx.info("ready")?;
    ///         Ok(())
    ///     })
    ///     .await?;
    ///     Ok("boot ok".to_owned())
    /// })
    /// ```
    pub fn new<F, Fut>(name: impl Into<String>, run: F) -> Self
    where
        F: Fn(StepContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = StepOutcome> + Send + 'static,
    {
        Self {
            name: name.into(),
            timeout: None,
            run: Arc::new(move |ctx| Box::pin(run(ctx))),
        }
    }

    /// Sets this step's ceiling. Without one the suite default applies.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Starts the step function.
    pub(crate) fn invoke(&self, ctx: StepContext) -> BoxFuture<'static, StepOutcome> {
        (self.run)(ctx)
    }
}
