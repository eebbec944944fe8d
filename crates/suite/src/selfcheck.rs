//! Built-in self-check suite.
//!
//! Exercises the framework end to end against whatever broker the
//! configuration points at: step logging and waits, side-channel topics,
//! unordered multi-pattern waits, error mirroring, subtone relay and
//! isolation from an earlier step's traffic.

use std::time::Duration;

use tonetest_core::config::SuiteConfig;
use tonetest_core::error::{RegistryError, StepError};

use crate::step::Step;
use crate::subtone::SubtoneInvocation;
use crate::suite::Suite;

const WAIT: Duration = Duration::from_secs(3);
const PING: &str = "selfcheck-ping";

/// Builds the self-check suite on top of `config`.
pub fn selfcheck_suite(config: SuiteConfig) -> Result<Suite, RegistryError> {
    Suite::new(config)
        .step(Step::new("step-logging", |ctx| async move {
            ctx.wait_for_step_message_after_action(PING, WAIT, async {
                ctx.info(PING)?;
                Ok(())
            })
            .await?;
            ctx.wait_for_step_message_after_action("|WARN|step-logging]", WAIT, async {
                ctx.warn("warnings render with their category")?;
                Ok(())
            })
            .await?;
            Ok(format!("observed '{PING}' on {}", ctx.step_topic()))
        }))?
        .step(Step::new("topic-logger", |ctx| async move {
            let side = format!("{}.side-channel", ctx.suite_topic());
            let logger = ctx.new_topic_logger(side.clone());
            ctx.wait_for_message_after_action(&side, "side-channel-ok", WAIT, async {
                logger.info("side-channel-ok")?;
                Ok(())
            })
            .await?;
            Ok(format!("side channel {side} populated"))
        }))?
        .step(Step::new("multi-pattern", |ctx| async move {
            let topic = ctx.step_topic().to_owned();
            ctx.wait_for_all_messages_after_action(&topic, &["multi-a", "multi-b"], WAIT, async {
                ctx.info("multi-b")?;
                ctx.info("multi-a")?;
                Ok(())
            })
            .await?;
            Ok("both patterns matched out of order".to_owned())
        }))?
        .step(Step::new("error-mirror", |ctx| async move {
            let error_topic = ctx.error_topic().to_owned();
            ctx.wait_for_error_message_after_action(&error_topic, "selfcheck-error", WAIT, async {
                ctx.error("selfcheck-error (expected)")?;
                Ok(())
            })
            .await?;
            Ok(format!("error mirrored to {error_topic}"))
        }))?
        .step(Step::new("subtone-relay", |ctx| async move {
            let topic = ctx.subtone_topic("selfcheck");
            let mut output = None;
            ctx.wait_for_all_messages_after_action(
                &topic,
                &["spawning subtone", "] MARKER", "exited with code 0"],
                WAIT,
                async {
                    output = Some(ctx.spawn_subtone(echo_marker()).await?);
                    Ok(())
                },
            )
            .await?;
            let output = output
                .ok_or_else(|| StepError::failed("subtone produced no output"))?
                .expect_success()?;
            Ok(format!(
                "relayed {} line(s) to {}",
                output.lines.len(),
                output.topic
            ))
        }))?
        .step(Step::new("stale-isolation", |ctx| async move {
            let earlier = format!("{}.step-logging", ctx.suite_topic());
            match ctx
                .wait_for_message(&earlier, PING, Duration::from_millis(200))
                .await
            {
                Err(e) if e.is_wait_timeout() => {
                    Ok("earlier step's messages were ignored".to_owned())
                }
                Err(e) => Err(e),
                Ok(()) => Err(StepError::failed(
                    "a message from an earlier step satisfied this step's wait",
                )),
            }
        }))
}

#[cfg(unix)]
fn echo_marker() -> SubtoneInvocation {
    SubtoneInvocation::new("selfcheck", "sh").args(["-c", "echo MARKER"])
}

#[cfg(windows)]
fn echo_marker() -> SubtoneInvocation {
    SubtoneInvocation::new("selfcheck", "cmd").args(["/C", "echo MARKER"])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonetest_core::config::FailurePolicy;

    #[test]
    fn selfcheck_registers_steps_in_order() {
        let suite =
            selfcheck_suite(SuiteConfig::new("selfcheck", FailurePolicy::Continue)).expect("build");
        assert_eq!(
            suite.registry().names(),
            [
                "step-logging",
                "topic-logger",
                "multi-pattern",
                "error-mirror",
                "subtone-relay",
                "stale-isolation",
            ]
        );
    }
}
