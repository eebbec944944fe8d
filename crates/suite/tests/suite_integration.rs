//! Suite runs against a real loopback broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tonetest_broker::{BrokerHandle, BrokerManager, EmbeddedBroker};
use tonetest_core::config::{BrokerSettings, FailurePolicy, SuiteConfig};
use tonetest_core::error::{BrokerError, StepError, TonetestError};
use tonetest_suite::{
    Step, StepStatus, Suite, SuiteRunner, SuiteSummary, SubtoneInvocation, run_suite,
    selfcheck_suite,
};

// ─── Helpers ────────────────────────────────────────────────────────

fn config(policy: FailurePolicy) -> SuiteConfig {
    let mut config = SuiteConfig::new("it", policy);
    config.broker = BrokerSettings {
        connect_timeout_ms: 1000,
        start_attempts: 5,
        start_backoff_ms: 20,
        subscription_buffer: 1024,
    };
    config.default_step_timeout_secs = 10;
    config
}

async fn broker() -> (EmbeddedBroker, BrokerHandle) {
    let broker = EmbeddedBroker::bind("127.0.0.1:0").await.expect("bind");
    let handle = BrokerManager::new(BrokerSettings::default())
        .auto_start(false)
        .ensure(&broker.url(), Duration::from_secs(1))
        .await
        .expect("ensure");
    (broker, handle)
}

async fn run(suite: Suite) -> SuiteSummary {
    let (broker, handle) = broker().await;
    let summary = SuiteRunner::new(suite, handle).run().await.expect("run");
    broker.shutdown().await;
    summary
}

fn status(summary: &SuiteSummary, name: &str) -> StepStatus {
    summary.result(name).map(|r| r.status).expect("step recorded")
}

fn error_of(summary: &SuiteSummary, name: &str) -> String {
    summary
        .result(name)
        .and_then(|r| r.error.clone())
        .unwrap_or_default()
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind ephemeral port");
    listener.local_addr().expect("addr").port()
}

// ─── Wait-correlator properties ─────────────────────────────────────

#[tokio::test]
async fn earlier_step_messages_never_satisfy_later_waits() {
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(Step::new("a", |ctx| async move {
            ctx.wait_for_step_message_after_action("from-a", Duration::from_secs(2), async {
                ctx.info("from-a")?;
                Ok(())
            })
            .await?;
            Ok(String::new())
        }))
        .and_then(|s| {
            s.step(Step::new("b", |ctx| async move {
                let a_topic = format!("{}.a", ctx.suite_topic());
                let stale = ctx
                    .wait_for_message(&a_topic, "from-a", Duration::from_millis(300))
                    .await;
                match stale {
                    Err(e) if e.is_wait_timeout() => {}
                    Err(e) => return Err(e),
                    Ok(()) => return Err(StepError::failed("stale message matched")),
                }

                // republished after B started, so it counts
                let logger = ctx.new_topic_logger(a_topic.clone());
                ctx.wait_for_message_after_action(&a_topic, "from-a", Duration::from_secs(2), async {
                    logger.info("from-a again")?;
                    Ok(())
                })
                .await?;
                Ok("isolated".to_owned())
            }))
        })
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(status(&summary, "a"), StepStatus::Passed);
    assert_eq!(status(&summary, "b"), StepStatus::Passed, "{}", error_of(&summary, "b"));
}

#[tokio::test]
async fn synchronous_publish_inside_action_is_observed() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("sync", |ctx| async move {
            let topic = format!("{}.fresh-topic", ctx.suite_topic());
            let logger = ctx.new_topic_logger(topic.clone());
            let started = Instant::now();
            ctx.wait_for_message_after_action(&topic, "instant", Duration::from_secs(5), async {
                logger.info("instant")?;
                Ok(())
            })
            .await?;
            if started.elapsed() > Duration::from_secs(2) {
                return Err(StepError::failed("match took too long"));
            }
            Ok(String::new())
        }))
        .expect("build");

    let summary = run(suite).await;
    assert!(summary.is_success(), "{}", error_of(&summary, "sync"));
}

#[tokio::test]
async fn wait_all_rejects_empty_pattern_list() {
    let acted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&acted);
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("empty", move |ctx| {
            let counter = Arc::clone(&counter);
            async move {
                let topic = ctx.step_topic().to_owned();
                ctx.wait_for_all_messages_after_action(&topic, &[], Duration::from_secs(1), async {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .await?;
                Ok(String::new())
            }
        }))
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(status(&summary, "empty"), StepStatus::Failed);
    assert!(error_of(&summary, "empty").contains("no patterns provided"));
    assert_eq!(acted.load(Ordering::SeqCst), 0, "action must not run");
}

#[tokio::test]
async fn wait_all_succeeds_in_either_order() {
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(Step::new("a-first", |ctx| async move {
            let topic = ctx.step_topic().to_owned();
            ctx.wait_for_all_messages_after_action(
                &topic,
                &["multi-a", "multi-b"],
                Duration::from_secs(2),
                async {
                    ctx.info("multi-a")?;
                    ctx.info("multi-b")?;
                    Ok(())
                },
            )
            .await?;
            Ok(String::new())
        }))
        .and_then(|s| {
            s.step(Step::new("b-first", |ctx| async move {
                let topic = ctx.step_topic().to_owned();
                ctx.wait_for_all_messages_after_action(
                    &topic,
                    &["multi-a", "multi-b"],
                    Duration::from_secs(2),
                    async {
                        ctx.info("multi-b")?;
                        ctx.info("multi-a")?;
                        Ok(())
                    },
                )
                .await?;
                Ok(String::new())
            }))
        })
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(summary.passed(), 2, "{:?}", summary.results);
}

#[tokio::test]
async fn wait_all_timeout_lists_only_missing_patterns() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("partial", |ctx| async move {
            let topic = ctx.step_topic().to_owned();
            ctx.wait_for_all_messages_after_action(
                &topic,
                &["multi-a", "multi-b"],
                Duration::from_millis(200),
                async {
                    ctx.info("multi-a")?;
                    Ok(())
                },
            )
            .await?;
            Ok(String::new())
        }))
        .expect("build");

    let summary = run(suite).await;
    let error = error_of(&summary, "partial");
    assert!(error.contains("multi-b"), "{error}");
    assert!(!error.contains("multi-a"), "{error}");
}

#[tokio::test]
async fn wait_timeout_fires_at_deadline() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("quiet", |ctx| async move {
            let topic = ctx.step_topic().to_owned();
            let started = Instant::now();
            let result = ctx
                .wait_for_message(&topic, "never-published", Duration::from_millis(200))
                .await;
            let elapsed = started.elapsed();

            match result {
                Err(StepError::WaitTimeout { missing, timeout, .. }) => {
                    assert_eq!(missing, ["never-published"]);
                    assert_eq!(timeout, Duration::from_millis(200));
                }
                other => return Err(StepError::failed(format!("unexpected: {other:?}"))),
            }
            if elapsed < Duration::from_millis(200) || elapsed > Duration::from_millis(1500) {
                return Err(StepError::failed(format!("elapsed {elapsed:?}")));
            }
            Ok(format!("{elapsed:?}"))
        }))
        .expect("build");

    let summary = run(suite).await;
    assert!(summary.is_success(), "{}", error_of(&summary, "quiet"));
}

#[tokio::test]
async fn error_wait_ignores_other_categories() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("errors-only", |ctx| async move {
            let topic = ctx.step_topic().to_owned();
            let result = ctx
                .wait_for_error_message_after_action(&topic, "boom", Duration::from_millis(200), async {
                    ctx.info("boom")?;
                    ctx.warn("boom")?;
                    Ok(())
                })
                .await;
            if !result.as_ref().is_err_and(StepError::is_wait_timeout) {
                return Err(StepError::failed(format!("info/warn matched: {result:?}")));
            }

            ctx.wait_for_error_message_after_action(&topic, "boom", Duration::from_secs(2), async {
                ctx.error("boom")?;
                Ok(())
            })
            .await?;
            Ok(String::new())
        }))
        .expect("build");

    let summary = run(suite).await;
    assert!(summary.is_success(), "{}", error_of(&summary, "errors-only"));
}

#[tokio::test]
async fn failing_action_is_the_step_error() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("bad-action", |ctx| async move {
            let topic = ctx.step_topic().to_owned();
            ctx.wait_for_message_after_action(&topic, "x", Duration::from_secs(2), async {
                Err(StepError::failed("action exploded"))
            })
            .await?;
            Ok(String::new())
        }))
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(error_of(&summary, "bad-action"), "action exploded");
}

// ─── Subtone bridge ─────────────────────────────────────────────────

#[cfg(unix)]
#[tokio::test]
async fn subtone_relays_output_before_exit_code() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("marker", |ctx| async move {
            let topic = ctx.subtone_topic("marker-plugin");
            let subscription = ctx.connection().subscribe(&topic).await?;

            let output = ctx
                .spawn_subtone(
                    SubtoneInvocation::new("marker-plugin", "sh").args(["-c", "echo MARKER; exit 3"]),
                )
                .await?;
            if output.exit_code != 3 || output.lines != ["MARKER"] {
                return Err(StepError::failed(format!("unexpected output: {output:?}")));
            }

            ctx.connection().flush(Duration::from_secs(2)).await?;
            let texts: Vec<String> = subscription
                .since(0)
                .await
                .messages
                .into_iter()
                .filter(|m| m.timestamp >= ctx.started_at())
                .map(|m| m.text)
                .collect();

            let spawn = texts.iter().position(|t| t.contains("spawning subtone for marker-plugin"));
            let marker = texts.iter().position(|t| t == "MARKER");
            let exit = texts.iter().position(|t| t.contains("exited with code 3"));
            match (spawn, marker, exit) {
                (Some(s), Some(m), Some(e)) if s < m && m < e && e == texts.len() - 1 => {
                    Ok(texts.join(" | "))
                }
                _ => Err(StepError::failed(format!("bad order: {texts:?}"))),
            }
        }))
        .expect("build");

    let summary = run(suite).await;
    assert!(summary.is_success(), "{}", error_of(&summary, "marker"));
}

#[cfg(unix)]
#[tokio::test]
async fn nonzero_subtone_fails_step_with_output() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("strict", |ctx| async move {
            ctx.spawn_subtone(
                SubtoneInvocation::new("strict", "sh").args(["-c", "echo partial >&2; exit 2"]),
            )
            .await?
            .expect_success()?;
            Ok(String::new())
        }))
        .expect("build");

    let summary = run(suite).await;
    let error = error_of(&summary, "strict");
    assert!(error.contains("subtone for strict exited with code 2"), "{error}");
    assert!(error.contains("partial"), "{error}");
}

#[tokio::test]
async fn missing_subtone_binary_is_spawn_error() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(Step::new("missing", |ctx| async move {
            match ctx
                .spawn_subtone(SubtoneInvocation::new("ghost", "tonetest-no-such-binary"))
                .await
            {
                Err(StepError::SubtoneSpawn { plugin, .. }) if plugin == "ghost" => {
                    Ok("spawn error surfaced".to_owned())
                }
                other => Err(StepError::failed(format!("unexpected: {other:?}"))),
            }
        }))
        .expect("build");

    let summary = run(suite).await;
    assert!(summary.is_success(), "{}", error_of(&summary, "missing"));
}

#[cfg(unix)]
#[tokio::test]
async fn step_ceiling_kills_running_subtone() {
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(
            Step::new("hang", |ctx| async move {
                ctx.spawn_subtone(SubtoneInvocation::new("hang", "sleep").arg("30"))
                    .await?;
                Ok(String::new())
            })
            .with_timeout(Duration::from_millis(300)),
        )
        .expect("build");

    let started = Instant::now();
    let summary = run(suite).await;
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(error_of(&summary, "hang").contains("timed out"));
}

// ─── Runner policies ────────────────────────────────────────────────

fn counting_step(name: &str, counter: Arc<AtomicUsize>, fail: bool) -> Step {
    Step::new(name, move |_ctx| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if fail {
                Err(StepError::failed("deliberate failure"))
            } else {
                Ok("ok".to_owned())
            }
        }
    })
}

#[tokio::test]
async fn halt_policy_skips_steps_after_failure() {
    let ran = Arc::new(AtomicUsize::new(0));
    let suite = Suite::new(config(FailurePolicy::Halt))
        .step(counting_step("one", Arc::clone(&ran), false))
        .and_then(|s| s.step(counting_step("two", Arc::clone(&ran), true)))
        .and_then(|s| s.step(counting_step("three", Arc::clone(&ran), false)))
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(ran.load(Ordering::SeqCst), 2);
    assert_eq!(status(&summary, "one"), StepStatus::Passed);
    assert_eq!(status(&summary, "two"), StepStatus::Failed);
    assert_eq!(status(&summary, "three"), StepStatus::NotRun);
    assert_eq!(summary.exit_code(), 1);
}

#[tokio::test]
async fn continue_policy_runs_every_step() {
    let ran = Arc::new(AtomicUsize::new(0));
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(counting_step("one", Arc::clone(&ran), true))
        .and_then(|s| s.step(counting_step("two", Arc::clone(&ran), false)))
        .and_then(|s| s.step(counting_step("three", Arc::clone(&ran), true)))
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(ran.load(Ordering::SeqCst), 3);
    assert_eq!(summary.passed(), 1);
    assert_eq!(summary.failed(), 2);
    assert_eq!(summary.not_run(), 0);
}

#[tokio::test]
async fn step_ceiling_overrides_inner_waits() {
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(
            Step::new("slow", |ctx| async move {
                let topic = ctx.step_topic().to_owned();
                ctx.wait_for_message(&topic, "never", Duration::from_secs(30))
                    .await?;
                Ok(String::new())
            })
            .with_timeout(Duration::from_millis(200)),
        )
        .and_then(|s| s.step(Step::new("next", |_ctx| async { Ok("ran".to_owned()) })))
        .expect("build");

    let summary = run(suite).await;
    let slow = summary.result("slow").expect("recorded");
    assert_eq!(slow.status, StepStatus::Failed);
    assert!(error_of(&summary, "slow").contains("step 'slow' timed out"));
    assert!(slow.duration < Duration::from_secs(5));
    assert_eq!(status(&summary, "next"), StepStatus::Passed);
}

#[tokio::test]
async fn panicking_step_is_contained() {
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(Step::new("panics", |_ctx| async {
            if true {
                panic!("step blew up");
            }
            Ok(String::new())
        }))
        .and_then(|s| s.step(Step::new("after", |_ctx| async { Ok(String::new()) })))
        .expect("build");

    let summary = run(suite).await;
    assert!(error_of(&summary, "panics").contains("step blew up"));
    assert_eq!(status(&summary, "after"), StepStatus::Passed);
}

// ─── Artifacts and broker ownership ─────────────────────────────────

#[tokio::test]
async fn artifacts_are_written() {
    let dir = tempfile::tempdir().expect("tempdir");
    let report = dir.path().join("report.json");
    let log = dir.path().join("test.log");
    let error_log = dir.path().join("error.log");
    tokio::fs::write(&log, "left over\n").await.expect("seed");

    let mut config = config(FailurePolicy::Continue);
    config.report_path = Some(report.display().to_string());
    config.log_path = Some(log.display().to_string());
    config.error_log_path = Some(error_log.display().to_string());

    let suite = Suite::new(config)
        .step(Step::new("good", |ctx| async move {
            ctx.info("hello from good")?;
            Ok("good report".to_owned())
        }))
        .and_then(|s| {
            s.step(Step::new("bad", |_ctx| async {
                Err(StepError::failed("bad things"))
            }))
        })
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(summary.failed(), 1);

    let json: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(&report).await.expect("report"))
            .expect("json");
    assert_eq!(json["version"], "it");
    assert_eq!(json["results"][0]["report"], "good report");
    assert_eq!(json["results"][1]["status"], "failed");

    let log = tokio::fs::read_to_string(&log).await.expect("log");
    assert!(!log.contains("left over"));
    assert!(log.contains("[T+0000s|INFO|good] step started"));
    assert!(log.contains("hello from good"));
    assert!(log.contains("report: good report"));
    assert!(log.contains("|ERROR|bad] step failed: bad things"));

    let errors = tokio::fs::read_to_string(&error_log).await.expect("error log");
    assert!(errors.contains("step failed: bad things"));
    assert!(!errors.contains("hello from good"));
}

#[tokio::test]
async fn run_suite_starts_and_stops_embedded_broker() {
    let port = free_port();
    let mut config = config(FailurePolicy::Halt);
    config.broker_url = format!("nats://127.0.0.1:{port}");

    let suite = Suite::new(config.clone())
        .step(Step::new("ping", |ctx| async move {
            ctx.wait_for_step_message_after_action("pong", Duration::from_secs(2), async {
                ctx.info("pong")?;
                Ok(())
            })
            .await?;
            Ok(ctx.broker_url().to_owned())
        }))
        .expect("build");

    let summary = run_suite(suite).await.expect("run");
    assert!(summary.is_success(), "{}", error_of(&summary, "ping"));

    // closed exactly once: nothing is listening afterwards
    let err = BrokerManager::from_config(&config)
        .auto_start(false)
        .ensure(&config.broker_url, Duration::from_millis(200))
        .await
        .expect_err("embedded broker stopped");
    assert!(err.to_string().contains("unavailable"));
}

#[tokio::test]
async fn run_suite_aborts_before_first_step_when_no_broker_can_be_had() {
    // Accepts TCP but never answers the handshake, and holds the port.
    let squatter = std::net::TcpListener::bind("127.0.0.1:0").expect("bind squatter");
    let mut config = config(FailurePolicy::Continue);
    config.broker_url = format!("nats://{}", squatter.local_addr().expect("addr"));
    config.broker.connect_timeout_ms = 300;

    let ran = Arc::new(AtomicUsize::new(0));
    let suite = Suite::new(config)
        .step(counting_step("first", Arc::clone(&ran), false))
        .expect("build");

    let err = run_suite(suite).await.expect_err("setup must fail");
    assert!(
        matches!(err, TonetestError::Broker(BrokerError::Unavailable { .. })),
        "unexpected error: {err:?}"
    );
    assert_eq!(ran.load(Ordering::SeqCst), 0, "no step may run");
    drop(squatter);
}

// ─── Oversized output ───────────────────────────────────────────────

#[tokio::test]
async fn oversized_message_fails_only_its_own_step() {
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(Step::new("big", |ctx| async move {
            ctx.info("x".repeat(2 * 1024 * 1024))?;
            Ok(String::new())
        }))
        .and_then(|s| {
            s.step(Step::new("next", |ctx| async move {
                ctx.wait_for_step_message_after_action("hello", Duration::from_secs(2), async {
                    ctx.info("hello")?;
                    Ok(())
                })
                .await?;
                Ok("still connected".to_owned())
            }))
        })
        .expect("build");

    let summary = run(suite).await;
    assert_eq!(status(&summary, "big"), StepStatus::Failed);
    assert!(error_of(&summary, "big").contains("too large"));
    assert_eq!(status(&summary, "next"), StepStatus::Passed, "{}", error_of(&summary, "next"));
}

#[cfg(unix)]
#[tokio::test]
async fn long_subtone_line_is_relayed_truncated() {
    let suite = Suite::new(config(FailurePolicy::Continue))
        .step(Step::new("long-line", |ctx| async move {
            let topic = ctx.subtone_topic("bundler");
            let output = ctx
                .spawn_subtone(SubtoneInvocation::new("bundler", "sh").args([
                    "-c",
                    "head -c 1500000 /dev/zero | tr '\\0' x; echo",
                ]))
                .await?
                .expect_success()?;
            if output.lines.first().map(String::len) != Some(1_500_000) {
                return Err(StepError::failed("captured line should keep its full length"));
            }
            ctx.wait_for_message(&topic, "[truncated", Duration::from_secs(2))
                .await?;
            Ok(String::new())
        }))
        .and_then(|s| {
            s.step(Step::new("after", |ctx| async move {
                ctx.wait_for_step_message_after_action("alive", Duration::from_secs(2), async {
                    ctx.info("alive")?;
                    Ok(())
                })
                .await?;
                Ok(String::new())
            }))
        })
        .expect("build");

    let summary = run(suite).await;
    assert!(summary.is_success(), "{:?}", summary.results);
}

#[tokio::test]
async fn selfcheck_suite_passes() {
    let suite = selfcheck_suite(config(FailurePolicy::Continue)).expect("build");
    let summary = run(suite).await;
    let failures: Vec<_> = summary
        .results
        .iter()
        .filter(|r| r.status != StepStatus::Passed)
        .collect();
    assert!(failures.is_empty(), "{failures:?}");
}
