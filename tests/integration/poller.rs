//! Integration tests for the condition poller: timing bounds, metric lines
//! and independence of concurrent polls.

use futures::future::join_all;
use pollgate::metrics::MetricLine;
use pollgate::{check, poll, BoxError, MetricRecorder, PollContext, PollError, PollPolicy};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::Instant;

fn policy(interval_ms: u64, timeout_ms: u64) -> PollPolicy {
    PollPolicy::new(
        Duration::from_millis(interval_ms),
        Duration::from_millis(timeout_ms),
    )
    .unwrap()
}

/// Tests the counter scenario: "continue" twice, then success.
///
/// **Expected Behavior:**
/// - The poll completes after two intervals (20-40ms with a 10ms interval)
/// - Exactly one metric line is emitted and its duration falls in the same range
#[tokio::test(start_paused = true)]
async fn test_counter_condition_completes_after_two_intervals() {
    let (recorder, captured) = MetricRecorder::capture();
    let ctx = PollContext::new("counter").with_recorder(recorder);
    let calls = AtomicU32::new(0);
    let started = Instant::now();

    poll(&ctx, "counter", &policy(10, 1000), || {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        async move { Ok::<_, BoxError>(n == 3) }
    })
    .await
    .unwrap();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(20) && elapsed <= Duration::from_millis(40));

    let lines = captured.lines();
    assert_eq!(lines.len(), 1, "Expected one metric line, got {lines:?}");
    let metric = MetricLine::parse(&lines[0]).unwrap();
    assert_eq!(metric.name, "counter");
    assert!(metric.duration_ms >= 20.0 && metric.duration_ms <= 40.0);
    assert_eq!(
        metric.end_nanos - metric.start_nanos,
        (metric.duration_ms * 1_000_000.0).round() as i64
    );
}

/// Tests that a condition which never stops times out inside
/// `[timeout, timeout + interval]` and reports the number of attempts.
#[tokio::test(start_paused = true)]
async fn test_timeout_is_bounded_by_one_interval() {
    let ctx = PollContext::new("bounded");
    let started = Instant::now();

    let error = poll(&ctx, "bounded", &policy(30, 100), || async {
        Ok::<_, BoxError>(false)
    })
    .await
    .unwrap_err();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed <= Duration::from_millis(130));
    assert!(matches!(error, PollError::Timeout { attempts: 4, .. }));
    assert!(error.to_string().starts_with("bounded: timed out after 4 attempt(s)"));
}

/// Tests that unrelated polls run side by side instead of queueing behind
/// one another, and that each emits its own metric line.
#[tokio::test(start_paused = true)]
async fn test_concurrent_polls_are_independent() {
    let (recorder, captured) = MetricRecorder::capture();
    let ctx = PollContext::new("concurrent").with_recorder(recorder);
    let started = Instant::now();

    let polls = (0..20).map(|i| {
        let ctx = ctx.child(&format!("concurrent-{i}"));
        async move {
            let calls = AtomicU32::new(0);
            poll(&ctx, &format!("poll-{i}"), &policy(10, 1000), || {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move { Ok::<_, BoxError>(n == 3) }
            })
            .await
        }
    });
    let results = join_all(polls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(started.elapsed(), Duration::from_millis(20));

    let mut names: Vec<_> = captured
        .lines()
        .iter()
        .map(|line| MetricLine::parse(line).unwrap().name)
        .collect();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 20);
}

/// Tests that a failing single-shot check costs only the condition call,
/// however long the configured interval would have been.
#[tokio::test(start_paused = true)]
async fn test_failing_check_is_bounded_by_condition_latency() {
    let ctx = PollContext::new("check");
    let started = Instant::now();

    let error = check(&ctx, "slow-condition", || async {
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok::<_, BoxError>(false)
    })
    .await
    .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_millis(5));
    assert!(error.is_timeout());
}

/// Tests that cancellation during the sleep wins over the next attempt.
#[tokio::test(start_paused = true)]
async fn test_cancellation_during_sleep() {
    let ctx = PollContext::new("cancel");
    let calls = AtomicU32::new(0);
    let token = ctx.cancellation_token().clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        token.cancel();
    });
    let started = Instant::now();

    let error = poll(&ctx, "cancel", &policy(100, 10_000), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, BoxError>(false) }
    })
    .await
    .unwrap_err();

    assert_eq!(started.elapsed(), Duration::from_millis(250));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(matches!(error, PollError::Cancelled { attempts: 3, .. }));
}
