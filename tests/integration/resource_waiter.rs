//! Resource waiter against an in-memory route store: objects that appear
//! late, become ready while polled, fail, or get deleted.

use crate::common::{FakeRoute, FakeRouteClient};
use pollgate::metrics::MetricLine;
use pollgate::resource::{is_ready, is_ready_or_failed, ConditionStatus, ResourceClient, StatusCondition};
use pollgate::{MetricRecorder, PollContext, PollError, PollPolicy, ResourceWaiter};
use std::sync::Arc;
use std::time::Duration;

fn waiter() -> ResourceWaiter {
    ResourceWaiter::new(
        PollPolicy::new(Duration::from_millis(10), Duration::from_secs(1)).unwrap(),
    )
}

/// Tests that NotFound is treated as "not yet" while waiting for a state.
///
/// **Expected Behavior:**
/// - Three NotFound gets are retried
/// - The fourth get returns the ready route
/// - One metric line named `WaitForState/<name>/<label>` is emitted
#[tokio::test(start_paused = true)]
async fn test_wait_for_state_tolerates_late_creation() {
    let client = FakeRouteClient::new();
    client.appear_after(3, FakeRoute::new("hello").ready());
    let (recorder, captured) = MetricRecorder::capture();
    let ctx = PollContext::new("late-creation").with_recorder(recorder);

    let route = waiter()
        .wait_for_state(&ctx, &client, "hello", "ready", is_ready)
        .await
        .unwrap();

    assert_eq!(route.name, "hello");
    assert_eq!(client.gets(), 4);
    let lines = captured.lines();
    assert_eq!(lines.len(), 1);
    let metric = MetricLine::parse(&lines[0]).unwrap();
    assert_eq!(metric.name, "WaitForState/hello/ready");
    assert_eq!(metric.duration_ms, 30.0);
}

/// Tests that a route which becomes ready while polled is returned with the
/// state it had when accepted.
#[tokio::test(start_paused = true)]
async fn test_wait_for_state_sees_concurrent_update() {
    let client = Arc::new(FakeRouteClient::new());
    client.create(FakeRoute::new("canary")).await.unwrap();

    let updater = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(55)).await;
        updater.update("canary", |route| {
            route.traffic_percent = 100;
            route.conditions = vec![StatusCondition::new("Ready", ConditionStatus::True)];
        });
    });

    let ctx = PollContext::new("concurrent-update");
    let route = waiter()
        .wait_for_state(&ctx, client.as_ref(), "canary", "ready", is_ready)
        .await
        .unwrap();

    assert_eq!(route.traffic_percent, 100);
    assert_eq!(client.gets(), 7);
}

/// Tests that a failed Ready condition stops the wait with its reason.
#[tokio::test(start_paused = true)]
async fn test_wait_for_state_stops_on_failure() {
    let client = FakeRouteClient::new();
    let mut route = FakeRoute::new("broken");
    let mut failed = StatusCondition::new("Ready", ConditionStatus::False);
    failed.reason = Some("RevisionMissing".to_string());
    failed.message = Some("revision broken-00001 not found".to_string());
    route.conditions = vec![failed];
    client.create(route).await.unwrap();

    let ctx = PollContext::new("failed-route");
    let error = waiter()
        .wait_for_state(&ctx, &client, "broken", "ready", is_ready_or_failed)
        .await
        .unwrap_err();

    match error {
        PollError::ConditionFailure { label, source, .. } => {
            assert_eq!(label, "WaitForState/broken/ready");
            assert!(source.to_string().contains("RevisionMissing"));
        }
        other => panic!("Expected ConditionFailure, got {other:?}"),
    }
    assert_eq!(client.gets(), 1);
}

/// Tests that a route which never gets ready times out with the composed
/// metric name as label.
#[tokio::test(start_paused = true)]
async fn test_wait_for_state_times_out() {
    let client = FakeRouteClient::new();
    client.create(FakeRoute::new("stuck")).await.unwrap();
    let ctx = PollContext::new("stuck-route");
    let waiter = ResourceWaiter::new(
        PollPolicy::new(Duration::from_millis(10), Duration::from_millis(100)).unwrap(),
    );

    let error = waiter
        .wait_for_state(&ctx, &client, "stuck", "ready", is_ready)
        .await
        .unwrap_err();

    assert!(error.is_timeout());
    assert_eq!(error.label(), Some("WaitForState/stuck/ready"));
}

/// Tests waiting for a deletion issued while the wait is in progress.
#[tokio::test(start_paused = true)]
async fn test_wait_for_deletion() {
    let client = Arc::new(FakeRouteClient::new());
    client.create(FakeRoute::new("doomed")).await.unwrap();

    let deleter = client.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(25)).await;
        deleter.delete(&["doomed".to_string()]).await.unwrap();
    });

    let ctx = PollContext::new("deletion");
    waiter()
        .wait_for_deletion(&ctx, client.as_ref(), "doomed", "gone")
        .await
        .unwrap();

    assert!(!client.contains("doomed"));
    assert_eq!(client.gets(), 4);
}

/// Tests that a single-shot state check does not retry a missing object.
#[tokio::test]
async fn test_check_state_of_missing_route() {
    let client = FakeRouteClient::new();
    let ctx = PollContext::new("check-missing");

    let error = waiter()
        .check_state(&ctx, &client, "absent", "ready", is_ready)
        .await
        .unwrap_err();

    assert!(matches!(error, PollError::ConditionFailure { .. }));
    assert_eq!(client.gets(), 1);
}
