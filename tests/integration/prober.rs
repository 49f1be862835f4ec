//! Endpoint prober against a live mock HTTP server: direct and ingress
//! routing, route-propagation retries and terminal status failures.

use httpmock::Method::{GET, POST};
use httpmock::MockServer;
use pollgate::prober::{
    is_one_of_status, is_status_ok, matches_body, retrying_route_inconsistency,
};
use pollgate::{EndpointProber, PollContext, PollError, PollPolicy, ProbeRequest, ProbeTarget};
use std::time::Duration;

fn prober(target: ProbeTarget) -> EndpointProber {
    EndpointProber::builder()
        .target(target)
        .policy(PollPolicy::new(Duration::from_millis(20), Duration::from_secs(5)).unwrap())
        .transport_error_threshold(3)
        .request_timeout(Duration::from_secs(2))
        .build()
        .unwrap()
}

/// Tests that a logical domain that does not resolve is reached through the
/// ingress, with the logical host carried in the Host header.
#[tokio::test]
async fn test_probe_via_ingress_sets_host_header() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/greeting")
                .header("host", "hello.default.example.com");
            then.status(200).body("Hello World!");
        })
        .await;

    let prober = prober(ProbeTarget::Ingress(server.address().to_string()));
    let request = ProbeRequest::get("http://hello.default.example.com/greeting").unwrap();
    let ctx = PollContext::new("probe-via-ingress");

    let response = prober
        .poll(&ctx, &request, "greeting", matches_body("Hello World"))
        .await
        .unwrap();

    assert_eq!(response.status.as_u16(), 200);
    assert_eq!(response.text(), "Hello World!");
    mock.assert_hits_async(1).await;
}

/// Tests that direct mode connects to the URL as given.
#[tokio::test]
async fn test_probe_direct() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/")
                .header("host", server.address().to_string());
            then.status(200).body("ok");
        })
        .await;

    let prober = prober(ProbeTarget::Direct);
    let request = ProbeRequest::get(&server.url("/")).unwrap();
    let ctx = PollContext::new("probe-direct");

    prober
        .poll(&ctx, &request, "root", is_status_ok)
        .await
        .unwrap();
    mock.assert_hits_async(1).await;
}

/// Tests that 503 responses during route propagation keep the poll going
/// until the route starts answering.
#[tokio::test]
async fn test_route_inconsistency_is_retried() {
    let server = MockServer::start_async().await;
    let mut unavailable = server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(503);
        })
        .await;

    let prober = prober(ProbeTarget::Direct);
    let request = ProbeRequest::get(&server.url("/")).unwrap();
    let ctx = PollContext::new("route-inconsistency");

    let switch = async {
        while unavailable.hits_async().await < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        unavailable.delete_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200).body("ready");
            })
            .await
    };
    let probe = prober.poll(
        &ctx,
        &request,
        "propagation",
        retrying_route_inconsistency(is_status_ok),
    );

    let (result, ready) = tokio::join!(probe, switch);

    let response = result.unwrap();
    assert_eq!(response.text(), "ready");
    ready.assert_hits_async(1).await;
}

/// Tests that an unexpected status is a terminal condition failure and not
/// retried.
#[tokio::test]
async fn test_unexpected_status_stops_the_poll() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(GET).path("/");
            then.status(500).body("boom");
        })
        .await;

    let prober = prober(ProbeTarget::Direct);
    let request = ProbeRequest::get(&server.url("/")).unwrap();
    let ctx = PollContext::new("unexpected-status");

    let error = prober
        .poll(&ctx, &request, "status", is_status_ok)
        .await
        .unwrap_err();

    match &error {
        PollError::ConditionFailure { source, .. } => {
            assert!(source.to_string().contains("500"));
            assert!(source.to_string().contains("boom"));
        }
        other => panic!("Expected ConditionFailure, got {other:?}"),
    }
    mock.assert_hits_async(1).await;
}

/// Tests that method, headers and body of the request reach the endpoint.
#[tokio::test]
async fn test_post_forwards_headers_and_body() {
    let server = MockServer::start_async().await;
    let mock = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/echo")
                .header("x-test-run", "42")
                .body("payload");
            then.status(201).body("created");
        })
        .await;

    let prober = prober(ProbeTarget::Direct);
    let request = ProbeRequest::new(reqwest::Method::POST, &server.url("/echo"))
        .unwrap()
        .with_header("x-test-run", "42")
        .unwrap()
        .with_body("payload");
    let ctx = PollContext::new("post");

    let response = prober
        .poll(&ctx, &request, "echo", is_one_of_status(&[201]))
        .await
        .unwrap();

    assert_eq!(response.text(), "created");
    mock.assert_hits_async(1).await;
}
