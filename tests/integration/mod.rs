//! Integration tests for the polling engine.
//!
//! ## Test Organization
//!
//! - **poller**: timing, metric emission and concurrency of plain condition polls
//! - **resource_waiter**: waiting on remote objects through a fake client
//! - **prober**: HTTP probing against `httpmock` servers, direct and via an ingress
//! - **harness**: the test environment, interrupt-driven cleanup and shutdown
//!
//! Poller and resource waiter tests run on a paused tokio clock; prober and
//! harness tests use real time.

pub mod poller;
pub mod prober;
pub mod resource_waiter;
