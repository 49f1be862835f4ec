pub mod config;
pub mod error;
pub mod interrupt;
pub mod metrics;
pub mod naming;
pub mod poll;
pub mod prober;
pub mod resource;

#[cfg(any(test, feature = "test-harness"))]
pub mod test_harness;

// Re-export commonly used items
pub use config::Settings;
pub use error::{BoxError, ConditionError, FetchError, PollError, ProbeError};
pub use interrupt::{CleanupHandle, InterruptHandler, InterruptRegistry, INTERRUPTED_EXIT_CODE};
pub use metrics::{metric_name, MetricRecorder};
pub use poll::{check, poll, poll_until, PollContext, PollPolicy};
pub use prober::{EndpointProber, ProbeRequest, ProbeResponse, ProbeTarget};
pub use resource::{ResourceClient, ResourceWaiter};
