use chrono::Utc;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, ConditionError, PollError};
use crate::metrics::{Attempt, MetricRecorder};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);

/// Interval and timeout for a single wait.
///
/// `timeout >= interval > 0` always holds, except for the single-shot policy
/// used by [`check`] which never sleeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    interval: Duration,
    timeout: Duration,
    immediate: bool,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: DEFAULT_POLL_INTERVAL,
            timeout: DEFAULT_POLL_TIMEOUT,
            immediate: true,
        }
    }
}

impl PollPolicy {
    pub fn new(interval: Duration, timeout: Duration) -> Result<Self, PollError> {
        if interval.is_zero() {
            return Err(PollError::InvalidPolicy(
                "interval must be greater than 0".to_string(),
            ));
        }
        if timeout < interval {
            return Err(PollError::InvalidPolicy(format!(
                "timeout {timeout:?} is shorter than interval {interval:?}"
            )));
        }
        Ok(Self {
            interval,
            timeout,
            immediate: true,
        })
    }

    /// Like [`PollPolicy::new`] but raises a short timeout to the interval
    /// (and a zero interval to 1ms) instead of rejecting it.
    pub fn clamped(interval: Duration, timeout: Duration) -> Self {
        let interval = interval.max(Duration::from_millis(1));
        Self {
            interval,
            timeout: timeout.max(interval),
            immediate: true,
        }
    }

    /// Exactly one attempt, no sleep, no retry.
    pub fn single_shot() -> Self {
        Self {
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            immediate: true,
        }
    }

    /// When false, the poller sleeps one interval before the first attempt.
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn immediate(&self) -> bool {
        self.immediate
    }

    pub fn is_single_shot(&self) -> bool {
        self.timeout.is_zero()
    }
}

/// Per-test context threaded through every wait: the test name used as
/// logging context, the cancellation signal, an optional deadline and the
/// metric recorder.
#[derive(Debug, Clone)]
pub struct PollContext {
    test_name: String,
    cancel: CancellationToken,
    deadline: Option<Instant>,
    recorder: MetricRecorder,
}

impl PollContext {
    pub fn new(test_name: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            cancel: CancellationToken::new(),
            deadline: None,
            recorder: MetricRecorder::disabled(),
        }
    }

    pub fn with_recorder(mut self, recorder: MetricRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Context for a sub-test: cancelled together with `self`, but its own
    /// cancellation does not propagate upwards.
    pub fn child(&self, test_name: &str) -> Self {
        Self {
            test_name: test_name.to_string(),
            cancel: self.cancel.child_token(),
            deadline: self.deadline,
            recorder: self.recorder.clone(),
        }
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn recorder(&self) -> &MetricRecorder {
        &self.recorder
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self
                .deadline
                .is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Sleep for `duration`; returns true if cancelled or past the deadline
    /// first.
    async fn sleep_or_cancel(&self, duration: Duration) -> bool {
        let deadline = self.deadline;
        let past_deadline = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = past_deadline => true,
            _ = tokio::time::sleep(duration) => false,
        }
    }
}

struct Span<'a> {
    ctx: &'a PollContext,
    label: &'a str,
    wall_start: chrono::DateTime<Utc>,
    started: Instant,
}

impl<'a> Span<'a> {
    fn start(ctx: &'a PollContext, label: &'a str) -> Self {
        Self {
            ctx,
            label,
            wall_start: Utc::now(),
            started: Instant::now(),
        }
    }

    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    // End time is derived from the runtime clock so the reported duration
    // agrees with the elapsed time used for the timeout decision.
    fn finish(self) -> Duration {
        let elapsed = self.elapsed();
        let end = self.wall_start
            + chrono::Duration::from_std(elapsed).unwrap_or_else(|_| chrono::Duration::zero());
        self.ctx.recorder.record_attempt(&Attempt {
            label: self.label.to_string(),
            start: self.wall_start,
            end,
        });
        elapsed
    }
}

/// Poll `condition` until it yields a value, fails, times out or the
/// context is cancelled.
///
/// The condition is attempted immediately (unless the policy says
/// otherwise), then once per interval. Attempts are strictly sequential.
/// Exactly one metric line named `label` is emitted for every poll that
/// completes; a cancelled poll emits none.
pub async fn poll_until<T, F, Fut>(
    ctx: &PollContext,
    label: &str,
    policy: &PollPolicy,
    mut condition: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, ConditionError>>,
{
    let span = Span::start(ctx, label);
    let mut attempts: u32 = 0;
    let cancelled = |attempts: u32| {
        log::debug!("[{}] {label}: cancelled", ctx.test_name());
        PollError::Cancelled {
            label: label.to_string(),
            attempts,
        }
    };

    if !policy.immediate() && ctx.sleep_or_cancel(policy.interval()).await {
        return Err(cancelled(attempts));
    }

    loop {
        if ctx.is_cancelled() {
            return Err(cancelled(attempts));
        }

        if attempts > 0 && span.elapsed() >= policy.timeout() {
            let elapsed = span.finish();
            log::warn!(
                "[{}] {label}: timed out after {attempts} attempt(s) in {elapsed:?}",
                ctx.test_name()
            );
            return Err(PollError::Timeout {
                label: label.to_string(),
                attempts,
                elapsed,
            });
        }

        attempts += 1;
        let outcome = condition().await;

        // The attempt ran to completion, but its result no longer matters.
        if ctx.is_cancelled() {
            return Err(cancelled(attempts));
        }

        match outcome {
            Ok(Some(value)) => {
                let elapsed = span.finish();
                log::debug!(
                    "[{}] {label}: satisfied after {attempts} attempt(s) in {elapsed:?}",
                    ctx.test_name()
                );
                return Ok(value);
            }
            Ok(None) => {
                log::trace!(
                    "[{}] {label}: attempt {attempts} not satisfied",
                    ctx.test_name()
                );
            }
            Err(ConditionError::Failed(source)) => {
                let elapsed = span.finish();
                log::debug!(
                    "[{}] {label}: condition failed on attempt {attempts}: {source}",
                    ctx.test_name()
                );
                return Err(PollError::ConditionFailure {
                    label: label.to_string(),
                    elapsed,
                    source,
                });
            }
            Err(ConditionError::TransportExhausted {
                attempts: failures,
                source,
            }) => {
                span.finish();
                return Err(PollError::TransportExhausted {
                    label: label.to_string(),
                    attempts: failures,
                    source,
                });
            }
        }

        if policy.is_single_shot() {
            let elapsed = span.finish();
            return Err(PollError::Timeout {
                label: label.to_string(),
                attempts,
                elapsed,
            });
        }

        if ctx.sleep_or_cancel(policy.interval()).await {
            return Err(cancelled(attempts));
        }
    }
}

/// Poll a boolean condition: `Ok(true)` stops with success, `Ok(false)`
/// keeps polling and `Err` stops with a [`PollError::ConditionFailure`].
pub async fn poll<F, Fut>(
    ctx: &PollContext,
    label: &str,
    policy: &PollPolicy,
    mut condition: F,
) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BoxError>>,
{
    poll_until(ctx, label, policy, || {
        let attempt = condition();
        async move {
            match attempt.await {
                Ok(true) => Ok(Some(())),
                Ok(false) => Ok(None),
                Err(e) => Err(ConditionError::Failed(e)),
            }
        }
    })
    .await
}

/// Evaluate `condition` exactly once. A condition that is not yet satisfied
/// is reported as a [`PollError::Timeout`] with a single attempt.
pub async fn check<F, Fut>(ctx: &PollContext, label: &str, condition: F) -> Result<(), PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, BoxError>>,
{
    poll(ctx, label, &PollPolicy::single_shot(), condition).await
}
