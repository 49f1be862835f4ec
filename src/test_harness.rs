use anyhow::{Context, Result};
use std::future::Future;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::config::Settings;
use crate::interrupt::{CleanupHandle, DrainReport, InterruptRegistry};
use crate::metrics::MetricRecorder;
use crate::poll::PollContext;
use crate::prober::EndpointProber;
use crate::resource::{ResourceClient, ResourceWaiter};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

/// Install `env_logger` for tests. Safe to call from every test; only the
/// first call takes effect. `RUST_LOG` still wins over `default_level`.
pub fn init_logging(default_level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .is_test(true)
        .try_init();
}

/// Process-level test environment: frozen settings, the interrupt registry,
/// the metric recorder and a root cancellation token for every test
/// context handed out.
pub struct TestEnvironment {
    settings: Arc<Settings>,
    registry: InterruptRegistry,
    recorder: MetricRecorder,
    cancel: CancellationToken,
}

impl TestEnvironment {
    /// Attaches to the process-wide interrupt handler.
    pub fn new(settings: Settings) -> Result<Self> {
        Self::with_registry(settings, InterruptRegistry::new())
    }

    /// Like [`TestEnvironment::new`], with a caller-supplied registry. A
    /// registry already attached through [`InterruptRegistry::init_with`]
    /// stays with its handler.
    pub fn with_registry(settings: Settings, registry: InterruptRegistry) -> Result<Self> {
        settings
            .validate()
            .context("Invalid test environment settings")?;
        init_logging(settings.log_level());

        let recorder = if settings.emit_metrics {
            MetricRecorder::stdout()
        } else {
            MetricRecorder::disabled()
        };
        registry.init();

        log::debug!("Test environment ready: {settings:?}");
        Ok(Self {
            settings: settings.freeze(),
            registry,
            recorder,
            cancel: CancellationToken::new(),
        })
    }

    /// Replace the recorder, e.g. with [`MetricRecorder::capture`].
    pub fn with_recorder(mut self, recorder: MetricRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    pub fn registry(&self) -> &InterruptRegistry {
        &self.registry
    }

    pub fn recorder(&self) -> &MetricRecorder {
        &self.recorder
    }

    /// Context for one test; cancelled when the environment shuts down.
    pub fn context(&self, test_name: &str) -> PollContext {
        PollContext::new(test_name)
            .with_cancellation(self.cancel.child_token())
            .with_recorder(self.recorder.clone())
    }

    pub fn resource_waiter(&self) -> Result<ResourceWaiter> {
        let policy = self.settings.poll.policy()?;
        Ok(ResourceWaiter::new(policy))
    }

    pub fn prober(&self) -> Result<EndpointProber> {
        EndpointProber::from_settings(&self.settings).context("Failed to build endpoint prober")
    }

    /// Delete `names` through `client` when the process is interrupted or
    /// the environment shuts down. The returned handle lets the test run the
    /// deletion itself through [`TestEnvironment::run_cleanup`]; it happens
    /// at most once either way.
    ///
    /// The deletion runs on the runtime this is called from, so clients
    /// whose connections are driven by that runtime keep working.
    pub fn cleanup_on_interrupt<C>(&self, client: Arc<C>, names: Vec<String>) -> CleanupHandle
    where
        C: ResourceClient + 'static,
    {
        let label = format!("delete {} {}", client.kind(), names.join(","));
        let origin = Handle::try_current().ok();
        self.registry.register(&label, move || {
            run_on_origin(origin.as_ref(), || delete_all(client.clone(), names.clone()))
        })
    }

    /// Run `handle` off the runtime and wait for it. Returns `Ok(false)` if
    /// it already ran.
    pub async fn run_cleanup(&self, handle: &CleanupHandle) -> Result<bool> {
        let handle = handle.clone();
        tokio::task::spawn_blocking(move || handle.run())
            .await
            .context("Cleanup task panicked")?
    }

    /// Cancel every outstanding context and run the cleanups that have not
    /// run yet. The cleanups run on the blocking pool while this runtime
    /// keeps driving the deletions they wait for.
    pub async fn shutdown(self) -> DrainReport {
        self.cancel.cancel();
        let registry = self.registry.clone();
        let report = match tokio::task::spawn_blocking(move || registry.shutdown()).await {
            Ok(report) => report,
            Err(e) => {
                log::error!("Cleanup drain task failed: {e}");
                DrainReport::default()
            }
        };
        log::debug!(
            "Test environment shut down: {} cleanup(s) ran, {} failed",
            report.ran,
            report.failed
        );
        report
    }
}

async fn delete_all<C>(client: Arc<C>, names: Vec<String>) -> Result<()>
where
    C: ResourceClient + 'static,
{
    match client.delete(&names).await {
        Err(e) if !e.is_not_found() => Err(anyhow::Error::new(e)),
        _ => Ok(()),
    }
}

/// Run the future built by `make` on `origin` and block until it finishes.
/// Must not be called from `origin`'s own worker thread. Falls back to a
/// private runtime when there is no origin or it has shut down.
fn run_on_origin<F, Fut>(origin: Option<&Handle>, make: F) -> Result<()>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    if let Some(runtime) = origin {
        let (tx, rx) = std::sync::mpsc::channel();
        let task = make();
        runtime.spawn(async move {
            let _ = tx.send(task.await);
        });
        match rx.recv_timeout(CLEANUP_TIMEOUT) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) => {
                return Err(anyhow::anyhow!(
                    "Cleanup did not finish within {CLEANUP_TIMEOUT:?}"
                ))
            }
            Err(RecvTimeoutError::Disconnected) => {
                log::debug!("Registering runtime is gone, running cleanup on a private runtime");
            }
        }
    }
    block_on_detached(make())
}

/// Run `future` to completion on a private runtime in a fresh thread.
fn block_on_detached<F>(future: F) -> Result<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    std::thread::spawn(move || {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("Failed to build cleanup runtime")?
            .block_on(future)
    })
    .join()
    .map_err(|_| anyhow::anyhow!("Cleanup thread panicked"))?
}
