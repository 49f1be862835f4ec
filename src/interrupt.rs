use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Exit status after draining on interruption, distinct from an ordinary
/// test failure (1).
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

type Callback = Box<dyn Fn() -> anyhow::Result<()> + Send + Sync>;
type ExitHook = Box<dyn Fn(i32) + Send + Sync>;

/// A registered cleanup callback.
///
/// The test that registered it may run it directly; the registry runs it
/// again on interruption or shutdown. The callback body executes at most
/// once across all of them.
///
/// `run` blocks the calling thread until the callback returns. From async
/// code, call it through `spawn_blocking` so the runtime stays free to drive
/// whatever the callback waits on.
#[derive(Clone)]
pub struct CleanupHandle {
    inner: Arc<CleanupInner>,
}

struct CleanupInner {
    name: String,
    callback: Callback,
    done: AtomicBool,
}

impl std::fmt::Debug for CleanupHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupHandle")
            .field("name", &self.inner.name)
            .field("done", &self.has_run())
            .finish()
    }
}

impl CleanupHandle {
    fn new(name: &str, callback: Callback) -> Self {
        Self {
            inner: Arc::new(CleanupInner {
                name: name.to_string(),
                callback,
                done: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn has_run(&self) -> bool {
        self.inner.done.load(Ordering::SeqCst)
    }

    /// Run the callback unless it already ran. Returns `Ok(false)` when
    /// skipped.
    pub fn run(&self) -> anyhow::Result<bool> {
        if self.inner.done.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }
        (self.inner.callback)()?;
        Ok(true)
    }
}

/// Outcome of running the registered callbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub ran: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl DrainReport {
    fn merge(&mut self, other: DrainReport) {
        self.ran += other.ran;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

static GLOBAL_HANDLER: OnceLock<InterruptHandler> = OnceLock::new();

/// Process-wide interruption handler.
///
/// At most one signal watcher is installed per handler. It runs on its own
/// thread with a private runtime, so it outlives the runtime of whichever
/// test installed it and never blocks a test runtime while cleanups run. On
/// interruption every attached registry is drained in attach order, then the
/// exit hook runs once.
#[derive(Clone)]
pub struct InterruptHandler {
    inner: Arc<HandlerInner>,
}

struct HandlerInner {
    registries: Mutex<Vec<Weak<RegistryInner>>>,
    installed: AtomicBool,
    fired: AtomicBool,
    stop: CancellationToken,
    exit_hook: ExitHook,
}

impl Drop for HandlerInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl std::fmt::Debug for InterruptHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptHandler")
            .field("installed", &self.is_installed())
            .field("registries", &self.live_registries().len())
            .finish()
    }
}

impl InterruptHandler {
    /// The handler shared by every registry in the process. Its exit hook
    /// terminates the process.
    pub fn global() -> &'static InterruptHandler {
        GLOBAL_HANDLER.get_or_init(|| {
            Self::with_exit_hook(|code| {
                std::process::exit(code);
            })
        })
    }

    /// Handler whose post-drain exit goes through `hook` instead of
    /// terminating the process.
    pub fn with_exit_hook<H>(hook: H) -> Self
    where
        H: Fn(i32) + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(HandlerInner {
                registries: Mutex::new(Vec::new()),
                installed: AtomicBool::new(false),
                fired: AtomicBool::new(false),
                stop: CancellationToken::new(),
                exit_hook: Box::new(hook),
            }),
        }
    }

    /// Watch for Ctrl-C and, on unix, SIGTERM. Returns false if a watcher is
    /// already installed.
    pub fn install(&self) -> bool {
        self.install_with_signal(interrupt_signal())
    }

    /// Interrupt when `signal` resolves. Returns false if a watcher is
    /// already installed.
    pub fn install_with_signal<F>(&self, signal: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.inner.installed.swap(true, Ordering::SeqCst) {
            log::debug!("Interrupt handler already installed");
            return false;
        }

        let handler = Arc::downgrade(&self.inner);
        let stop = self.inner.stop.clone();
        let spawned = std::thread::Builder::new()
            .name("pollgate-interrupt".to_string())
            .spawn(move || watch(signal, stop, handler));
        if let Err(e) = spawned {
            log::error!("Failed to start interrupt handler thread: {e}");
            self.inner.installed.store(false, Ordering::SeqCst);
            return false;
        }
        true
    }

    pub fn is_installed(&self) -> bool {
        self.inner.installed.load(Ordering::SeqCst)
    }

    /// Drain `registry` on interruption. A registry attaches to one handler
    /// at a time; returns false if it is already attached.
    pub fn attach(&self, registry: &InterruptRegistry) -> bool {
        let mut slot = lock(&registry.inner.handler);
        if slot.as_ref().is_some_and(|handler| handler.strong_count() > 0) {
            return false;
        }
        *slot = Some(Arc::downgrade(&self.inner));

        let mut registries = lock(&self.inner.registries);
        registries.retain(|r| r.strong_count() > 0);
        registries.push(Arc::downgrade(&registry.inner));
        true
    }

    /// Drain every attached registry, then call the exit hook with
    /// [`INTERRUPTED_EXIT_CODE`]. Only the first call does anything.
    pub fn interrupt(&self) -> DrainReport {
        if self.inner.fired.swap(true, Ordering::SeqCst) {
            return DrainReport::default();
        }

        let registries = self.live_registries();
        log::warn!(
            "Interrupted, draining {} cleanup registr{}",
            registries.len(),
            if registries.len() == 1 { "y" } else { "ies" }
        );
        let mut total = DrainReport::default();
        for registry in registries {
            total.merge(registry.drain());
        }
        log::warn!(
            "Cleanup finished: {} ran, {} failed, {} skipped",
            total.ran,
            total.failed,
            total.skipped
        );

        (self.inner.exit_hook)(INTERRUPTED_EXIT_CODE);
        total
    }

    fn live_registries(&self) -> Vec<InterruptRegistry> {
        lock(&self.inner.registries)
            .iter()
            .filter_map(Weak::upgrade)
            .map(|inner| InterruptRegistry { inner })
            .collect()
    }
}

fn watch<F>(signal: F, stop: CancellationToken, handler: Weak<HandlerInner>)
where
    F: Future<Output = ()>,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            log::error!("Failed to build interrupt handler runtime: {e}");
            return;
        }
    };

    let interrupted = runtime.block_on(async move {
        tokio::select! {
            _ = signal => true,
            _ = stop.cancelled() => false,
        }
    });

    if interrupted {
        if let Some(inner) = handler.upgrade() {
            InterruptHandler { inner }.interrupt();
        }
    }
}

/// Ordered, append-only list of cleanup callbacks run once on process
/// interruption or at shutdown.
#[derive(Clone)]
pub struct InterruptRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    callbacks: Mutex<Vec<CleanupHandle>>,
    drained: AtomicBool,
    handler: Mutex<Option<Weak<HandlerInner>>>,
}

impl Default for InterruptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InterruptRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterruptRegistry")
            .field("callbacks", &self.len())
            .field("attached", &self.is_attached())
            .finish()
    }
}

impl InterruptRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                callbacks: Mutex::new(Vec::new()),
                drained: AtomicBool::new(false),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Attach to [`InterruptHandler::global`], installing its signal watcher
    /// on first use. Returns true only for the call that installed the
    /// watcher; any later call, from this or any other registry, is a no-op
    /// that returns false.
    pub fn init(&self) -> bool {
        let handler = InterruptHandler::global();
        if !handler.attach(self) {
            return false;
        }
        handler.install()
    }

    /// Attach to `handler` instead of the process-wide one.
    pub fn init_with(&self, handler: &InterruptHandler) -> bool {
        handler.attach(self)
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.inner.handler)
            .as_ref()
            .is_some_and(|handler| handler.strong_count() > 0)
    }

    pub fn register<F>(&self, name: &str, callback: F) -> CleanupHandle
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let handle = CleanupHandle::new(name, Box::new(callback));
        lock(&self.inner.callbacks).push(handle.clone());
        handle
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.callbacks).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback registered so far, in registration order. Only the
    /// first call does anything; callbacks registered after the snapshot is
    /// taken are left for [`InterruptRegistry::shutdown`].
    pub fn drain(&self) -> DrainReport {
        if self.inner.drained.swap(true, Ordering::SeqCst) {
            return DrainReport::default();
        }
        let snapshot = lock(&self.inner.callbacks).clone();
        run_all(&snapshot)
    }

    /// Detach from the interrupt handler, run callbacks that have not run yet
    /// and clear the list.
    pub fn shutdown(&self) -> DrainReport {
        let handler = lock(&self.inner.handler).take();
        if let Some(handler) = handler.and_then(|handler| handler.upgrade()) {
            let me = Arc::downgrade(&self.inner);
            lock(&handler.registries).retain(|r| r.strong_count() > 0 && !Weak::ptr_eq(r, &me));
        }
        let remaining = std::mem::take(&mut *lock(&self.inner.callbacks));
        run_all(&remaining)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn run_all(handles: &[CleanupHandle]) -> DrainReport {
    let mut report = DrainReport::default();
    for handle in handles {
        match catch_unwind(AssertUnwindSafe(|| handle.run())) {
            Ok(Ok(true)) => report.ran += 1,
            Ok(Ok(false)) => report.skipped += 1,
            Ok(Err(e)) => {
                log::error!("Cleanup {:?} failed: {e:#}", handle.name());
                report.failed += 1;
            }
            Err(panic) => {
                log::error!(
                    "Cleanup {:?} panicked: {}",
                    handle.name(),
                    panic_message(&*panic)
                );
                report.failed += 1;
            }
        }
    }
    report
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Resolves on Ctrl-C or, on unix, SIGTERM.
async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("Received Ctrl-C"),
        _ = terminate => log::info!("Received SIGTERM"),
    }
}
