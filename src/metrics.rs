use chrono::{DateTime, Utc};
use std::io::Write;
use std::sync::{Arc, Mutex};

type Sink = Arc<Mutex<Box<dyn Write + Send>>>;

/// A timed span emitted to the [`MetricRecorder`] once and then discarded.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub label: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Attempt {
    pub fn duration_ms(&self) -> f64 {
        let nanos = (self.end - self.start).num_nanoseconds().unwrap_or(0);
        nanos as f64 / 1_000_000.0
    }
}

/// Compose a metric name from the calling operation, the resource it
/// targets and the caller's label. Empty segments are dropped together with
/// their separator.
pub fn metric_name(caller: &str, resource: &str, label: &str) -> String {
    [caller, resource, label]
        .iter()
        .filter(|segment| !segment.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Format one metric line, without the trailing newline.
pub fn format_metric(name: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> String {
    let attempt = Attempt {
        label: name.to_string(),
        start,
        end,
    };
    format!(
        "metric {} {} {} {}ms",
        attempt.label,
        start.timestamp_nanos_opt().unwrap_or_default(),
        end.timestamp_nanos_opt().unwrap_or_default(),
        attempt.duration_ms()
    )
}

/// Records named time intervals as `metric <name> <start> <end> <dur>ms` lines.
///
/// Cloning is cheap and all clones write to the same sink. Each line is
/// written with a single locked `write_all`, so lines from concurrent polls
/// never split. Sink failures are logged and swallowed.
#[derive(Clone)]
pub struct MetricRecorder {
    sink: Option<Sink>,
}

impl std::fmt::Debug for MetricRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricRecorder")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Default for MetricRecorder {
    fn default() -> Self {
        Self::disabled()
    }
}

impl MetricRecorder {
    pub fn stdout() -> Self {
        Self::with_writer(std::io::stdout())
    }

    pub fn with_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self {
            sink: Some(Arc::new(Mutex::new(Box::new(writer)))),
        }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// In-memory recorder, mostly for tests.
    pub fn capture() -> (Self, CapturedMetrics) {
        let captured = CapturedMetrics::default();
        (Self::with_writer(captured.clone()), captured)
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn record(&self, name: &str, start: DateTime<Utc>, end: DateTime<Utc>) {
        let Some(sink) = &self.sink else {
            return;
        };

        let mut line = format_metric(name, start, end);
        line.push('\n');

        let mut writer = sink.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Err(e) = writer
            .write_all(line.as_bytes())
            .and_then(|_| writer.flush())
        {
            log::warn!("Failed to emit metric {name}: {e}");
        }
    }

    pub fn record_attempt(&self, attempt: &Attempt) {
        self.record(&attempt.label, attempt.start, attempt.end);
    }
}

/// Shared buffer behind [`MetricRecorder::capture`].
#[derive(Clone, Default)]
pub struct CapturedMetrics {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl CapturedMetrics {
    pub fn contents(&self) -> String {
        let buffer = self
            .buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        String::from_utf8_lossy(&buffer).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

impl Write for CapturedMetrics {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A parsed metric line.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricLine {
    pub name: String,
    pub start_nanos: i64,
    pub end_nanos: i64,
    pub duration_ms: f64,
}

impl MetricLine {
    pub fn parse(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace();
        if parts.next()? != "metric" {
            return None;
        }
        let name = parts.next()?.to_string();
        let start_nanos = parts.next()?.parse().ok()?;
        let end_nanos = parts.next()?.parse().ok()?;
        let duration_ms = parts.next()?.strip_suffix("ms")?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            name,
            start_nanos,
            end_nanos,
            duration_ms,
        })
    }
}
