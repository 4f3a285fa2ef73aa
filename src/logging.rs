use std::{
    fmt::Display,
    sync::{Arc, Mutex},
    time::Duration,
};

use log::{debug, error, info, warn};

/// Sink for run diagnostics. Handed to the scheduler explicitly so a run never
/// depends on process-wide logger state.
pub trait Diagnostics: Send + Sync {
    fn debug(&self, message: &str) {
        let _ = message;
    }
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to the `log` facade.
pub struct LogDiagnostics {
    quiet_transport: bool,
}

impl LogDiagnostics {
    pub fn new() -> Self {
        Self {
            quiet_transport: dotenvy::var("DO_NOT_LOG_TRANSPORT_ERROR").is_ok(),
        }
    }
}

impl Default for LogDiagnostics {
    fn default() -> Self {
        Self::new()
    }
}

impl Diagnostics for LogDiagnostics {
    fn debug(&self, message: &str) {
        debug!("{message}");
    }

    fn info(&self, message: &str) {
        info!("{message}");
    }

    fn warn(&self, message: &str) {
        warn!("{message}");
    }

    fn error(&self, message: &str) {
        error!("{message}");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

/// Keeps every line in memory. Used by tests to assert on emitted events.
#[derive(Default)]
pub struct MemoryDiagnostics {
    lines: Mutex<Vec<(Level, String)>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<(Level, String)> {
        self.lines
            .lock()
            .map(|lines| lines.clone())
            .unwrap_or_default()
    }

    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.lines()
            .iter()
            .any(|(l, line)| *l == level && line.contains(needle))
    }

    fn push(&self, level: Level, message: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push((level, message.to_string()));
        }
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn debug(&self, message: &str) {
        self.push(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }
}

/// Named run events on top of a [`Diagnostics`] sink.
#[derive(Clone)]
pub struct RunLogger {
    sink: Arc<dyn Diagnostics>,
    quiet_transport: bool,
}

impl RunLogger {
    pub fn new(sink: Arc<dyn Diagnostics>) -> Self {
        Self {
            sink,
            quiet_transport: false,
        }
    }

    /// Logger backed by the `log` facade, honouring `DO_NOT_LOG_TRANSPORT_ERROR`.
    pub fn from_env() -> Self {
        let sink = LogDiagnostics::new();
        let quiet_transport = sink.quiet_transport;
        Self {
            sink: Arc::new(sink),
            quiet_transport,
        }
    }

    pub fn state_changed(&self, from: &str, to: &str) {
        self.sink.debug(&format!("scheduler {from} -> {to}"));
    }

    pub fn run_started(&self, concurrency: usize, quota: &dyn Display, qps: u32) {
        self.sink.info(&format!(
            "Starting run: concurrency={concurrency} quota={quota} qps={qps}"
        ));
    }

    pub fn interrupted(&self) {
        self.sink
            .warn("Received interrupt, draining workers before stopping");
    }

    pub fn worker_finished(&self, id: usize, issued: usize) {
        self.sink
            .debug(&format!("worker {id} finished after {issued} attempts"));
    }

    pub fn worker_panicked(&self, err: &dyn Display) {
        self.sink.error(&format!("worker task failed: {err}"));
    }

    pub fn stop_observed(&self, id: usize) {
        self.sink.debug(&format!("worker {id} observed stop signal"));
    }

    pub fn transport_failure(&self, err: &dyn Display) {
        if self.quiet_transport {
            return;
        }
        self.sink.error(&err.to_string());
    }

    pub fn build_failure(&self, err: &dyn Display) {
        self.sink.error(&format!("request build failed: {err}"));
    }

    pub fn form_field_skipped(&self, field: &str, path: &str, err: &dyn Display) {
        self.sink.warn(&format!(
            "form field '{field}' skipped, cannot read '{path}': {err}"
        ));
    }

    pub fn response_captured(&self, param: &str, body: &str) {
        self.sink.info(&format!("{}\t{}", param.trim(), body.trim()));
    }

    pub fn body_read_failure(&self, err: &dyn Display) {
        self.sink.warn(&err.to_string());
    }

    pub fn result_dropped(&self, worker: usize) {
        self.sink
            .debug(&format!("worker {worker} dropped a result: sink not ready"));
    }

    pub fn report_write_failure(&self, err: &dyn Display) {
        self.sink.error(&format!("failed to write report: {err}"));
    }

    pub fn run_finished(&self, elapsed: Duration, issued: usize, dropped: u64) {
        self.sink.info(&format!(
            "Run finished in {elapsed:?}: attempts={issued} dropped_results={dropped}"
        ));
    }
}
