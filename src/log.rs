//! Diagnostics sink for tether.
//!
//! Log levels:
//! - ERROR: Failures that end a task or the whole run
//! - WARN: Unexpected conditions that are recoverable
//! - INFO: High-level lifecycle notifications (startup, shutdown, job events)
//! - DEBUG: Detailed operation traces
//! - TRACE: Very detailed traces
//!
//! The sink is an explicit object shared as `Arc<DiagnosticsSink>`. Entries are
//! buffered in memory and reach their destination on [`DiagnosticsSink::flush`],
//! when the buffer grows past its high-water mark, or immediately for errors.
//! Every other module logs through `tracing`; [`SinkLayer`] forwards those
//! events here.
//!
//! Debug mode can be enabled with the `--debug` flag or `TETHER_DEBUG=1`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::{Error, Result};

/// Buffered bytes that trigger an inline flush.
const FLUSH_THRESHOLD: usize = 64 * 1024;

/// Log levels for filtering messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }
}

impl From<Level> for LogLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::ERROR => LogLevel::Error,
            Level::WARN => LogLevel::Warn,
            Level::INFO => LogLevel::Info,
            Level::DEBUG => LogLevel::Debug,
            Level::TRACE => LogLevel::Trace,
        }
    }
}

/// Where flushed entries end up.
enum Destination {
    /// No destination yet; a flush in this state drains to stderr.
    Detached,
    File { path: PathBuf, file: File },
    Writer(Box<dyn Write + Send>),
}

struct SinkState {
    buffer: String,
    destination: Destination,
}

/// Process-wide diagnostics target.
pub struct DiagnosticsSink {
    level: AtomicU8,
    state: Mutex<SinkState>,
}

impl Default for DiagnosticsSink {
    fn default() -> Self {
        Self::detached()
    }
}

impl DiagnosticsSink {
    /// A sink that buffers until a destination is attached.
    pub fn detached() -> Self {
        Self {
            level: AtomicU8::new(LogLevel::Info as u8),
            state: Mutex::new(SinkState {
                buffer: String::new(),
                destination: Destination::Detached,
            }),
        }
    }

    /// Set the minimum log level for output.
    pub fn set_level(&self, level: LogLevel) {
        self.level.store(level as u8, Ordering::SeqCst);
    }

    /// Get the current log level.
    pub fn level(&self) -> LogLevel {
        LogLevel::from_u8(self.level.load(Ordering::Relaxed))
    }

    /// Open a fresh log file in `dir` and move everything buffered so far into it.
    pub fn attach_file(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)?;
        let name = format!("tether-{}.log", chrono::Local::now().format("%Y%m%d-%H%M%S"));
        let path = dir.join(name);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        let mut state = self.lock();
        state.destination = Destination::File {
            path: path.clone(),
            file,
        };
        flush_locked(&mut state)?;
        Ok(path)
    }

    /// Route output to an arbitrary writer.
    pub fn attach_writer<W>(&self, writer: W)
    where
        W: Write + Send + 'static,
    {
        let mut state = self.lock();
        state.destination = Destination::Writer(Box::new(writer));
        if let Err(e) = flush_locked(&mut state) {
            report_flush_failure(&e);
        }
    }

    /// Path of the attached log file, if any.
    pub fn log_path(&self) -> Option<PathBuf> {
        match &self.lock().destination {
            Destination::File { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    /// Record one entry. Never fails; I/O problems are reported on stderr and
    /// the entry stays buffered for the next flush.
    pub fn write(&self, level: LogLevel, message: &str, fields: &[(&str, String)]) {
        if level > self.level() {
            return;
        }
        self.record(level, message, fields);
    }

    /// [`DiagnosticsSink::write`] without the level check. `tracing` events
    /// arrive here already filtered by `EnvFilter`.
    fn record(&self, level: LogLevel, message: &str, fields: &[(&str, String)]) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        let mut line = format!("[{}] [{}] {}", timestamp, level.as_str(), message);
        for (key, value) in fields {
            if value.contains(char::is_whitespace) {
                line.push_str(&format!(" {}={:?}", key, value));
            } else {
                line.push_str(&format!(" {}={}", key, value));
            }
        }
        line.push('\n');

        let mut state = self.lock();
        state.buffer.push_str(&line);
        if level == LogLevel::Error || state.buffer.len() >= FLUSH_THRESHOLD {
            if let Err(e) = flush_locked(&mut state) {
                report_flush_failure(&e);
            }
        }
    }

    /// Push every buffered entry to the destination before returning.
    ///
    /// Safe to call repeatedly and from the panic path.
    pub fn flush(&self) {
        let mut state = self.lock();
        if let Err(e) = flush_locked(&mut state) {
            report_flush_failure(&e);
        }
    }

    /// Bytes written but not yet flushed.
    pub fn pending(&self) -> usize {
        self.lock().buffer.len()
    }

    fn lock(&self) -> MutexGuard<'_, SinkState> {
        // A panic while holding the lock must not stop the panic path from flushing.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn flush_locked(state: &mut SinkState) -> io::Result<()> {
    let SinkState {
        buffer,
        destination,
    } = state;

    match destination {
        Destination::Detached => {
            let mut stderr = io::stderr().lock();
            stderr.write_all(buffer.as_bytes())?;
            stderr.flush()?;
        }
        Destination::File { file, .. } => {
            file.write_all(buffer.as_bytes())?;
            file.flush()?;
        }
        Destination::Writer(writer) => {
            writer.write_all(buffer.as_bytes())?;
            writer.flush()?;
        }
    }
    buffer.clear();
    Ok(())
}

fn report_flush_failure(e: &io::Error) {
    let _ = writeln!(io::stderr(), "tether: failed to flush diagnostics: {}", e);
}

/// Check the `TETHER_DEBUG` environment variable.
pub fn debug_from_env() -> bool {
    std::env::var("TETHER_DEBUG")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// `tracing` layer that writes every event into a [`DiagnosticsSink`].
pub struct SinkLayer {
    sink: Arc<DiagnosticsSink>,
}

impl SinkLayer {
    pub fn new(sink: Arc<DiagnosticsSink>) -> Self {
        Self { sink }
    }
}

impl<S: Subscriber> Layer<S> for SinkLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = FieldCollector::default();
        event.record(&mut fields);
        self.sink.record(
            LogLevel::from(*event.metadata().level()),
            &fields.message,
            &fields.fields,
        );
    }
}

#[derive(Default)]
struct FieldCollector {
    message: String,
    fields: Vec<(&'static str, String)>,
}

impl Visit for FieldCollector {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.push((field.name(), value.to_string()));
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.fields.push((field.name(), format!("{:?}", value)));
        }
    }
}

/// Install the global `tracing` subscriber feeding `sink`.
///
/// `TETHER_LOG` takes an `EnvFilter` directive and overrides the default.
/// The filter alone decides which `tracing` events reach the sink; the sink's
/// own level only applies to direct [`DiagnosticsSink::write`] calls.
pub fn init_tracing(sink: Arc<DiagnosticsSink>, debug: bool) -> Result<()> {
    sink.set_level(if debug { LogLevel::Debug } else { LogLevel::Info });
    let directive = std::env::var("TETHER_LOG").ok();

    subscriber(sink, env_filter(directive.as_deref(), debug))
        .try_init()
        .map_err(|e| Error::Validation(format!("logging already initialized: {}", e)))
}

fn env_filter(directive: Option<&str>, debug: bool) -> EnvFilter {
    let default = if debug { "debug" } else { "info" };
    directive
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new(default))
}

fn subscriber(sink: Arc<DiagnosticsSink>, filter: EnvFilter) -> impl Subscriber + Send + Sync + 'static {
    tracing_subscriber::registry()
        .with(filter)
        .with(SinkLayer::new(sink))
}
