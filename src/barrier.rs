//! Panic barrier around the top of the process.
//!
//! [`PanicBarrier::run`] executes the whole startup and run sequence. If
//! anything on the calling thread panics, the barrier builds a single
//! [`TerminalReport`], writes it to the diagnostics sink, flushes the sink
//! and shows the report to the operator.
//!
//! Message, location and backtrace are taken from a process-wide panic hook.
//! The hook only captures for threads currently inside a barrier; panics on
//! any other thread go to whatever hook was installed before.

use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::io::{self, BufRead, IsTerminal, Write};
use std::panic::{self, AssertUnwindSafe, PanicHookInfo};
use std::sync::{Arc, Once};

use crate::log::{DiagnosticsSink, LogLevel};
use crate::util::panic_message;
use crate::Result;

thread_local! {
    static GUARDED: Cell<bool> = const { Cell::new(false) };
    static CAPTURED: RefCell<Option<TerminalReport>> = const { RefCell::new(None) };
}

static HOOK: Once = Once::new();

/// Everything known about an uncaught fault.
#[derive(Debug, Clone)]
pub struct TerminalReport {
    pub message: String,
    pub location: Option<String>,
    pub backtrace: String,
}

impl fmt::Display for TerminalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(location) = &self.location {
            write!(f, "\n  at {}", location)?;
        }
        if !self.backtrace.is_empty() {
            write!(f, "\n\n{}", self.backtrace)?;
        }
        Ok(())
    }
}

pub enum Outcome<T> {
    Completed(T),
    Faulted(TerminalReport),
}

impl<T> Outcome<T> {
    pub fn is_faulted(&self) -> bool {
        matches!(self, Outcome::Faulted(_))
    }
}

/// Where a terminal report is shown to a human.
pub trait OperatorSurface: Send + Sync {
    fn show(&self, title: &str, body: &str) -> Result<()>;
}

/// Prints the report in a box on stderr. When stdin is a terminal it waits
/// for Enter so the report is not scrolled away by the shell.
pub struct ConsoleDialog;

impl OperatorSurface for ConsoleDialog {
    fn show(&self, title: &str, body: &str) -> Result<()> {
        let width = body
            .lines()
            .chain(std::iter::once(title))
            .map(|l| l.chars().count())
            .max()
            .unwrap_or(0)
            .min(100);
        let rule = "─".repeat(width + 2);

        let mut err = io::stderr().lock();
        writeln!(err, "┌{}┐", rule)?;
        writeln!(err, "│ {:width$} │", title, width = width)?;
        writeln!(err, "├{}┤", rule)?;
        for line in body.lines() {
            writeln!(err, "│ {:width$} │", line, width = width)?;
        }
        writeln!(err, "└{}┘", rule)?;
        err.flush()?;
        drop(err);

        let stdin = io::stdin();
        if stdin.is_terminal() {
            eprint!("Press Enter to exit.");
            let mut line = String::new();
            stdin.lock().read_line(&mut line)?;
        }
        Ok(())
    }
}

pub struct PanicBarrier {
    sink: Arc<DiagnosticsSink>,
    surface: Box<dyn OperatorSurface>,
}

impl PanicBarrier {
    pub fn new(sink: Arc<DiagnosticsSink>, surface: Box<dyn OperatorSurface>) -> Self {
        Self { sink, surface }
    }

    /// Run `body`, converting a panic into exactly one reported fault.
    pub fn run<T, F>(&self, body: F) -> Outcome<T>
    where
        F: FnOnce() -> T,
    {
        install_hook();

        let result = {
            let _guard = Guarded::enter();
            panic::catch_unwind(AssertUnwindSafe(body))
        };

        match result {
            Ok(value) => Outcome::Completed(value),
            Err(payload) => {
                let report = CAPTURED
                    .with(|slot| slot.borrow_mut().take())
                    .unwrap_or_else(|| TerminalReport {
                        message: panic_message(&*payload),
                        location: None,
                        backtrace: String::new(),
                    });
                self.report(&report);
                Outcome::Faulted(report)
            }
        }
    }

    fn report(&self, report: &TerminalReport) {
        let reported = panic::catch_unwind(AssertUnwindSafe(|| {
            let location = report.location.clone().unwrap_or_else(|| "unknown".to_string());
            self.sink.write(
                LogLevel::Error,
                &format!("uncaught fault: {}", report.message),
                &[("location", location)],
            );
            if !report.backtrace.is_empty() {
                self.sink
                    .write(LogLevel::Error, &format!("backtrace:\n{}", report.backtrace), &[]);
            }
            self.sink.flush();

            if let Err(e) = self.surface.show("tether crashed", &report.to_string()) {
                let _ = writeln!(io::stderr(), "tether: could not show crash report: {}", e);
            }
        }));

        if let Err(payload) = reported {
            let _ = writeln!(
                io::stderr(),
                "tether: panic while reporting a crash: {}\n{}",
                panic_message(&*payload),
                report
            );
        }
    }
}

/// Marks the current thread as guarded for its lifetime.
struct Guarded {
    was: bool,
}

impl Guarded {
    fn enter() -> Self {
        CAPTURED.with(|slot| slot.borrow_mut().take());
        Self {
            was: GUARDED.with(|g| g.replace(true)),
        }
    }
}

impl Drop for Guarded {
    fn drop(&mut self) {
        let was = self.was;
        GUARDED.with(|g| g.set(was));
    }
}

fn install_hook() {
    HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let guarded = GUARDED.try_with(Cell::get).unwrap_or(false);
            if !guarded {
                previous(info);
                return;
            }
            let report = capture(info);
            let _ = CAPTURED.try_with(|slot| {
                if let Ok(mut slot) = slot.try_borrow_mut() {
                    // A panic during unwinding would replace the original.
                    if slot.is_none() {
                        *slot = Some(report);
                    }
                }
            });
        }));
    });
}

fn capture(info: &PanicHookInfo<'_>) -> TerminalReport {
    TerminalReport {
        message: panic_message(info.payload()),
        location: info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column())),
        backtrace: Backtrace::force_capture().to_string(),
    }
}
