//! Diagnostics sink and panic barrier behaviour at process level.

use std::fs;
use std::sync::Arc;
use std::thread;

use tether::barrier::{Outcome, PanicBarrier};
use tether::log::{DiagnosticsSink, LogLevel};

use crate::fixtures::RecordingSurface;

fn read_log(sink: &DiagnosticsSink) -> String {
    fs::read_to_string(sink.log_path().expect("no log file attached")).unwrap()
}

/// Test: Flush never loses writes
/// Given several threads writing and flushing concurrently
/// When a final flush completes
/// Then every line written before it is in the log file, exactly once
#[test]
fn test_interleaved_flushes_keep_every_write() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(DiagnosticsSink::detached());
    sink.attach_file(dir.path()).unwrap();

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let sink = Arc::clone(&sink);
            thread::spawn(move || {
                for i in 0..250 {
                    sink.write(LogLevel::Info, &format!("writer-{t} line-{i}"), &[]);
                    if i % 7 == 0 {
                        sink.flush();
                    }
                }
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    sink.flush();
    sink.flush();

    let contents = read_log(&sink);
    for t in 0..4 {
        for i in 0..250 {
            let needle = format!("writer-{t} line-{i}\n");
            assert_eq!(contents.matches(&needle).count(), 1, "missing or duplicated: {needle}");
        }
    }
    assert_eq!(sink.pending(), 0);
}

/// Test: Fault before the orchestrator runs
/// Given a panic while starting up
/// When the barrier catches it
/// Then exactly one report is shown and logged, and earlier output is flushed
#[test]
fn test_startup_fault_is_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    let sink = Arc::new(DiagnosticsSink::detached());
    sink.write(LogLevel::Info, "before the log file existed", &[]);
    let surface = RecordingSurface::default();
    let barrier = PanicBarrier::new(Arc::clone(&sink), Box::new(surface.clone()));

    let outcome = barrier.run(|| -> tether::Result<()> {
        sink.attach_file(dir.path())?;
        sink.write(LogLevel::Info, "loading configuration", &[]);
        let ports: Vec<u16> = Vec::new();
        let _first = ports[0];
        Ok(())
    });

    let report = match outcome {
        Outcome::Faulted(report) => report,
        Outcome::Completed(_) => panic!("fault was not captured"),
    };
    assert!(report.message.contains("index out of bounds"));
    assert!(report.location.is_some());

    // The final flush main performs must not duplicate anything.
    sink.flush();

    let contents = read_log(&sink);
    assert!(contents.contains("before the log file existed"));
    assert!(contents.contains("loading configuration"));
    assert_eq!(contents.matches("uncaught fault").count(), 1);
    assert!(contents.contains("[ERROR]"));

    let shown = surface.0.lock().unwrap();
    assert_eq!(shown.len(), 1);
    assert!(shown[0].1.contains("index out of bounds"));
}

/// Test: Errors are not faults
/// Given a startup sequence that returns an error
/// When the barrier runs it
/// Then the error comes back as a completed outcome and no report is shown
#[test]
fn test_returned_error_is_not_a_fault() {
    let sink = Arc::new(DiagnosticsSink::detached());
    let surface = RecordingSurface::default();
    let barrier = PanicBarrier::new(Arc::clone(&sink), Box::new(surface.clone()));

    let outcome = barrier.run(|| -> tether::Result<()> {
        Err(tether::Error::Validation("server.port must not be 0".to_string()))
    });

    assert!(matches!(outcome, Outcome::Completed(Err(_))));
    assert!(surface.0.lock().unwrap().is_empty());
}
