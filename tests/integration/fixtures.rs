//! Test fixtures for integration tests.
//!
//! Provides fake collaborators that record what the orchestrator asks of
//! them, in order, into one shared [`CallLog`].

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use tether::barrier::OperatorSurface;
use tether::event::{Event, EventBus, EventHandler};
use tether::{
    ControlSurface, Error, FrontEnd, IntegrationSpec, JobControl, Notifier, Orchestrator, Result,
};

/// Upper bound for anything that is supposed to finish promptly.
pub const BOUND: Duration = Duration::from_secs(5);

/// Ordered record of collaborator calls shared by every fake.
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, call: impl Into<String>) {
        self.0.lock().unwrap().push(call.into());
    }

    pub fn calls(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn contains(&self, call: &str) -> bool {
        self.calls().iter().any(|c| c == call)
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    /// Panics unless `first` was recorded before `second`.
    pub fn assert_before(&self, first: &str, second: &str) {
        let calls = self.calls();
        let a = calls.iter().position(|c| c == first);
        let b = calls.iter().position(|c| c == second);
        match (a, b) {
            (Some(a), Some(b)) => assert!(a < b, "{first} must precede {second}: {calls:?}"),
            _ => panic!("expected both {first} and {second} in {calls:?}"),
        }
    }
}

pub struct FakeJobs {
    log: CallLog,
}

impl FakeJobs {
    pub fn new(log: &CallLog) -> Arc<Self> {
        Arc::new(Self { log: log.clone() })
    }
}

#[async_trait]
impl JobControl for FakeJobs {
    async fn stop_all(&self) {
        // Long enough that a concurrent server.stop() would be recorded first.
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.log.push("jobs.stop_all");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenBehavior {
    ServeUntilStopped,
    AddrInUse,
}

pub struct FakeServer {
    log: CallLog,
    listen: ListenBehavior,
    fail_stop: bool,
    stopped: CancellationToken,
}

impl FakeServer {
    pub fn new(log: &CallLog, listen: ListenBehavior) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            listen,
            fail_stop: false,
            stopped: CancellationToken::new(),
        })
    }

    pub fn failing_stop(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            log: log.clone(),
            listen: ListenBehavior::ServeUntilStopped,
            fail_stop: true,
            stopped: CancellationToken::new(),
        })
    }
}

pub fn addr_in_use() -> Error {
    Error::Bind {
        addr: "127.0.0.1:8087".to_string(),
        source: std::io::Error::from(std::io::ErrorKind::AddrInUse),
    }
}

#[async_trait]
impl ControlSurface for FakeServer {
    async fn listen(&self, _port: u16) -> Result<()> {
        self.log.push("server.listen");
        match self.listen {
            ListenBehavior::AddrInUse => Err(addr_in_use()),
            ListenBehavior::ServeUntilStopped => {
                self.stopped.cancelled().await;
                self.log.push("server.listen returned");
                Ok(())
            }
        }
    }

    async fn stop(&self) -> Result<()> {
        self.log.push("server.stop");
        self.stopped.cancel();
        if self.fail_stop {
            return Err(Error::ShutdownTimeout {
                component: "control server",
                grace: Duration::from_millis(1),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WindowBehavior {
    /// Stays open until destroyed.
    WaitForDestroy,
    /// Operator closes the window after the delay.
    CloseAfter(Duration),
    /// Fails after the delay.
    FailAfter(Duration),
    PanicAfter(Duration),
}

pub struct FakeFrontEnd {
    log: CallLog,
    behavior: WindowBehavior,
}

impl FakeFrontEnd {
    pub fn new(log: &CallLog, behavior: WindowBehavior) -> Box<Self> {
        Box::new(Self {
            log: log.clone(),
            behavior,
        })
    }
}

impl FrontEnd for FakeFrontEnd {
    fn run(self: Box<Self>, destroy: CancellationToken) -> Result<()> {
        self.log.push("front_end.run");
        let started = Instant::now();
        let deadline = match self.behavior {
            WindowBehavior::WaitForDestroy => None,
            WindowBehavior::CloseAfter(d)
            | WindowBehavior::FailAfter(d)
            | WindowBehavior::PanicAfter(d) => Some(d),
        };

        while !destroy.is_cancelled() {
            if deadline.is_some_and(|d| started.elapsed() >= d) {
                return match self.behavior {
                    WindowBehavior::FailAfter(_) => {
                        Err(Error::FrontEnd("window crashed".to_string()))
                    }
                    WindowBehavior::PanicAfter(_) => panic!("window exploded"),
                    _ => {
                        self.log.push("front_end.closed");
                        Ok(())
                    }
                };
            }
            thread::sleep(Duration::from_millis(2));
        }
        self.log.push("front_end.destroyed");
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierBehavior {
    RunUntilCancelled,
    FailAfter(Duration),
    /// Returns an error once cancelled, i.e. after some other task failed.
    FailOnCancel,
}

pub struct FakeNotifier {
    name: &'static str,
    log: CallLog,
    behavior: NotifierBehavior,
    seen: Arc<Mutex<Vec<Event>>>,
}

impl FakeNotifier {
    pub fn new(name: &'static str, log: &CallLog, behavior: NotifierBehavior) -> Self {
        Self {
            name,
            log: log.clone(),
            behavior,
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Events the notifier's handler has received so far.
    pub fn seen(&self) -> Arc<Mutex<Vec<Event>>> {
        Arc::clone(&self.seen)
    }
}

#[async_trait]
impl Notifier for FakeNotifier {
    fn name(&self) -> &'static str {
        self.name
    }

    fn handler(&self) -> Arc<dyn EventHandler> {
        let seen = Arc::clone(&self.seen);
        Arc::new(move |event: &Event| seen.lock().unwrap().push(event.clone()))
    }

    async fn start(self: Box<Self>, token: CancellationToken) -> Result<()> {
        self.log.push(format!("{}.start", self.name));
        match self.behavior {
            NotifierBehavior::RunUntilCancelled => {
                token.cancelled().await;
                Ok(())
            }
            NotifierBehavior::FailAfter(d) => {
                tokio::select! {
                    _ = token.cancelled() => Ok(()),
                    _ = tokio::time::sleep(d) => {
                        Err(Error::Validation(format!("{} lost its connection", self.name)))
                    }
                }
            }
            NotifierBehavior::FailOnCancel => {
                token.cancelled().await;
                Err(Error::Validation(format!("{} failed late", self.name)))
            }
        }
    }
}

/// Integration entry whose construction is recorded and succeeds or fails
/// as requested.
pub fn integration(name: &'static str, enabled: bool, builds: bool, log: &CallLog) -> IntegrationSpec {
    let log = log.clone();
    IntegrationSpec::new(name, enabled, move || {
        log.push(format!("{name}.build"));
        if builds {
            Ok(Box::new(FakeNotifier::new(name, &log, NotifierBehavior::RunUntilCancelled))
                as Box<dyn Notifier>)
        } else {
            Err(Error::Init {
                integration: name.to_string(),
                reason: "rejected credentials".to_string(),
            })
        }
    })
}

/// Integration entry wrapping an already built notifier.
pub fn prebuilt(notifier: FakeNotifier) -> IntegrationSpec {
    let name = notifier.name;
    IntegrationSpec::new(name, true, move || Ok(Box::new(notifier) as Box<dyn Notifier>))
}

/// Orchestrator over fakes plus a real event bus.
pub struct Harness {
    pub log: CallLog,
    pub bus: Arc<EventBus>,
    pub orchestrator: Orchestrator,
}

impl Harness {
    pub fn new(server: ListenBehavior, window: WindowBehavior) -> Self {
        let log = CallLog::default();
        Self::with_server(log.clone(), FakeServer::new(&log, server), window)
    }

    pub fn with_server(log: CallLog, server: Arc<FakeServer>, window: WindowBehavior) -> Self {
        let bus = Arc::new(EventBus::new());
        let orchestrator = Orchestrator::new(
            FakeJobs::new(&log),
            server,
            bus.clone(),
            FakeFrontEnd::new(&log, window),
        );
        Self {
            log,
            bus,
            orchestrator,
        }
    }

    pub fn integration(mut self, spec: IntegrationSpec) -> Self {
        self.orchestrator = self.orchestrator.with_integration(spec);
        self
    }

    /// Run to completion, failing the test if that takes longer than [`BOUND`].
    pub async fn run(self, root: CancellationToken) -> (Result<()>, CallLog, Arc<EventBus>) {
        let result = tokio::time::timeout(BOUND, self.orchestrator.run(root))
            .await
            .expect("orchestrator did not finish within bound");
        (result, self.log, self.bus)
    }
}

/// Operator surface that remembers every report shown.
#[derive(Clone, Default)]
pub struct RecordingSurface(pub Arc<Mutex<Vec<(String, String)>>>);

impl OperatorSurface for RecordingSurface {
    fn show(&self, title: &str, body: &str) -> Result<()> {
        self.0
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
        Ok(())
    }
}

/// A port nothing is listening on right now.
pub fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}
