//! # Orchestrator: starts every subsystem and tears them down together.
//!
//! ```text
//! run(root):
//!   token = root.child_token()
//!   integrations: [(enabled?, build)] ──► build all enabled ──► any Err ──► Error::Init, nothing started
//!                                                  └─► register handlers on the event bus
//!
//!   TaskGroup(token)
//!     ├─ front-end        (blocking pool; return cancels token)
//!     ├─ notifier × N     start(token)
//!     ├─ control-server   listen(port)   (return cancels token)
//!     ├─ event-bus        listen(token)  (return cancels token)
//!     ├─ signals          (optional; SIGINT/SIGTERM/SIGQUIT cancel token)
//!     └─ shutdown         token.cancelled() ──► jobs.stop_all() ──► server.stop()
//!
//!   group.wait() ──► first error, or Ok(())
//! ```
//!
//! The collaborators are reached only through the traits below, so the
//! orchestrator never sees a concrete server, bus or window.

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DEFAULT_PORT;
use crate::event::EventHandler;
use crate::group::TaskGroup;
use crate::{signals, util, Error, Result};

/// Owner of background jobs.
#[async_trait]
pub trait JobControl: Send + Sync {
    /// Stop every job. Bounded; never fails.
    async fn stop_all(&self);
}

/// The control/HTTP surface.
#[async_trait]
pub trait ControlSurface: Send + Sync {
    /// Serve until [`ControlSurface::stop`] is called.
    async fn listen(&self, port: u16) -> Result<()>;
    /// Ask `listen` to return and wait (bounded) until it has.
    async fn stop(&self) -> Result<()>;
}

/// Fan-out of internal events.
#[async_trait]
pub trait EventSource: Send + Sync {
    fn register(&self, handler: Arc<dyn EventHandler>);
    /// Dispatch until `token` fires.
    async fn listen(&self, token: CancellationToken) -> Result<()>;
}

/// The operator's window.
pub trait FrontEnd: Send + 'static {
    /// Blocks until the operator closes the window or `destroy` fires.
    fn run(self: Box<Self>, destroy: CancellationToken) -> Result<()>;
}

/// A remote notification integration.
#[async_trait]
pub trait Notifier: Send + 'static {
    fn name(&self) -> &'static str;
    /// Handler fed by the event bus.
    fn handler(&self) -> Arc<dyn EventHandler>;
    /// Deliver notifications until `token` fires.
    async fn start(self: Box<Self>, token: CancellationToken) -> Result<()>;
}

pub type NotifierBuilder = Box<dyn FnOnce() -> Result<Box<dyn Notifier>> + Send>;

/// One optional integration: built and started only when `enabled`.
pub struct IntegrationSpec {
    pub name: &'static str,
    pub enabled: bool,
    pub build: NotifierBuilder,
}

impl IntegrationSpec {
    pub fn new<F>(name: &'static str, enabled: bool, build: F) -> Self
    where
        F: FnOnce() -> Result<Box<dyn Notifier>> + Send + 'static,
    {
        Self {
            name,
            enabled,
            build: Box::new(build),
        }
    }
}

pub struct Orchestrator {
    port: u16,
    handle_signals: bool,
    jobs: Arc<dyn JobControl>,
    server: Arc<dyn ControlSurface>,
    bus: Arc<dyn EventSource>,
    front_end: Box<dyn FrontEnd>,
    integrations: Vec<IntegrationSpec>,
}

impl Orchestrator {
    pub fn new(
        jobs: Arc<dyn JobControl>,
        server: Arc<dyn ControlSurface>,
        bus: Arc<dyn EventSource>,
        front_end: Box<dyn FrontEnd>,
    ) -> Self {
        Self {
            port: DEFAULT_PORT,
            handle_signals: false,
            jobs,
            server,
            bus,
            front_end,
            integrations: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Also cancel on SIGINT/SIGTERM/SIGQUIT (Ctrl-C elsewhere).
    pub fn with_signals(mut self, enabled: bool) -> Self {
        self.handle_signals = enabled;
        self
    }

    /// Append an optional integration. Integrations are built in the order
    /// they were added.
    pub fn with_integration(mut self, spec: IntegrationSpec) -> Self {
        self.integrations.push(spec);
        self
    }

    /// Run every subsystem until the first failure or shutdown request,
    /// then tear everything down. Cancelling `root` is an external
    /// termination request.
    pub async fn run(self, root: CancellationToken) -> Result<()> {
        let notifiers = build_integrations(self.integrations)?;
        for notifier in &notifiers {
            self.bus.register(notifier.handler());
        }

        let token = root.child_token();
        let mut group = TaskGroup::new(token.clone());

        let front_end = self.front_end;
        let destroy = token.clone();
        group.spawn_closing("front-end", async move {
            util::blocking("front-end", move || front_end.run(destroy)).await
        });

        for notifier in notifiers {
            let token = token.clone();
            group.spawn(notifier.name(), async move { notifier.start(token).await });
        }

        let server = Arc::clone(&self.server);
        let port = self.port;
        group.spawn_closing("control-server", async move { server.listen(port).await });

        let bus = Arc::clone(&self.bus);
        let bus_token = token.clone();
        group.spawn_closing("event-bus", async move { bus.listen(bus_token).await });

        if self.handle_signals {
            group.spawn("signals", signals::cancel_on_signal(token.clone()));
        }

        group.spawn(
            "shutdown",
            shutdown(token.clone(), Arc::clone(&self.jobs), Arc::clone(&self.server)),
        );

        tracing::info!(tasks = group.len(), port = self.port, "tether running");
        let result = group.wait().await;
        match &result {
            Ok(()) => tracing::info!("tether stopped"),
            Err(e) => tracing::error!(error = %e, "tether stopped with an error"),
        }
        result
    }
}

/// Build every enabled integration, in order. The first failure aborts
/// startup before any task exists.
fn build_integrations(specs: Vec<IntegrationSpec>) -> Result<Vec<Box<dyn Notifier>>> {
    let mut built = Vec::new();
    for spec in specs {
        if !spec.enabled {
            tracing::debug!(integration = spec.name, "integration disabled");
            continue;
        }
        match (spec.build)() {
            Ok(notifier) => {
                tracing::info!(integration = spec.name, "integration initialized");
                built.push(notifier);
            }
            Err(e) => {
                tracing::error!(integration = spec.name, error = %e, "integration could not be initialized");
                return Err(match e {
                    Error::Init { .. } => e,
                    other => Error::Init {
                        integration: spec.name.to_string(),
                        reason: other.to_string(),
                    },
                });
            }
        }
    }
    Ok(built)
}

async fn shutdown(
    token: CancellationToken,
    jobs: Arc<dyn JobControl>,
    server: Arc<dyn ControlSurface>,
) -> Result<()> {
    token.cancelled().await;
    tracing::info!("tether shutting down");

    // Jobs may still need the control server while they wind down.
    jobs.stop_all().await;
    server.stop().await.inspect_err(|e| {
        tracing::error!(error = %e, "error stopping control server");
    })
}
