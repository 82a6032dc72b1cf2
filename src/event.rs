//! Internal event bus.
//!
//! Publishers never block: [`EventBus::publish`] drops the event into a
//! `tokio::sync::broadcast` channel. [`EventBus::listen`] is the single
//! dispatcher that feeds registered [`EventHandler`]s until the shared
//! signal fires. Observers that want their own copy (the dashboard) call
//! [`EventBus::subscribe`].

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::EventSource;
use crate::util::panic_message;
use crate::{Error, Result};

const BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    JobStarted { job: String },
    JobFinished { job: String },
    JobFailed { job: String, error: String },
    JobStopped { job: String },
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::JobStarted { job } => write!(f, "job {} started", job),
            EventKind::JobFinished { job } => write!(f, "job {} finished", job),
            EventKind::JobFailed { job, error } => write!(f, "job {} failed: {}", job, error),
            EventKind::JobStopped { job } => write!(f, "job {} stopped", job),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
        }
    }
}

/// Receives every event dispatched by [`EventBus::listen`].
///
/// Called on the dispatcher task, so implementations must not block.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &Event);
}

impl<F> EventHandler for F
where
    F: Fn(&Event) + Send + Sync,
{
    fn handle(&self, event: &Event) {
        self(event)
    }
}

pub struct EventBus {
    tx: broadcast::Sender<Event>,
    listener_rx: Mutex<Option<broadcast::Receiver<Event>>>,
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        // The dispatcher's receiver exists from the start so nothing published
        // before listen() is lost.
        let (tx, rx) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            listener_rx: Mutex::new(Some(rx)),
            handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn publish(&self, kind: EventKind) {
        let _ = self.tx.send(Event::now(kind));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn register_handler(&self, handler: Arc<dyn EventHandler>) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Dispatch events to handlers until `token` fires.
    pub async fn listen(&self, token: CancellationToken) -> Result<()> {
        let mut rx = self
            .listener_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(Error::ListenerTaken)?;

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    tracing::debug!("event bus listener cancelled");
                    return Ok(());
                }
                received = rx.recv() => match received {
                    Ok(event) => self.dispatch(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "event bus listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    fn dispatch(&self, event: &Event) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for handler in handlers {
            // One misbehaving handler must not take the dispatcher down.
            if let Err(payload) =
                std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(event)))
            {
                tracing::warn!(panic = %panic_message(&*payload), "event handler panicked");
            }
        }
    }
}

#[async_trait]
impl EventSource for EventBus {
    fn register(&self, handler: Arc<dyn EventHandler>) {
        self.register_handler(handler);
    }

    async fn listen(&self, token: CancellationToken) -> Result<()> {
        EventBus::listen(self, token).await
    }
}
