//! Error-aggregation group.
//!
//! A [`TaskGroup`] runs tasks concurrently against one shared
//! [`CancellationToken`]:
//!
//! ```text
//!   spawn(name, fut) ──► JoinSet ──► fut returns Err ──► record (first wins) ──► token.cancel()
//!   spawn_closing(..) ─► JoinSet ──► fut returns     ──► record if Err       ──► token.cancel()
//!
//!   wait() ──► join every task ──► first recorded error, or Ok(())
//! ```
//!
//! An error is always recorded before the token fires, so whichever task
//! fails first owns the terminal result. A panic inside a task is caught at
//! the task boundary and becomes [`Error::TaskPanicked`].

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::util::panic_message;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnReturn {
    CancelOnError,
    CancelAlways,
}

pub struct TaskGroup {
    token: CancellationToken,
    set: JoinSet<()>,
    first_error: Arc<Mutex<Option<Error>>>,
}

impl TaskGroup {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            set: JoinSet::new(),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// The shared signal. Tasks may observe it; only the group and the
    /// orchestrator fire it.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Tasks registered and not yet joined.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.set.len()
    }

    /// Register a task that cancels the group only if it fails.
    pub fn spawn<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_inner(name.into(), fut, OnReturn::CancelOnError);
    }

    /// Register a task whose return, successful or not, cancels the group.
    pub fn spawn_closing<F>(&mut self, name: impl Into<String>, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_inner(name.into(), fut, OnReturn::CancelAlways);
    }

    fn spawn_inner<F>(&mut self, name: String, fut: F, on_return: OnReturn)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        tracing::debug!(task = %name, "registering task");

        let token = self.token.clone();
        let first_error = Arc::clone(&self.first_error);
        self.set.spawn(async move {
            let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(Error::TaskPanicked {
                    task: name.clone(),
                    message: panic_message(&*payload),
                }),
            };

            match outcome {
                Err(err) => {
                    record(&first_error, &name, err);
                    token.cancel();
                }
                Ok(()) if on_return == OnReturn::CancelAlways => {
                    if !token.is_cancelled() {
                        tracing::info!(task = %name, "task finished, requesting shutdown");
                    }
                    token.cancel();
                }
                Ok(()) => {}
            }
            tracing::debug!(task = %name, "task returned");
        });
    }

    /// Wait for every task and yield the terminal result.
    pub async fn wait(mut self) -> Result<()> {
        while let Some(joined) = self.set.join_next().await {
            // Panics are caught inside the task, so only an abort lands here.
            if let Err(e) = joined {
                record(&self.first_error, "unknown", Error::TaskJoin(e.to_string()));
                self.token.cancel();
            }
        }

        let first = self
            .first_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

fn record(slot: &Mutex<Option<Error>>, task: &str, err: Error) {
    let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if slot.is_none() {
        tracing::debug!(task = %task, error = %err, "task failed, cancelling peers");
        *slot = Some(err);
    } else {
        tracing::debug!(task = %task, error = %err, "later task error ignored");
    }
}
