//! Job manager for background automation.
//!
//! Every job runs as its own tokio task with its own cancellation token.
//! Lifecycle changes are published on the [`EventBus`]. [`JobManager::stop_all`]
//! is what the orchestrator calls during shutdown: it cancels every running
//! job and waits at most `grace` before aborting the stragglers.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use serde::Serialize;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::JobConfig;
use crate::event::{EventBus, EventKind};
use crate::orchestrator::JobControl;
use crate::util::panic_message;
use crate::{Error, Result};

/// A unit of background work.
///
/// Implementations must return promptly once `token` is cancelled.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, token: CancellationToken) -> Result<()>;
}

/// Closure-backed [`Job`].
pub struct JobFn<F> {
    f: F,
}

impl<F, Fut> JobFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    pub fn arc(f: F) -> Arc<dyn Job> {
        Arc::new(Self { f })
    }
}

#[async_trait]
impl<F, Fut> Job for JobFn<F>
where
    F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(&self, token: CancellationToken) -> Result<()> {
        (self.f)(token).await
    }
}

/// Runs an external program; the process is killed when the job is stopped.
pub struct CommandJob {
    program: String,
    args: Vec<String>,
}

impl CommandJob {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Job for CommandJob {
    async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(Error::CommandFailed {
                        command: self.program.clone(),
                        status: status.to_string(),
                    })
                }
            }
            _ = token.cancelled() => {
                child.kill().await?;
                Ok(())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Running,
    Finished,
    Failed(String),
    Stopped,
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Finished => "finished",
            JobStatus::Failed(_) => "failed",
            JobStatus::Stopped => "stopped",
        }
    }
}

/// Snapshot of one job for the control server and the dashboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobView {
    pub name: String,
    pub status: JobStatus,
}

struct RunningJob {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

struct JobEntry {
    job: Arc<dyn Job>,
    autostart: bool,
    status: JobStatus,
    running: Option<RunningJob>,
}

type JobTable = Arc<Mutex<BTreeMap<String, JobEntry>>>;

pub struct JobManager {
    bus: Arc<EventBus>,
    grace: Duration,
    jobs: JobTable,
    /// Set by `stop_all`; no job starts afterwards.
    closing: AtomicBool,
}

impl JobManager {
    pub fn new(bus: Arc<EventBus>, grace: Duration) -> Self {
        Self {
            bus,
            grace,
            jobs: Arc::new(Mutex::new(BTreeMap::new())),
            closing: AtomicBool::new(false),
        }
    }

    /// Build a manager holding one [`CommandJob`] per configured job.
    pub fn from_config(bus: Arc<EventBus>, grace: Duration, configs: Vec<JobConfig>) -> Self {
        let manager = Self::new(bus, grace);
        for cfg in configs {
            let job = Arc::new(CommandJob::new(cfg.command, cfg.args));
            manager.insert(cfg.name, job, cfg.autostart);
        }
        manager
    }

    pub fn add(&self, name: impl Into<String>, job: Arc<dyn Job>) {
        self.insert(name.into(), job, false);
    }

    fn insert(&self, name: String, job: Arc<dyn Job>, autostart: bool) {
        tracing::debug!(job = %name, autostart, "job registered");
        self.lock().insert(
            name,
            JobEntry {
                job,
                autostart,
                status: JobStatus::Idle,
                running: None,
            },
        );
    }

    pub fn start(&self, name: &str) -> Result<()> {
        let mut jobs = self.lock();
        let entry = jobs
            .get_mut(name)
            .ok_or_else(|| Error::JobNotFound(name.to_string()))?;
        // Checked under the table lock so a start cannot slip past stop_all.
        if self.closing.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown(name.to_string()));
        }
        if entry
            .running
            .as_ref()
            .is_some_and(|running| !running.handle.is_finished())
        {
            return Err(Error::JobAlreadyRunning(name.to_string()));
        }

        let token = CancellationToken::new();
        entry.status = JobStatus::Running;
        let handle = tokio::spawn(run_job(
            name.to_string(),
            Arc::clone(&entry.job),
            token.clone(),
            Arc::clone(&self.jobs),
            Arc::clone(&self.bus),
        ));
        entry.running = Some(RunningJob { token, handle });
        tracing::info!(job = %name, "job started");
        Ok(())
    }

    /// Start every job marked `autostart`. Failures are logged, not returned.
    pub fn start_autostart(&self) {
        let names: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, entry)| entry.autostart)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Err(e) = self.start(&name) {
                tracing::warn!(job = %name, error = %e, "autostart failed");
            }
        }
    }

    /// Stop one job, waiting at most `grace` for it to wind down.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let running = {
            let mut jobs = self.lock();
            let entry = jobs
                .get_mut(name)
                .ok_or_else(|| Error::JobNotFound(name.to_string()))?;
            entry.running.take()
        };

        if let Some(running) = running {
            running.token.cancel();
            let abort = running.handle.abort_handle();
            if tokio::time::timeout(self.grace, running.handle).await.is_err() {
                tracing::warn!(job = %name, grace = ?self.grace, "job ignored stop request, aborting");
                abort.abort();
                self.mark_stopped(&[name.to_string()]);
            }
        }
        Ok(())
    }

    /// Cancel every running job and wait at most `grace` for all of them.
    /// Further `start` calls are refused from here on.
    pub async fn stop_all(&self) {
        let running: Vec<(String, RunningJob)> = {
            let mut jobs = self.lock();
            self.closing.store(true, Ordering::SeqCst);
            jobs.iter_mut()
                .filter_map(|(name, entry)| entry.running.take().map(|r| (name.clone(), r)))
                .collect()
        };

        if running.is_empty() {
            tracing::debug!("no running jobs to stop");
            return;
        }
        tracing::info!(count = running.len(), "stopping all jobs");

        let mut names = Vec::with_capacity(running.len());
        let mut aborts = Vec::with_capacity(running.len());
        let mut handles = Vec::with_capacity(running.len());
        for (name, job) in running {
            job.token.cancel();
            aborts.push(job.handle.abort_handle());
            handles.push(job.handle);
            names.push(name);
        }

        if tokio::time::timeout(self.grace, join_all(handles))
            .await
            .is_err()
        {
            tracing::warn!(grace = ?self.grace, "jobs did not stop within grace, aborting");
            for abort in aborts {
                abort.abort();
            }
            self.mark_stopped(&names);
        }
    }

    pub fn statuses(&self) -> Vec<JobView> {
        self.lock()
            .iter()
            .map(|(name, entry)| JobView {
                name: name.clone(),
                status: entry.status.clone(),
            })
            .collect()
    }

    pub fn status(&self, name: &str) -> Option<JobStatus> {
        self.lock().get(name).map(|entry| entry.status.clone())
    }

    fn mark_stopped(&self, names: &[String]) {
        let mut jobs = self.lock();
        for name in names {
            if let Some(entry) = jobs.get_mut(name) {
                if entry.status == JobStatus::Running {
                    entry.status = JobStatus::Stopped;
                }
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, JobEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn run_job(
    name: String,
    job: Arc<dyn Job>,
    token: CancellationToken,
    jobs: JobTable,
    bus: Arc<EventBus>,
) {
    bus.publish(EventKind::JobStarted { job: name.clone() });

    let result = match AssertUnwindSafe(job.run(token.clone())).catch_unwind().await {
        Ok(result) => result,
        Err(payload) => Err(Error::TaskPanicked {
            task: name.clone(),
            message: panic_message(&*payload),
        }),
    };

    let (status, event) = match result {
        _ if token.is_cancelled() => (JobStatus::Stopped, EventKind::JobStopped { job: name.clone() }),
        Ok(()) => (JobStatus::Finished, EventKind::JobFinished { job: name.clone() }),
        Err(e) => {
            tracing::warn!(job = %name, error = %e, "job failed");
            (
                JobStatus::Failed(e.to_string()),
                EventKind::JobFailed {
                    job: name.clone(),
                    error: e.to_string(),
                },
            )
        }
    };

    if let Some(entry) = jobs
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .get_mut(&name)
    {
        entry.status = status;
    }
    bus.publish(event);
}

#[async_trait]
impl JobControl for JobManager {
    async fn stop_all(&self) {
        JobManager::stop_all(self).await;
    }
}
