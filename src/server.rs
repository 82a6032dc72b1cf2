//! HTTP control server.
//!
//! Exposes health and job lifecycle routes over axum. `listen` is not
//! cancellation-aware: it serves until [`ControlServer::stop`] asks it to
//! return.

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::jobs::{JobManager, JobView};
use crate::orchestrator::ControlSurface;
use crate::{Error, Result};

#[derive(Clone)]
struct AppState {
    jobs: Arc<JobManager>,
}

pub fn router(jobs: Arc<JobManager>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/{name}/start", post(start_job))
        .route("/api/jobs/{name}/stop", post(stop_job))
        .with_state(AppState { jobs })
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_jobs(State(st): State<AppState>) -> Json<Vec<JobView>> {
    Json(st.jobs.statuses())
}

async fn start_job(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> std::result::Result<Json<JobView>, AppError> {
    st.jobs.start(&name)?;
    Ok(Json(view(&st.jobs, name)?))
}

async fn stop_job(
    State(st): State<AppState>,
    Path(name): Path<String>,
) -> std::result::Result<Json<JobView>, AppError> {
    st.jobs.stop(&name).await?;
    Ok(Json(view(&st.jobs, name)?))
}

fn view(jobs: &JobManager, name: String) -> Result<JobView> {
    let status = jobs
        .status(&name)
        .ok_or_else(|| Error::JobNotFound(name.clone()))?;
    Ok(JobView { name, status })
}

#[derive(Debug)]
pub struct AppError(Error);

impl From<Error> for AppError {
    fn from(value: Error) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::JobAlreadyRunning(_) => StatusCode::CONFLICT,
            Error::ShuttingDown(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "request failed");
        } else {
            tracing::debug!(error = %self.0, "request rejected");
        }
        let body = Json(serde_json::json!({
            "error": self.0.to_string()
        }));
        (status, body).into_response()
    }
}

pub struct ControlServer {
    jobs: Arc<JobManager>,
    host: String,
    grace: Duration,
    stop: CancellationToken,
    /// Fired when graceful shutdown overruns `grace`; `listen` drops the
    /// server and its open connections.
    kill: CancellationToken,
    bound: watch::Sender<Option<SocketAddr>>,
}

impl ControlServer {
    pub fn new(jobs: Arc<JobManager>, host: impl Into<String>, grace: Duration) -> Self {
        Self {
            jobs,
            host: host.into(),
            grace,
            stop: CancellationToken::new(),
            kill: CancellationToken::new(),
            bound: watch::Sender::new(None),
        }
    }

    /// Address `listen` is currently serving on.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound.borrow()
    }

    /// Wait until `listen` has bound its socket.
    pub async fn wait_until_bound(&self) -> SocketAddr {
        let mut rx = self.bound.subscribe();
        loop {
            if let Some(addr) = *rx.borrow_and_update() {
                return addr;
            }
            // The sender lives in `self`, so the channel cannot close here.
            let _ = rx.changed().await;
        }
    }

    pub async fn listen(&self, port: u16) -> Result<()> {
        let addr = format!("{}:{}", self.host, port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "control server listening");
        self.bound.send_replace(Some(local));

        let serve = axum::serve(listener, router(Arc::clone(&self.jobs)))
            .with_graceful_shutdown(self.stop.clone().cancelled_owned())
            .into_future();

        let served = tokio::select! {
            served = serve => served.map_err(Error::Serve),
            _ = self.kill.cancelled() => {
                tracing::warn!(addr = %local, "connections still open after grace, dropping them");
                Ok(())
            }
        };

        self.bound.send_replace(None);
        tracing::info!(addr = %local, "control server stopped");
        served
    }

    /// Request shutdown and wait up to the grace period for `listen` to
    /// return. A server that never started stops immediately.
    ///
    /// If connections keep `listen` busy past the grace period the server is
    /// dropped outright and `ShutdownTimeout` is returned.
    pub async fn stop(&self) -> Result<()> {
        self.stop.cancel();
        if self.wait_until_unbound().await {
            return Ok(());
        }

        self.kill.cancel();
        if !self.wait_until_unbound().await {
            tracing::error!("control server did not return after being dropped");
        }
        Err(Error::ShutdownTimeout {
            component: "control server",
            grace: self.grace,
        })
    }

    /// True once `listen` is not serving, waiting at most `grace`.
    async fn wait_until_unbound(&self) -> bool {
        let mut rx = self.bound.subscribe();
        let unbound = tokio::time::timeout(self.grace, rx.wait_for(Option::is_none))
            .await
            .is_ok_and(|changed| changed.is_ok());
        unbound
    }
}

#[async_trait]
impl ControlSurface for ControlServer {
    async fn listen(&self, port: u16) -> Result<()> {
        ControlServer::listen(self, port).await
    }

    async fn stop(&self) -> Result<()> {
        ControlServer::stop(self).await
    }
}
