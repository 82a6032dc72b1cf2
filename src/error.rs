use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("{integration} could not be initialized: {reason}")]
    Init { integration: String, reason: String },

    #[error("Task {task} panicked: {message}")]
    TaskPanicked { task: String, message: String },

    #[error("Could not listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Control server failed: {0}")]
    Serve(std::io::Error),

    #[error("{component} did not stop within {grace:?}")]
    ShutdownTimeout {
        component: &'static str,
        grace: Duration,
    },

    #[error("Front-end error: {0}")]
    FrontEnd(String),

    #[error("Event bus is already being listened to")]
    ListenerTaken,

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already running: {0}")]
    JobAlreadyRunning(String),

    #[error("Jobs are shutting down, not starting {0}")]
    ShuttingDown(String),

    #[error("{command} exited with {status}")]
    CommandFailed { command: String, status: String },
}

impl Error {
    /// True when the error came from a socket that was already bound.
    pub fn is_addr_in_use(&self) -> bool {
        matches!(
            self,
            Error::Bind { source, .. } if source.kind() == std::io::ErrorKind::AddrInUse
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
