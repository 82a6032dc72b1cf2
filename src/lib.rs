pub mod config;
pub mod error;
pub mod log;
pub mod util;

// Supervision core
pub mod barrier;
pub mod group;
pub mod orchestrator;
pub mod signals;

// Collaborators
pub mod event;
pub mod jobs;
pub mod notify;
pub mod server;

// Front-end and wiring
pub mod app;
pub mod frontend;
pub mod render;
pub mod ui;

pub use error::{Error, Result};
pub use orchestrator::{
    ControlSurface, EventSource, FrontEnd, IntegrationSpec, JobControl, Notifier, Orchestrator,
};
