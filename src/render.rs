//! Dashboard model and the immutable snapshots the UI draws from.
//!
//! [`Dashboard`] owns the mutable view state (selection, recent events) and
//! produces a [`DashboardState`] each frame. `ui::draw` only ever sees the
//! snapshot.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::TryRecvError};

use crate::event::{Event, EventKind};
use crate::jobs::{JobManager, JobView};

/// Events kept for the activity pane.
pub const RECENT_EVENTS: usize = 50;

static VERSION_COUNTER: AtomicU64 = AtomicU64::new(0);

pub fn next_version() -> u64 {
    VERSION_COUNTER.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventLine {
    pub at: DateTime<Utc>,
    pub text: String,
    pub failed: bool,
}

impl From<&Event> for EventLine {
    fn from(event: &Event) -> Self {
        Self {
            at: event.at,
            text: event.kind.to_string(),
            failed: matches!(event.kind, EventKind::JobFailed { .. }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DashboardState {
    pub version: u64,
    pub port: u16,
    pub jobs: Vec<JobView>,
    pub selected: usize,
    /// Newest first.
    pub events: Vec<EventLine>,
    /// Set when the bus dropped events because the dashboard fell behind.
    pub missed: u64,
}

impl DashboardState {
    pub fn selected_job(&self) -> Option<&JobView> {
        self.jobs.get(self.selected)
    }
}

pub struct Dashboard {
    jobs: Arc<JobManager>,
    events: broadcast::Receiver<Event>,
    recent: VecDeque<EventLine>,
    selected: usize,
    missed: u64,
    port: u16,
}

impl Dashboard {
    pub fn new(jobs: Arc<JobManager>, events: broadcast::Receiver<Event>, port: u16) -> Self {
        Self {
            jobs,
            events,
            recent: VecDeque::with_capacity(RECENT_EVENTS),
            selected: 0,
            missed: 0,
            port,
        }
    }

    pub fn jobs(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    /// Pull every pending event off the bus. Returns true if anything arrived.
    pub fn drain_events(&mut self) -> bool {
        let mut changed = false;
        loop {
            match self.events.try_recv() {
                Ok(event) => {
                    self.push(EventLine::from(&event));
                    changed = true;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    self.missed += skipped;
                    changed = true;
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        changed
    }

    fn push(&mut self, line: EventLine) {
        if self.recent.len() == RECENT_EVENTS {
            self.recent.pop_back();
        }
        self.recent.push_front(line);
    }

    pub fn select_next(&mut self) {
        let count = self.jobs.statuses().len();
        if count > 0 {
            self.selected = (self.selected + 1).min(count - 1);
        }
    }

    pub fn select_prev(&mut self) {
        self.selected = self.selected.saturating_sub(1);
    }

    pub fn snapshot(&mut self) -> DashboardState {
        let jobs = self.jobs.statuses();
        self.selected = self.selected.min(jobs.len().saturating_sub(1));
        DashboardState {
            version: next_version(),
            port: self.port,
            jobs,
            selected: self.selected,
            events: self.recent.iter().cloned().collect(),
            missed: self.missed,
        }
    }
}
