//! Front-ends: the terminal dashboard and the headless stand-in.
//!
//! Both run on the blocking pool and return when the operator closes the
//! window or the shared signal fires.

use std::io::{self, stdout, Stdout};
use std::time::{Duration, Instant};

use crossterm::event::{self, Event as TermEvent, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen,
};
use ratatui::{backend::CrosstermBackend, Terminal};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;

use crate::orchestrator::FrontEnd;
use crate::render::Dashboard;
use crate::{ui, Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Job statuses change without events (e.g. idle jobs), so redraw at least this often.
const REFRESH_INTERVAL: Duration = Duration::from_secs(1);

/// What a key press asks the dashboard to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Quit,
    Next,
    Prev,
    Start,
    Stop,
}

pub fn action_for(key: KeyEvent) -> Option<Action> {
    if key.kind != KeyEventKind::Press {
        return None;
    }
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(Action::Quit),
        KeyCode::Char('q') | KeyCode::Esc => Some(Action::Quit),
        KeyCode::Char('j') | KeyCode::Down => Some(Action::Next),
        KeyCode::Char('k') | KeyCode::Up => Some(Action::Prev),
        KeyCode::Char('s') => Some(Action::Start),
        KeyCode::Char('x') => Some(Action::Stop),
        _ => None,
    }
}

pub struct TuiFrontEnd {
    dashboard: Dashboard,
}

impl TuiFrontEnd {
    pub fn new(dashboard: Dashboard) -> Self {
        Self { dashboard }
    }
}

impl FrontEnd for TuiFrontEnd {
    fn run(self: Box<Self>, destroy: CancellationToken) -> Result<()> {
        let runtime = Handle::try_current().map_err(|e| Error::FrontEnd(e.to_string()))?;
        let mut dashboard = self.dashboard;

        let mut session = TerminalSession::enter()?;
        tracing::debug!("dashboard opened");
        let result = event_loop(&mut session.terminal, &mut dashboard, &runtime, &destroy);
        drop(session);

        match &result {
            Ok(()) if destroy.is_cancelled() => tracing::debug!("dashboard destroyed"),
            Ok(()) => tracing::info!("dashboard closed by operator"),
            Err(e) => tracing::error!(error = %e, "dashboard failed"),
        }
        result
    }
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    dashboard: &mut Dashboard,
    runtime: &Handle,
    destroy: &CancellationToken,
) -> Result<()> {
    let mut dirty = true;
    let mut last_draw = Instant::now();

    while !destroy.is_cancelled() {
        dirty |= dashboard.drain_events();
        if dirty || last_draw.elapsed() >= REFRESH_INTERVAL {
            let state = dashboard.snapshot();
            terminal.draw(|f| ui::draw(f, &state))?;
            last_draw = Instant::now();
            dirty = false;
        }

        if !event::poll(POLL_INTERVAL)? {
            continue;
        }
        let TermEvent::Key(key) = event::read()? else {
            dirty = true;
            continue;
        };
        let Some(action) = action_for(key) else {
            continue;
        };
        dirty = true;

        match action {
            Action::Quit => return Ok(()),
            Action::Next => dashboard.select_next(),
            Action::Prev => dashboard.select_prev(),
            Action::Start | Action::Stop => {
                let Some(name) = dashboard.snapshot().selected_job().map(|j| j.name.clone()) else {
                    continue;
                };
                let jobs = dashboard.jobs().clone();
                if action == Action::Start {
                    let _guard = runtime.enter();
                    if let Err(e) = jobs.start(&name) {
                        tracing::warn!(job = %name, error = %e, "could not start job");
                    }
                } else {
                    runtime.spawn(async move {
                        if let Err(e) = jobs.stop(&name).await {
                            tracing::warn!(job = %name, error = %e, "could not stop job");
                        }
                    });
                }
            }
        }
    }
    Ok(())
}

/// Raw mode plus alternate screen, undone on drop so unwinding restores the
/// terminal too.
struct TerminalSession {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalSession {
    fn enter() -> Result<Self> {
        enable_raw_mode()?;
        let terminal = match Terminal::new(CrosstermBackend::new(stdout())) {
            Ok(terminal) => terminal,
            Err(e) => {
                let _ = disable_raw_mode();
                return Err(e.into());
            }
        };
        let mut session = Self { terminal };
        execute!(io::stdout(), EnterAlternateScreen)?;
        session.terminal.hide_cursor()?;
        session.terminal.clear()?;
        Ok(session)
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        let _ = self.terminal.show_cursor();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
        let _ = disable_raw_mode();
    }
}

/// No window: blocks until the shared signal fires.
#[derive(Debug, Default)]
pub struct HeadlessFrontEnd;

impl FrontEnd for HeadlessFrontEnd {
    fn run(self: Box<Self>, destroy: CancellationToken) -> Result<()> {
        tracing::info!("running headless");
        futures::executor::block_on(destroy.cancelled());
        Ok(())
    }
}
