//! Terminal dashboard rendering.
//!
//! Minimal chrome: no borders, whitespace for structure, grayscale plus a
//! status color per job. Renders from [`DashboardState`] only and never
//! touches application state.

use ratatui::{
    layout::{Constraint, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::Paragraph,
    Frame,
};

use crate::jobs::{JobStatus, JobView};
use crate::render::{DashboardState, EventLine};

const COLOR_TEXT_DIMMED: Color = Color::Gray;
const COLOR_TEXT_MUTED: Color = Color::DarkGray;
const COLOR_SEPARATOR: Color = Color::White;

const COLOR_STATUS_RUNNING: Color = Color::Green;
const COLOR_STATUS_FINISHED: Color = Color::Cyan;
const COLOR_STATUS_FAILED: Color = Color::Red;
const COLOR_STATUS_STOPPED: Color = Color::Yellow;

const NAME_WIDTH: usize = 24;
const STATUS_WIDTH: usize = 10;
const SPACING: usize = 2;

/// A single keybinding entry for display.
struct Keybinding(&'static str, &'static str);

const KEYMAP: &[&[Keybinding]] = &[
    &[Keybinding("j/k", "select")],
    &[Keybinding("s", "start"), Keybinding("x", "stop")],
    &[Keybinding("q", "quit")],
];

pub fn draw(frame: &mut Frame, state: &DashboardState) {
    let area = frame.area();
    if area.height < 4 {
        frame.render_widget(Paragraph::new(header_line(state)), area);
        return;
    }

    let jobs_height = (state.jobs.len().max(1) as u16 + 1).min(area.height / 2);
    let chunks = Layout::vertical([
        Constraint::Length(1),
        Constraint::Length(jobs_height),
        Constraint::Length(1),
        Constraint::Fill(1),
        Constraint::Length(1),
    ])
    .split(area);

    frame.render_widget(Paragraph::new(header_line(state)), chunks[0]);
    render_jobs(frame, state, chunks[1]);
    render_separator(frame, chunks[2]);
    render_events(frame, state, chunks[3]);
    frame.render_widget(Paragraph::new(keymap_line()), chunks[4]);
}

fn header_line(state: &DashboardState) -> Line<'static> {
    let running = state
        .jobs
        .iter()
        .filter(|job| job.status == JobStatus::Running)
        .count();
    Line::from(vec![
        Span::styled("tether", Style::default().add_modifier(Modifier::BOLD)),
        Span::styled(
            format!("  control :{}  ", state.port),
            Style::default().fg(COLOR_TEXT_DIMMED),
        ),
        Span::styled(
            format!("{}/{} running", running, state.jobs.len()),
            Style::default().fg(COLOR_TEXT_MUTED),
        ),
    ])
}

fn render_jobs(frame: &mut Frame, state: &DashboardState, area: Rect) {
    let mut lines = vec![Line::from(Span::styled(
        format!(
            "{:<name$}{:spacing$}{:<status$}",
            "JOB",
            "",
            "STATUS",
            name = NAME_WIDTH,
            spacing = SPACING,
            status = STATUS_WIDTH
        ),
        Style::default().fg(COLOR_TEXT_MUTED),
    ))];

    if state.jobs.is_empty() {
        lines.push(Line::from(Span::styled(
            "no jobs configured",
            Style::default().fg(COLOR_TEXT_MUTED),
        )));
    }

    for (idx, job) in state.jobs.iter().enumerate() {
        lines.push(job_line(job, idx == state.selected));
    }

    frame.render_widget(Paragraph::new(lines), area);
}

fn job_line(job: &JobView, selected: bool) -> Line<'static> {
    let name_style = if selected {
        Style::default().add_modifier(Modifier::REVERSED)
    } else {
        Style::default()
    };
    let mut spans = vec![
        Span::styled(
            format!("{:<width$}", truncate(&job.name, NAME_WIDTH), width = NAME_WIDTH),
            name_style,
        ),
        Span::raw(" ".repeat(SPACING)),
        Span::styled(
            format!("{:<width$}", job.status.label(), width = STATUS_WIDTH),
            Style::default().fg(status_color(&job.status)),
        ),
    ];
    if let JobStatus::Failed(reason) = &job.status {
        spans.push(Span::styled(
            format!("  {}", reason),
            Style::default().fg(COLOR_TEXT_MUTED),
        ));
    }
    Line::from(spans)
}

fn render_separator(frame: &mut Frame, area: Rect) {
    let solid = "─".repeat(area.width as usize);
    let line = Line::from(Span::styled(solid, Style::default().fg(COLOR_SEPARATOR)));
    frame.render_widget(Paragraph::new(line), area);
}

fn render_events(frame: &mut Frame, state: &DashboardState, area: Rect) {
    let mut lines: Vec<Line> = Vec::new();
    if state.missed > 0 {
        lines.push(Line::from(Span::styled(
            format!("({} events missed)", state.missed),
            Style::default().fg(COLOR_TEXT_MUTED),
        )));
    }
    lines.extend(
        state
            .events
            .iter()
            .take(area.height as usize)
            .map(event_line),
    );
    frame.render_widget(Paragraph::new(lines), area);
}

fn event_line(event: &EventLine) -> Line<'static> {
    let text_style = if event.failed {
        Style::default().fg(COLOR_STATUS_FAILED)
    } else {
        Style::default().fg(COLOR_TEXT_DIMMED)
    };
    Line::from(vec![
        Span::styled(
            event.at.with_timezone(&chrono::Local).format("%H:%M:%S ").to_string(),
            Style::default().fg(COLOR_TEXT_MUTED),
        ),
        Span::styled(event.text.clone(), text_style),
    ])
}

fn keymap_line() -> Line<'static> {
    let key_style = Style::default().fg(COLOR_TEXT_DIMMED);
    let desc_style = Style::default().fg(COLOR_TEXT_MUTED);

    let mut spans: Vec<Span> = Vec::new();
    for (group_idx, group) in KEYMAP.iter().enumerate() {
        if group_idx > 0 {
            spans.push(Span::styled(" │ ", desc_style));
        }
        for (key_idx, keybinding) in group.iter().enumerate() {
            if key_idx > 0 {
                spans.push(Span::styled(" • ", desc_style));
            }
            spans.push(Span::styled(keybinding.0, key_style));
            spans.push(Span::styled(format!(" {}", keybinding.1), desc_style));
        }
    }
    Line::from(spans)
}

fn status_color(status: &JobStatus) -> Color {
    match status {
        JobStatus::Idle => COLOR_TEXT_MUTED,
        JobStatus::Running => COLOR_STATUS_RUNNING,
        JobStatus::Finished => COLOR_STATUS_FINISHED,
        JobStatus::Failed(_) => COLOR_STATUS_FAILED,
        JobStatus::Stopped => COLOR_STATUS_STOPPED,
    }
}

fn truncate(s: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 1).collect();
        format!("{}~", truncated)
    }
}
