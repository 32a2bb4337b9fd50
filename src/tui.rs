use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossterm::ExecutableCommand;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use miette::IntoDiagnostic;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};

use crate::domain::IngestMode;
use crate::error::IngestError;
use crate::pipeline::{ProgressEvent, ProgressSink};

const EVENTS_MAX: usize = 8;
const LOGS_MAX: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Resolve,
    Register,
    Fetch,
    Commit,
    Done,
}

impl Phase {
    fn label(self) -> &'static str {
        match self {
            Phase::Resolve => "Resolve",
            Phase::Register => "Register",
            Phase::Fetch => "Fetch",
            Phase::Commit => "Commit",
            Phase::Done => "Done",
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    present: usize,
    registered: usize,
    fetched: usize,
    planned: usize,
    failed: usize,
    skipped: usize,
}

#[derive(Debug)]
struct DashboardState {
    status: String,
    phase: Phase,
    counters: Counters,
    events: VecDeque<String>,
    logs: VecDeque<String>,
    show_logs: bool,
    started: Instant,
}

impl DashboardState {
    fn new() -> Self {
        Self {
            status: "starting".to_string(),
            phase: Phase::Resolve,
            counters: Counters::default(),
            events: VecDeque::new(),
            logs: VecDeque::new(),
            show_logs: false,
            started: Instant::now(),
        }
    }

    fn apply(&mut self, message: &str) {
        if let Some((phase, payload)) = parse_phase(message) {
            self.phase = phase;
            self.status = payload.to_string();
        } else {
            let counters = &mut self.counters;
            match message.split_whitespace().next() {
                Some("present") => counters.present += 1,
                Some("registered") => counters.registered += 1,
                Some("fetched") => counters.fetched += 1,
                Some("planned") => counters.planned += 1,
                Some("failed") => counters.failed += 1,
                Some("skipped") => counters.skipped += 1,
                _ => self.status = message.to_string(),
            }
        }
        push_bounded(&mut self.events, message.to_string(), EVENTS_MAX);
        push_bounded(
            &mut self.logs,
            format!("[{}] {message}", chrono::Local::now().format("%H:%M:%S")),
            LOGS_MAX,
        );
    }
}

/// Live dashboard shown while an interactive ingest runs.
pub struct Dashboard {
    dataset: String,
    mode: IngestMode,
    dry_run: bool,
    state: Arc<Mutex<DashboardState>>,
}

struct DashboardProgress {
    state: Arc<Mutex<DashboardState>>,
}

impl ProgressSink for DashboardProgress {
    fn event(&self, event: ProgressEvent) {
        if let Ok(mut state) = self.state.lock() {
            state.apply(event.message.trim());
        }
    }
}

impl Dashboard {
    pub fn new(dataset: impl Into<String>, mode: IngestMode, dry_run: bool) -> Self {
        Self {
            dataset: dataset.into(),
            mode,
            dry_run,
            state: Arc::new(Mutex::new(DashboardState::new())),
        }
    }

    /// Runs `f` on a worker thread and redraws until it returns. `q` or Esc abandons the
    /// screen; the worker finishes its current scan in the background.
    pub fn run<F, R>(&mut self, f: F) -> miette::Result<R>
    where
        F: FnOnce(&dyn ProgressSink) -> Result<R, IngestError> + Send + 'static,
        R: Send + 'static,
    {
        let mut stdout = io::stdout();
        enable_raw_mode().into_diagnostic()?;
        stdout.execute(EnterAlternateScreen).into_diagnostic()?;

        let backend = CrosstermBackend::new(stdout);
        let mut terminal = Terminal::new(backend).into_diagnostic()?;
        terminal.clear().into_diagnostic()?;

        let (tx, rx) = std::sync::mpsc::channel();
        let sink = DashboardProgress {
            state: self.state.clone(),
        };
        let handle = thread::spawn(move || tx.send(f(&sink)));

        let mut tick = 0usize;
        loop {
            if let Ok(state) = self.state.lock() {
                terminal
                    .draw(|frame| self.draw(frame, &state, tick))
                    .into_diagnostic()?;
            }

            if let Ok(result) = rx.try_recv() {
                leave_screen()?;
                handle.join().ok();
                return result.map_err(miette::Report::new);
            }

            if event::poll(Duration::from_millis(120)).into_diagnostic()? {
                if let Event::Key(key) = event::read().into_diagnostic()? {
                    if self.handle_key(key) {
                        break;
                    }
                }
            }

            tick = tick.wrapping_add(1);
        }

        leave_screen()?;
        Err(miette::Report::msg("aborted"))
    }

    fn handle_key(&mut self, key: KeyEvent) -> bool {
        if key.kind != KeyEventKind::Press {
            return false;
        }
        match key.code {
            KeyCode::Char('q') | KeyCode::Esc => true,
            KeyCode::Char('l') | KeyCode::F(4) => {
                if let Ok(mut state) = self.state.lock() {
                    state.show_logs = !state.show_logs;
                }
                false
            }
            _ => false,
        }
    }

    fn draw(&self, frame: &mut ratatui::Frame, state: &DashboardState, tick: usize) {
        let chunks = Layout::default()
            .direction(Direction::Vertical)
            .constraints([
                Constraint::Length(3),
                Constraint::Min(8),
                Constraint::Length(1),
            ])
            .split(frame.area());

        frame.render_widget(self.header(tick), chunks[0]);
        if state.show_logs {
            frame.render_widget(logs_panel(state, chunks[1].height), chunks[1]);
        } else {
            let main = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(chunks[1]);
            frame.render_widget(status_panel(state), main[0]);
            frame.render_widget(counters_panel(&state.counters, self.dry_run), main[1]);
        }
        let footer = Paragraph::new(Line::from(Span::styled(
            "q/Esc leave   l logs",
            Style::default().fg(Color::DarkGray),
        )));
        frame.render_widget(footer, chunks[2]);
    }

    fn header(&self, tick: usize) -> Paragraph<'static> {
        let hb = if tick % 2 == 0 { "*" } else { " " };
        let mode = if self.dry_run {
            format!("{} (dry run)", self.mode)
        } else {
            self.mode.to_string()
        };
        let title = Line::from(vec![
            Span::styled(
                "LORIS-INGEST",
                Style::default()
                    .fg(Color::Cyan)
                    .add_modifier(Modifier::BOLD),
            ),
            Span::raw(" "),
            Span::styled(env!("CARGO_PKG_VERSION"), Style::default().fg(Color::Gray)),
            Span::raw("   Mode: "),
            Span::styled(mode, Style::default().fg(Color::Cyan)),
            Span::raw("   "),
            Span::styled(hb, Style::default().fg(Color::Green)),
        ]);
        let dataset = Line::from(Span::styled(
            format!("Dataset: {}", self.dataset),
            Style::default().fg(Color::Gray),
        ));
        Paragraph::new(vec![title, dataset])
            .alignment(Alignment::Left)
            .block(Block::default().borders(Borders::BOTTOM))
    }
}

fn leave_screen() -> miette::Result<()> {
    disable_raw_mode().into_diagnostic()?;
    let mut stdout = io::stdout();
    stdout.execute(LeaveAlternateScreen).into_diagnostic()?;
    Ok(())
}

fn status_panel(state: &DashboardState) -> Paragraph<'static> {
    let phase_color = if state.phase == Phase::Done {
        Color::Green
    } else {
        Color::Cyan
    };
    let elapsed = state.started.elapsed().as_secs();
    let mut lines = vec![
        Line::from(Span::styled(
            "STATUS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        Line::from(vec![
            Span::styled("Phase: ", Style::default().fg(Color::Gray)),
            Span::styled(state.phase.label(), Style::default().fg(phase_color)),
            Span::styled(
                format!("   Elapsed: {}m{:02}s", elapsed / 60, elapsed % 60),
                Style::default().fg(Color::Gray),
            ),
        ]),
        Line::from(vec![
            Span::styled("Now: ", Style::default().fg(Color::Gray)),
            Span::raw(state.status.clone()),
        ]),
        Line::from(Span::styled(
            "Recent events:",
            Style::default().fg(Color::Gray),
        )),
    ];
    for event in state.events.iter().rev() {
        lines.push(Line::from(format!("- {event}")));
    }
    Paragraph::new(lines)
        .block(Block::default().borders(Borders::RIGHT))
        .wrap(Wrap { trim: true })
}

fn counters_panel(counters: &Counters, dry_run: bool) -> Paragraph<'static> {
    let row = |label: &str, value: usize, color: Color| {
        Line::from(vec![
            Span::styled(format!("{label:<12}"), Style::default().fg(Color::Gray)),
            Span::styled(value.to_string(), Style::default().fg(color)),
        ])
    };
    let mut lines = vec![
        Line::from(Span::styled(
            "SCANS",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        )),
        row("present", counters.present, Color::Gray),
    ];
    if dry_run {
        lines.push(row("planned", counters.planned, Color::Yellow));
    } else {
        lines.push(row("registered", counters.registered, Color::Green));
        lines.push(row("fetched", counters.fetched, Color::Green));
    }
    let failed_color = if counters.failed > 0 {
        Color::Red
    } else {
        Color::Gray
    };
    lines.push(row("failed", counters.failed, failed_color));
    let skipped_color = if counters.skipped > 0 {
        Color::Yellow
    } else {
        Color::Gray
    };
    lines.push(row("skipped", counters.skipped, skipped_color));
    Paragraph::new(lines)
}

fn logs_panel(state: &DashboardState, height: u16) -> Paragraph<'static> {
    let visible = height.saturating_sub(2) as usize;
    let skip = state.logs.len().saturating_sub(visible);
    let lines: Vec<Line> = state
        .logs
        .iter()
        .skip(skip)
        .map(|line| Line::from(line.clone()))
        .collect();
    Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Logs"))
}

fn parse_phase(message: &str) -> Option<(Phase, &str)> {
    let rest = message.strip_prefix("phase=")?;
    let (name, payload) = rest.split_once(';')?;
    let phase = match name {
        "Resolve" => Phase::Resolve,
        "Register" => Phase::Register,
        "Fetch" => Phase::Fetch,
        "Commit" => Phase::Commit,
        "Done" => Phase::Done,
        _ => return None,
    };
    Some((phase, payload.trim()))
}

fn push_bounded(buffer: &mut VecDeque<String>, item: String, max: usize) {
    buffer.push_back(item);
    while buffer.len() > max {
        buffer.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_messages_update_status_and_outcomes_update_counters() {
        let mut state = DashboardState::new();
        state.apply("phase=Register; PROJ/sub-1/ses-V1_20200101/anat/x.mnc");
        state.apply("registered PROJ/sub-1/ses-V1_20200101/anat/x.mnc");
        state.apply("present 42");
        state.apply("failed 43: storage operation failed");
        state.apply("phase=Bogus; ignored");

        assert_eq!(state.phase, Phase::Register);
        assert_eq!(state.counters.registered, 1);
        assert_eq!(state.counters.present, 1);
        assert_eq!(state.counters.failed, 1);
        assert_eq!(state.status, "phase=Bogus; ignored");
        assert_eq!(state.events.len(), 5);
    }
}
