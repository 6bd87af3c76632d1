use std::io::{self, Stdout};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crossterm::cursor::{Hide, Show};
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use ratatui::layout::{Constraint, Direction, Layout, Rect};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span, Text};
use ratatui::widgets::{Block, BorderType, Borders, Clear, Gauge, Paragraph};
use ratatui::{Frame, Terminal, backend::CrosstermBackend};
use tracing::{info, warn};

use crate::dispatch::{self, Outcome};
use crate::error::{Error, Result};
use crate::metrics::{SystemSnapshot, format_kib};
use crate::refresh::{self, DetailView, FleetRow, Refresh, RefreshScheduler, RegionTracker, Summary};
use crate::registry::JobStatus;
use crate::sanitize::display_line;
use crate::session::{Session, ViewState};
use crate::status::ServerStatus;

const PROMPT: &str = "> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Info,
    Error,
}

/// Everything one redraw needs, borrowed from the panel.
pub struct PanelFrame<'a> {
    pub title: &'a str,
    pub crumb: String,
    pub summary: &'a Summary,
    /// Summary rows to wipe before drawing: max(previous, current) height.
    pub clear_rows: u16,
    pub message: &'a str,
    pub message_kind: MessageKind,
    pub input: &'a str,
}

/// Where the panel is drawn.
pub trait Surface: Send {
    fn render(&mut self, frame: &PanelFrame<'_>) -> Result<()>;
}

/// The shared {state, region} resource. Foreground input handling and the
/// refresh timer both go through one `Mutex<Panel>`.
pub struct Panel {
    session: Session,
    surface: Box<dyn Surface>,
    title: String,
    input: String,
    message: String,
    message_kind: MessageKind,
    summary: Summary,
    region: RegionTracker,
}

impl Panel {
    pub fn new(session: Session, surface: Box<dyn Surface>) -> Self {
        let title = match session.fleet_path() {
            Some(p) => format!("screenherd: {}", p.display()),
            None => "screenherd".to_string(),
        };
        Self {
            session,
            surface,
            title,
            input: String::new(),
            message: "type 'help' for commands".into(),
            message_kind: MessageKind::Info,
            summary: Summary::default(),
            region: RegionTracker::default(),
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    pub fn message(&self) -> (&str, MessageKind) {
        (&self.message, self.message_kind)
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    /// Polls the servers for the current view and caches the result.
    pub fn recompute(&mut self) {
        self.summary = refresh::compute(&mut self.session);
    }

    /// Draws the cached summary; never touches the servers.
    pub fn redraw(&mut self) -> Result<()> {
        let clear_rows = self.region.advance(self.summary.height());
        let crumb = match self.session.view() {
            ViewState::FleetOverview => format!("fleet ({} servers)", self.session.len()),
            ViewState::ServerDetail(i) => format!("fleet > server {i}"),
        };
        let frame = PanelFrame {
            title: &self.title,
            crumb,
            summary: &self.summary,
            clear_rows,
            message: &self.message,
            message_kind: self.message_kind,
            input: &self.input,
        };
        self.surface.render(&frame)
    }

    /// Runs one command line. Returns true when the panel should close.
    pub fn submit(&mut self, line: &str) -> bool {
        if line.trim().is_empty() {
            return false;
        }
        match dispatch::dispatch(&mut self.session, line) {
            Ok(Outcome::Exit) => true,
            Ok(Outcome::Done(msg)) => {
                self.set_message(MessageKind::Info, &msg);
                self.recompute();
                false
            }
            Err(e) => {
                // A failed apply may still have changed job tables.
                self.set_message(MessageKind::Error, &e.report());
                self.recompute();
                false
            }
        }
    }

    /// Returns true when the key closes the panel.
    pub fn handle_key(&mut self, code: KeyCode, modifiers: KeyModifiers) -> bool {
        match code {
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => true,
            KeyCode::Char(c) if !modifiers.contains(KeyModifiers::CONTROL) => {
                self.input.push(c);
                false
            }
            KeyCode::Backspace => {
                self.input.pop();
                false
            }
            KeyCode::Esc => {
                self.input.clear();
                false
            }
            KeyCode::Enter => {
                let line = std::mem::take(&mut self.input);
                self.submit(&line)
            }
            _ => false,
        }
    }

    fn set_message(&mut self, kind: MessageKind, text: &str) {
        self.message = display_line(text);
        self.message_kind = kind;
    }
}

impl Refresh for Panel {
    fn refresh(&mut self) {
        self.recompute();
        if let Err(e) = self.redraw() {
            warn!(error = %e, "background redraw failed");
        }
    }
}

pub struct TerminalSurface {
    terminal: Terminal<CrosstermBackend<Stdout>>,
}

impl TerminalSurface {
    pub fn new(terminal: Terminal<CrosstermBackend<Stdout>>) -> Self {
        Self { terminal }
    }
}

impl Surface for TerminalSurface {
    fn render(&mut self, frame: &PanelFrame<'_>) -> Result<()> {
        let mut draw_panicked = false;
        self.terminal
            .draw(|f| {
                if catch_unwind(AssertUnwindSafe(|| draw_panel(f, frame))).is_err() {
                    draw_panicked = true;
                }
            })
            .map_err(|e| Error::msg(format!("draw failed: {e}")))?;
        if draw_panicked {
            let _ = self.terminal.clear();
            return Err(Error::msg("draw panicked"));
        }
        Ok(())
    }
}

pub fn draw_panel(f: &mut Frame, frame: &PanelFrame<'_>) {
    let area = f.area();
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(2),
            Constraint::Length(frame.clear_rows),
            Constraint::Min(0),
            Constraint::Length(1),
            Constraint::Length(1),
        ])
        .split(area);

    draw_header(f, rows[0], frame);

    // Wipe the whole previously drawn region, then draw the new summary on top.
    f.render_widget(Clear, rows[1]);
    let summary_area = Rect {
        height: frame.summary.height().min(rows[1].height),
        ..rows[1]
    };
    match frame.summary {
        Summary::Fleet(lines) => draw_fleet(f, summary_area, lines),
        Summary::Detail(d) => draw_detail(f, summary_area, d),
    }

    let msg_style = match frame.message_kind {
        MessageKind::Info => Style::default().fg(Color::Gray),
        MessageKind::Error => Style::default().fg(Color::Red),
    };
    f.render_widget(Paragraph::new(frame.message).style(msg_style), rows[3]);

    let prompt = Line::from(vec![
        Span::styled(PROMPT, Style::default().fg(Color::Cyan)),
        Span::raw(frame.input),
    ]);
    f.render_widget(Paragraph::new(prompt), rows[4]);

    let typed = u16::try_from(frame.input.chars().count()).unwrap_or(u16::MAX);
    let max_x = rows[4].x + rows[4].width.saturating_sub(1);
    let x = rows[4]
        .x
        .saturating_add(PROMPT.len() as u16)
        .saturating_add(typed)
        .min(max_x);
    f.set_cursor_position((x, rows[4].y));
}

fn draw_header(f: &mut Frame, area: Rect, frame: &PanelFrame<'_>) {
    let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let line = Line::from(vec![
        Span::styled(frame.title, Style::default().fg(Color::Cyan)),
        Span::raw("  "),
        Span::styled(frame.crumb.as_str(), Style::default().fg(Color::LightBlue)),
        Span::raw("  "),
        Span::styled(now, Style::default().fg(Color::Yellow)),
    ]);
    let p = Paragraph::new(Text::from(line)).block(
        Block::default()
            .borders(Borders::BOTTOM)
            .border_type(BorderType::Plain),
    );
    f.render_widget(p, area);
}

fn status_color(status: ServerStatus) -> Color {
    match status {
        ServerStatus::Offline => Color::Red,
        ServerStatus::Idle => Color::Green,
        ServerStatus::Running { .. } => Color::Yellow,
    }
}

fn draw_fleet(f: &mut Frame, area: Rect, rows: &[FleetRow]) {
    if rows.is_empty() {
        f.render_widget(
            Paragraph::new("no servers; add one with 'server add <address> [port]'")
                .style(Style::default().fg(Color::Gray)),
            area,
        );
        return;
    }
    let lines: Vec<Line> = rows
        .iter()
        .map(|r| {
            Line::from(vec![
                Span::styled(format!("[{:>2}] ", r.index), Style::default().fg(Color::Gray)),
                Span::styled("● ", Style::default().fg(status_color(r.status))),
                Span::raw(format!("{:<32} ", display_line(&r.endpoint))),
                Span::styled(
                    r.status.to_string(),
                    Style::default()
                        .fg(status_color(r.status))
                        .add_modifier(Modifier::BOLD),
                ),
            ])
        })
        .collect();
    f.render_widget(Paragraph::new(Text::from(lines)), area);
}

fn draw_detail(f: &mut Frame, area: Rect, d: &DetailView) {
    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Length(1),
            Constraint::Min(0),
        ])
        .split(area);

    let header = Line::from(vec![
        Span::styled(format!("server {} ", d.index), Style::default().fg(Color::Gray)),
        Span::raw(format!("{}  ", display_line(&d.endpoint))),
        Span::styled(
            d.status.to_string(),
            Style::default()
                .fg(status_color(d.status))
                .add_modifier(Modifier::BOLD),
        ),
    ]);
    f.render_widget(Paragraph::new(header), rows[0]);

    let (cpu_ratio, cpu_label) = cpu_gauge(d.metrics.as_ref());
    f.render_widget(
        Gauge::default()
            .gauge_style(Style::default().fg(Color::Green))
            .ratio(cpu_ratio)
            .label(cpu_label),
        rows[1],
    );
    let (mem_ratio, mem_label) = mem_gauge(d.metrics.as_ref());
    f.render_widget(
        Gauge::default()
            .gauge_style(Style::default().fg(Color::Magenta))
            .ratio(mem_ratio)
            .label(mem_label),
        rows[2],
    );

    f.render_widget(
        Paragraph::new(format!(
            "{:>4}  {:>8}  {:<8}  {:<19}  command",
            "#", "pid", "status", "submitted"
        ))
        .style(Style::default().add_modifier(Modifier::UNDERLINED)),
        rows[3],
    );

    if d.jobs.is_empty() {
        f.render_widget(
            Paragraph::new("no jobs; launch one with 'task <server> add <command>'")
                .style(Style::default().fg(Color::Gray)),
            rows[4],
        );
        return;
    }
    let lines: Vec<Line> = d
        .jobs
        .iter()
        .map(|j| {
            let color = match j.status {
                JobStatus::Running => Color::Yellow,
                JobStatus::Stopped => Color::DarkGray,
            };
            Line::from(vec![
                Span::raw(format!(
                    "{:>4}  {:>8}  ",
                    j.index, j.remote_id
                )),
                Span::styled(format!("{:<8}", j.status.label()), Style::default().fg(color)),
                Span::raw(format!("  {:<19}  {}", j.submitted_at, j.label)),
            ])
        })
        .collect();
    f.render_widget(Paragraph::new(Text::from(lines)), rows[4]);
}

fn cpu_gauge(m: Option<&SystemSnapshot>) -> (f64, String) {
    match m.and_then(|m| Some((m.load_pct?, m.load_1m?, m.cpu_cores?))) {
        Some((pct, load, cores)) => (
            (pct / 100.0).clamp(0.0, 1.0),
            format!("CPU {pct:.0}% (load {load:.2} / {cores} cores)"),
        ),
        None => (0.0, "CPU n/a".into()),
    }
}

fn mem_gauge(m: Option<&SystemSnapshot>) -> (f64, String) {
    match m.and_then(|m| Some((m.mem_pct?, m.mem_used_kib?, m.mem_total_kib?))) {
        Some((pct, used, total)) => (
            (pct / 100.0).clamp(0.0, 1.0),
            format!(
                "Memory {pct:.0}% ({} / {})",
                format_kib(used),
                format_kib(total)
            ),
        ),
        None => (0.0, "Memory n/a".into()),
    }
}

fn lock(panel: &Mutex<Panel>) -> Result<MutexGuard<'_, Panel>> {
    panel
        .lock()
        .map_err(|_| Error::msg("panel state poisoned"))
}

/// Leaves raw mode and the alternate screen when dropped, so every exit path
/// after `enable_raw_mode` gives the terminal back.
struct TerminalGuard {
    restore: fn(),
}

impl TerminalGuard {
    fn enter() -> Result<Self> {
        enable_raw_mode().map_err(|e| Error::msg(format!("raw mode failed: {e}")))?;
        let guard = Self {
            restore: restore_terminal,
        };
        execute!(io::stdout(), EnterAlternateScreen, Hide)
            .map_err(|e| Error::msg(format!("alternate screen failed: {e}")))?;
        Ok(guard)
    }
}

impl Drop for TerminalGuard {
    fn drop(&mut self) {
        (self.restore)();
    }
}

fn restore_terminal() {
    disable_raw_mode().ok();
    execute!(io::stdout(), LeaveAlternateScreen, Show).ok();
}

/// Takes over the terminal until `exit`, Ctrl+C, or a terminal error.
pub fn run_panel(session: Session, interval: Duration) -> Result<()> {
    let _guard = TerminalGuard::enter()?;
    let backend = CrosstermBackend::new(io::stdout());
    let mut terminal = Terminal::new(backend).map_err(|e| Error::msg(e.to_string()))?;
    terminal
        .clear()
        .map_err(|e| Error::msg(format!("terminal clear failed: {e}")))?;

    let panel = Arc::new(Mutex::new(Panel::new(
        session,
        Box::new(TerminalSurface::new(terminal)),
    )));
    run_loop(&panel, interval)
}

fn run_loop(panel: &Arc<Mutex<Panel>>, interval: Duration) -> Result<()> {
    {
        let mut p = lock(panel)?;
        p.recompute();
        p.redraw()?;
    }
    let mut scheduler = RefreshScheduler::start(Arc::clone(panel), interval);
    info!(interval_secs = interval.as_secs(), "panel started");

    let tick = Duration::from_millis(100);
    let result = loop {
        match event::poll(tick) {
            Ok(true) => {}
            Ok(false) => continue,
            Err(e) => break Err(Error::msg(e.to_string())),
        }
        let ev = match event::read() {
            Ok(ev) => ev,
            Err(e) => break Err(Error::msg(e.to_string())),
        };
        let mut p = match lock(panel) {
            Ok(p) => p,
            Err(e) => break Err(e),
        };
        match ev {
            Event::Key(k) => {
                if k.kind != KeyEventKind::Press {
                    continue;
                }
                if p.handle_key(k.code, k.modifiers) {
                    break Ok(());
                }
            }
            Event::Resize(_, _) => {}
            _ => continue,
        }
        if let Err(e) = p.redraw() {
            break Err(e);
        }
    };

    // The guard is released by now; wait out any in-flight refresh.
    scheduler.stop();
    info!("panel stopped");
    result
}
