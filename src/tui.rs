use std::io::{self, Stdout};
use std::time::Duration;

use anyhow::Result;
use crossterm::event::{Event as CEvent, EventStream, KeyCode, KeyEvent, KeyEventKind};
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use crossterm::{execute, ExecutableCommand};
use cubelab::cube::{CubeSnapshot, Face, Move};
use cubelab::event::short_hex;
use cubelab::protocol::Level;
use futures::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::layout::{Alignment, Constraint, Direction, Layout};
use ratatui::style::{Color, Modifier, Style};
use ratatui::text::{Line, Span};
use ratatui::widgets::{Block, Borders, Paragraph, Wrap};
use ratatui::Terminal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tui_logger::TuiLoggerWidget;

use crate::action::Action;
use crate::app::{Activity, App};

const HELP: &str = "F5 run  F6 run fast  Esc abort  frubld turn (shift: inverse)  ←/→ step  Home/End jump  [/] play  c/C clean past/future  q quit";

pub struct Tui {
    terminal: Terminal<CrosstermBackend<Stdout>>,
    _task: JoinHandle<()>,
    pub action_rx: mpsc::Receiver<Action>,
}

impl Tui {
    pub fn new() -> Result<Self> {
        enable_raw_mode()?;
        io::stdout().execute(EnterAlternateScreen)?;

        let backend = CrosstermBackend::new(io::stdout());
        let terminal = Terminal::new(backend)?;

        let (action_tx, action_rx) = mpsc::channel(128);
        let input_tx = action_tx.clone();

        let handle = tokio::spawn(async move {
            let mut render_interval = interval(Duration::from_millis(33));
            let mut tick_interval = interval(Duration::from_millis(250));
            let mut events = EventStream::new();

            loop {
                tokio::select! {
                    _ = render_interval.tick() => {
                        let _ = action_tx.send(Action::Render).await;
                    }
                    _ = tick_interval.tick() => {
                        let _ = action_tx.send(Action::Tick).await;
                    }
                    maybe_evt = events.next() => {
                        if let Some(Ok(evt)) = maybe_evt {
                            if let Some(action) = map_event(evt) {
                                let _ = input_tx.send(action).await;
                            }
                        }
                    }
                }
            }
        });

        Ok(Self {
            terminal,
            _task: handle,
            action_rx,
        })
    }

    pub fn draw(&mut self, app: &App) -> Result<()> {
        let state = app.cube.state();
        let status = status_lines(app, &state);
        let history = history_line(app);
        let net = net_lines(&state);
        let output: Vec<Line> = app
            .output
            .iter()
            .map(|line| Line::styled(line.text.clone(), level_style(line.level)))
            .collect();

        self.terminal.draw(|f| {
            let rows = Layout::default()
                .direction(Direction::Vertical)
                .constraints([
                    Constraint::Length(5),
                    Constraint::Min(10),
                    Constraint::Length(3),
                    Constraint::Length(10),
                ])
                .split(f.area());
            let middle = Layout::default()
                .direction(Direction::Horizontal)
                .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
                .split(rows[1]);

            let status = Paragraph::new(status).block(
                Block::default()
                    .title(format!("Cube lab: {}", app.program_name))
                    .borders(Borders::ALL),
            );
            f.render_widget(status, rows[0]);

            let cube = Paragraph::new(net).alignment(Alignment::Center).block(
                Block::default()
                    .title("Cube")
                    .borders(Borders::ALL)
                    .title_alignment(Alignment::Center),
            );
            f.render_widget(cube, middle[0]);

            let visible = middle[1].height.saturating_sub(2) as usize;
            let skip = output.len().saturating_sub(visible);
            let program = Paragraph::new(output.into_iter().skip(skip).collect::<Vec<_>>())
                .wrap(Wrap { trim: false })
                .block(Block::default().title("Program output").borders(Borders::ALL));
            f.render_widget(program, middle[1]);

            let history = Paragraph::new(history).block(Block::default().title("History").borders(Borders::ALL));
            f.render_widget(history, rows[2]);

            let log = TuiLoggerWidget::default().block(Block::default().title("Log").borders(Borders::ALL));
            f.render_widget(log, rows[3]);
        })?;

        Ok(())
    }
}

impl Drop for Tui {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
        let _ = execute!(io::stdout(), LeaveAlternateScreen);
    }
}

fn status_lines(app: &App, state: &CubeSnapshot) -> Vec<Line<'static>> {
    let activity = match app.activity() {
        Activity::Idle => "idle",
        Activity::ProgramRunning => "program running",
        Activity::HistoryPlaying => "playing history",
        Activity::Busy => "turning",
    };
    let solved = if app.cube.is_solved() {
        Span::styled("solved", Style::default().fg(Color::Green))
    } else {
        Span::raw("scrambled")
    };

    let mut lines = vec![
        Line::from(vec![
            Span::raw(format!(
                "{activity} | program {} | history {} | position {}/{} | ",
                app.manager_state,
                app.history_state,
                app.history.current_position(),
                app.history.len() as i64 - 1,
            )),
            solved,
            Span::raw(format!(" | {}", short_hex(&state.fingerprint(), 4))),
        ]),
        Line::styled(HELP, Style::default().fg(Color::DarkGray)),
    ];
    if let Some((overlay, _)) = &app.overlay {
        lines.push(Line::from(vec![
            Span::styled(overlay.title.clone(), level_style(overlay.level).add_modifier(Modifier::BOLD)),
            Span::raw(format!("  {}", overlay.message)),
        ]));
    }
    lines
}

/// Entry labels with the current position highlighted, trimmed to the most recent ones.
fn history_line(app: &App) -> Line<'static> {
    const WINDOW: usize = 40;
    let labels = app.history_labels();
    let current = app.history.current_position();
    let start = labels.len().saturating_sub(WINDOW);
    let highlight = Style::default().fg(Color::Black).bg(Color::Yellow);

    let mut spans = vec![Span::styled(
        "◆",
        if current == -1 { highlight } else { Style::default() },
    )];
    for (index, label) in labels.into_iter().enumerate().skip(start) {
        let style = if index as i64 == current { highlight } else { Style::default() };
        spans.push(Span::raw(" "));
        spans.push(Span::styled(label, style));
    }
    Line::from(spans)
}

/// Unfolded cube: U on top, L F R B across, D below.
fn net_lines(state: &CubeSnapshot) -> Vec<Line<'static>> {
    let n = state.edge_length() as usize;
    let pad = " ".repeat(n * 2 + 1);
    let row = |face: Face, r: usize| -> Vec<Span<'static>> {
        state.face(face)[r * n..(r + 1) * n]
            .iter()
            .map(|sticker| Span::styled("██", Style::default().fg(face_colour(*sticker))))
            .collect()
    };

    let mut lines = Vec::new();
    for r in 0..n {
        let mut spans = vec![Span::raw(pad.clone())];
        spans.extend(row(Face::U, r));
        lines.push(Line::from(spans));
    }
    for r in 0..n {
        let mut spans = Vec::new();
        for (i, face) in [Face::L, Face::F, Face::R, Face::B].into_iter().enumerate() {
            if i > 0 {
                spans.push(Span::raw(" "));
            }
            spans.extend(row(face, r));
        }
        lines.push(Line::from(spans));
    }
    for r in 0..n {
        let mut spans = vec![Span::raw(pad.clone())];
        spans.extend(row(Face::D, r));
        lines.push(Line::from(spans));
    }
    lines
}

fn face_colour(face: Face) -> Color {
    match face {
        Face::F => Color::Green,
        Face::R => Color::Red,
        Face::U => Color::White,
        Face::B => Color::Blue,
        Face::L => Color::Rgb(255, 140, 0),
        Face::D => Color::Yellow,
    }
}

fn level_style(level: Level) -> Style {
    match level {
        Level::Info => Style::default(),
        Level::Success => Style::default().fg(Color::Green),
        Level::Warning => Style::default().fg(Color::Yellow),
        Level::Error => Style::default().fg(Color::Red),
    }
}

fn map_event(evt: CEvent) -> Option<Action> {
    match evt {
        CEvent::Key(KeyEvent { kind: KeyEventKind::Release, .. }) => None,
        CEvent::Key(KeyEvent { code, .. }) => map_key(code),
        CEvent::Resize(w, h) => Some(Action::Resize(w, h)),
        _ => None,
    }
}

fn map_key(code: KeyCode) -> Option<Action> {
    let action = match code {
        KeyCode::Char('q') => Action::Quit,
        KeyCode::F(5) => Action::RunProgram { animate: true },
        KeyCode::F(6) => Action::RunProgram { animate: false },
        KeyCode::Esc => Action::Abort,
        KeyCode::Left => Action::StepBack,
        KeyCode::Right => Action::StepAhead,
        KeyCode::Home => Action::JumpToStart,
        KeyCode::End => Action::JumpToEnd,
        KeyCode::Char('[') => Action::PlayBack,
        KeyCode::Char(']') => Action::PlayAhead,
        KeyCode::Char('c') => Action::CleanPast,
        KeyCode::Char('C') => Action::CleanFuture,
        KeyCode::Char(c) => {
            let face = Face::from_letter(c.to_ascii_uppercase())?;
            let angle = if c.is_ascii_uppercase() { -1 } else { 1 };
            Action::Turn(Move::outer(face, angle))
        }
        _ => return None,
    };
    Some(action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn face_letters_turn_and_shift_inverts() {
        assert!(matches!(map_key(KeyCode::Char('r')), Some(Action::Turn(mv)) if mv == Move::outer(Face::R, 1)));
        assert!(matches!(map_key(KeyCode::Char('D')), Some(Action::Turn(mv)) if mv == Move::outer(Face::D, -1)));
        assert!(matches!(map_key(KeyCode::Char('C')), Some(Action::CleanFuture)));
        assert!(map_key(KeyCode::Char('z')).is_none());
    }
}
