use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cubelab::cube::{Cube, Move};
use cubelab::event::MutationOrigin;
use cubelab::history::{History, HistoryState};
use cubelab::manager::{ProgramManager, ProgramManagerState, ProgramOutcome};
use cubelab::protocol::{Level, OverlaySync};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::action::Action;

const MAX_OUTPUT_LINES: usize = 500;

/// Who currently owns the shared cube. Only one of them may mutate it at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Idle,
    ProgramRunning,
    HistoryPlaying,
    /// A single user turn or history step is being applied.
    Busy,
}

pub struct OutputLine {
    pub level: Level,
    pub text: String,
}

pub struct App {
    pub should_quit: bool,
    pub cube: Arc<Cube>,
    pub history: Arc<History>,
    pub manager: Arc<ProgramManager>,
    pub program_name: String,
    program_code: String,
    animate_programs: bool,
    pub manager_state: ProgramManagerState,
    pub history_state: HistoryState,
    task_running: bool,
    pub output: Vec<OutputLine>,
    pub overlay: Option<(OverlaySync, Instant)>,
    lab_tx: mpsc::UnboundedSender<Action>,
}

impl App {
    /// Wires the lab's notifications into `lab_tx` so they arrive as actions.
    pub fn new(
        cube: Arc<Cube>,
        program_name: String,
        program_code: String,
        animate_programs: bool,
        lab_tx: mpsc::UnboundedSender<Action>,
    ) -> Self {
        let history = Arc::new(History::new(cube.clone()));
        let manager = ProgramManager::new(cube.clone());

        let tx = lab_tx.clone();
        manager.state_changed.on(move |e| {
            let _ = tx.send(Action::ManagerState(e.new_state));
        });
        let tx = lab_tx.clone();
        manager.logged.on(move |log| {
            let _ = tx.send(Action::Logged(log.clone()));
        });
        let tx = lab_tx.clone();
        manager.overlaid.on(move |overlay| {
            let _ = tx.send(Action::Overlaid(overlay.clone()));
        });
        let tx = lab_tx.clone();
        manager.outcome.on(move |outcome| {
            let _ = tx.send(Action::Outcome(outcome.clone()));
        });
        let tx = lab_tx.clone();
        history.events.state_changed.on(move |e| {
            let _ = tx.send(Action::HistoryState(e.new_state));
        });

        Self {
            should_quit: false,
            cube,
            history,
            manager,
            program_name,
            program_code,
            animate_programs,
            manager_state: ProgramManagerState::Idle,
            history_state: HistoryState::Idle,
            task_running: false,
            output: Vec::new(),
            overlay: None,
            lab_tx,
        }
    }

    pub fn activity(&self) -> Activity {
        if self.manager_state != ProgramManagerState::Idle {
            Activity::ProgramRunning
        } else if self.history_state == HistoryState::Playing {
            Activity::HistoryPlaying
        } else if self.task_running {
            Activity::Busy
        } else {
            Activity::Idle
        }
    }

    pub fn update(&mut self, action: Action) {
        match action {
            Action::Quit => {
                if self.manager_state == ProgramManagerState::Running {
                    let _ = self.manager.abort();
                }
                self.should_quit = true;
            }
            Action::Tick => {
                if matches!(&self.overlay, Some((_, until)) if *until <= Instant::now()) {
                    self.overlay = None;
                }
            }
            Action::RunProgram { animate } => self.run_program(animate && self.animate_programs),
            Action::Abort => self.abort(),
            Action::Turn(mv) => {
                let cube = self.cube.clone();
                self.spawn_task(async move {
                    cube.apply_move(&mv, MutationOrigin::UserMove, true)
                        .await
                        .map_err(|e| e.to_string())
                });
            }
            Action::StepBack => self.spawn_history(|h| async move { h.step_back().await }),
            Action::StepAhead => self.spawn_history(|h| async move { h.step_ahead().await }),
            Action::JumpToStart => self.spawn_history(|h| async move { h.jump_to_start().await }),
            Action::JumpToEnd => self.spawn_history(|h| async move { h.jump_to_end().await }),
            Action::PlayBack => self.spawn_history(|h| async move { h.play_back().await }),
            Action::PlayAhead => self.spawn_history(|h| async move { h.play_ahead().await }),
            Action::CleanPast => {
                if self.activity() == Activity::Idle {
                    let position = self.history.current_position();
                    self.report(self.history.clean_past_before(position).map_err(|e| e.to_string()));
                }
            }
            Action::CleanFuture => {
                if self.activity() == Activity::Idle {
                    let position = self.history.current_position();
                    self.report(self.history.clean_future_after(position).map_err(|e| e.to_string()));
                }
            }
            Action::ManagerState(state) => self.manager_state = state,
            Action::HistoryState(state) => self.history_state = state,
            Action::Logged(log) => self.push_output(log.level, log.message),
            Action::Overlaid(overlay) => {
                let until = Instant::now() + Duration::from_millis(overlay.duration);
                self.overlay = Some((overlay, until));
            }
            Action::Outcome(outcome) => self.show_outcome(outcome),
            Action::TaskDone(result) => {
                self.task_running = false;
                self.report(result);
            }
            Action::Render | Action::Resize(..) => {}
        }
    }

    fn run_program(&mut self, animate: bool) {
        if self.activity() != Activity::Idle {
            warn!(activity = ?self.activity(), "cannot start a program now");
            return;
        }
        info!(program = %self.program_name, animate, "starting program");
        if let Err(err) = self.manager.start(&self.program_code, animate) {
            self.push_output(Level::Error, format!("could not start program: {err}"));
        }
    }

    fn abort(&mut self) {
        let result = match self.activity() {
            Activity::ProgramRunning => self.manager.abort().map_err(|e| e.to_string()),
            Activity::HistoryPlaying => self.history.abort().map_err(|e| e.to_string()),
            _ => Ok(()),
        };
        self.report(result);
    }

    fn spawn_history<F, Fut>(&mut self, operation: F)
    where
        F: FnOnce(Arc<History>) -> Fut,
        Fut: Future<Output = Result<(), cubelab::history::HistoryError>> + Send + 'static,
    {
        let future = operation(self.history.clone());
        self.spawn_task(async move { future.await.map_err(|e| e.to_string()) });
    }

    /// Runs one cube-mutating task if nothing else owns the cube.
    fn spawn_task<Fut>(&mut self, task: Fut)
    where
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        if self.activity() != Activity::Idle {
            return;
        }
        self.task_running = true;
        let tx = self.lab_tx.clone();
        tokio::spawn(async move {
            let _ = tx.send(Action::TaskDone(task.await));
        });
    }

    fn show_outcome(&mut self, outcome: ProgramOutcome) {
        match outcome {
            ProgramOutcome::Success => self.push_output(Level::Success, "program finished".to_string()),
            ProgramOutcome::Failure(report) => {
                for line in report.stack.lines() {
                    self.push_output(Level::Error, line.to_string());
                }
            }
            // Not the program's fault; the details are in the log pane.
            ProgramOutcome::Crash(_) => self.push_output(Level::Warning, "program sandbox stopped unexpectedly".to_string()),
            ProgramOutcome::Aborted => self.push_output(Level::Warning, "program aborted".to_string()),
        }
    }

    fn report(&mut self, result: Result<(), String>) {
        if let Err(message) = result {
            self.push_output(Level::Warning, message);
        }
    }

    fn push_output(&mut self, level: Level, text: String) {
        self.output.push(OutputLine { level, text });
        if self.output.len() > MAX_OUTPUT_LINES {
            let excess = self.output.len() - MAX_OUTPUT_LINES;
            self.output.drain(..excess);
        }
    }

    /// Move notation of every entry, `*` for full-state replacements.
    pub fn history_labels(&self) -> Vec<String> {
        self.history
            .entries()
            .iter()
            .map(|entry| entry.cube_move.as_ref().map_or_else(|| "*".to_string(), Move::to_string))
            .collect()
    }
}
