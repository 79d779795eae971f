use cubelab::cube::Move;
use cubelab::history::HistoryState;
use cubelab::manager::{ProgramManagerState, ProgramOutcome};
use cubelab::protocol::{LogSync, OverlaySync};

#[derive(Debug, Clone)]
pub enum Action {
    Tick,
    Render,
    Resize(u16, u16),
    Quit,

    // Keyboard commands
    RunProgram { animate: bool },
    Abort,
    Turn(Move),
    StepBack,
    StepAhead,
    JumpToStart,
    JumpToEnd,
    PlayBack,
    PlayAhead,
    CleanPast,
    CleanFuture,

    // Notifications from the lab
    ManagerState(ProgramManagerState),
    HistoryState(HistoryState),
    Logged(LogSync),
    Overlaid(OverlaySync),
    Outcome(ProgramOutcome),
    /// A spawned cube or history task finished.
    TaskDone(Result<(), String>),
}
