//! Cube lab core.
//!
//! A user program runs inside a sandbox thread against a private cube. Every change it makes is
//! serialized, sent to the controller over an acknowledged channel, replayed onto the shared cube
//! by the [`ProgramManager`] and only then acknowledged. The [`History`] listens to the shared cube
//! and records each new change, telling replays caused by its own navigation apart through the
//! change's [`MutationOrigin`].
//!
//! - `cube`: snapshots, moves and the observable cube.
//! - `event`: change notifications and listener registries.
//! - `protocol`, `inbox`, `channel`: messages, per-type dispatch and acknowledged transport.
//! - `sandbox`: the worker thread, its capability surface and the program interpreter.
//! - `manager`: sandbox lifecycle on the controller side.
//! - `history`: the branchable change record.

pub mod channel;
pub mod config;
pub mod cube;
pub mod event;
pub mod history;
pub mod inbox;
pub mod manager;
pub mod protocol;
pub mod sandbox;

pub use config::LabConfig;
pub use cube::{Cube, CubeSnapshot, CubeSpec, Face, Move, SolutionCondition};
pub use event::{ChangeEvent, Event, MutationOrigin};
pub use history::{History, HistoryError, HistoryState};
pub use manager::{ManagerError, ProgramManager, ProgramManagerState, ProgramOutcome};
