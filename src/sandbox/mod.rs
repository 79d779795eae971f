//! Isolated execution of cube programs.
//!
//! A sandbox runs on its own thread with its own single-threaded runtime and a private cube. The
//! controller talks to it exclusively through serialized [`Message`](crate::protocol::Message)s.

mod api;
mod script;
mod session;
mod worker;

use thiserror::Error;

use crate::channel::ChannelError;
use crate::cube::CubeError;
use crate::protocol::ProtocolError;

pub use api::{CubeApi, ExecutionApi, SystemApi, UiApi};
pub use script::{Interpreter, Program, ProgramFailure, ScriptError, Statement, StatementKind, MAX_LOAD_DEPTH};
pub use session::{SandboxInbound, SandboxSession};
pub use worker::ExecutionContext;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to spawn sandbox thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("failed to build sandbox runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("sandbox bootstrap failed: {0}")]
    Bootstrap(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Cube(#[from] CubeError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}
