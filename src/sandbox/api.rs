//! Capability surface handed to a running program.
//!
//! Nothing here is global: the interpreter receives one [`ExecutionApi`] value and can reach the
//! private cube, the controller's UI and the system utilities only through it.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;

use crate::channel::{AcknowledgedChannel, ChannelError, PendingAck};
use crate::cube::{Axis, Cube, CubeError, CubeSnapshot, CubeSpec, Face, Move};
use crate::event::MutationOrigin;
use crate::protocol::{Level, UiSync};

/// Acknowledgments of forwarded cube changes, oldest first.
pub(crate) type ForwardQueue = Arc<Mutex<VecDeque<PendingAck>>>;

pub struct ExecutionApi {
    pub ui: UiApi,
    pub cube: CubeApi,
    pub system: SystemApi,
}

/// Log lines and overlays, each delivered as an acknowledged message.
pub struct UiApi {
    channel: Arc<AcknowledgedChannel>,
}

impl UiApi {
    pub(crate) fn new(channel: Arc<AcknowledgedChannel>) -> Self {
        Self { channel }
    }

    pub async fn log(&self, message: impl Into<String>, level: Level) -> Result<(), ChannelError> {
        self.channel.send(UiSync::log(message, level))?.await;
        Ok(())
    }

    pub async fn overlay(
        &self,
        title: impl Into<String>,
        message: impl Into<String>,
        level: Level,
        duration: Duration,
    ) -> Result<(), ChannelError> {
        let duration = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.channel.send(UiSync::overlay(title, message, level, duration))?.await;
        Ok(())
    }
}

/// Manipulation and inspection of the sandbox's private cube.
///
/// Every mutating call returns only after the controller acknowledged the resulting change, so a
/// program issuing move after move is paced by the controller.
pub struct CubeApi {
    cube: Arc<Cube>,
    forwarded: ForwardQueue,
}

impl CubeApi {
    pub(crate) fn new(cube: Arc<Cube>, forwarded: ForwardQueue) -> Self {
        Self { cube, forwarded }
    }

    pub fn spec(&self) -> CubeSpec {
        self.cube.spec()
    }

    pub fn state(&self) -> CubeSnapshot {
        self.cube.state()
    }

    pub fn is_solved(&self) -> bool {
        self.cube.is_solved()
    }

    pub fn sticker(&self, face: Face, row: u8, col: u8) -> Result<Face, CubeError> {
        self.cube.state().sticker(face, row, col)
    }

    pub async fn apply(&self, mv: Move) -> Result<(), CubeError> {
        self.cube.apply_move(&mv, MutationOrigin::Program, false).await?;
        self.synchronized().await;
        Ok(())
    }

    pub async fn range(&self, face: Face, slice_start: u8, slice_end: u8, angle: i8) -> Result<(), CubeError> {
        self.apply(Move::new(face, slice_start, slice_end, angle)).await
    }

    pub async fn face(&self, face: Face, slice: u8, angle: i8) -> Result<(), CubeError> {
        self.range(face, slice, slice, angle).await
    }

    /// Turns the whole cube around `axis`.
    pub async fn rotate(&self, axis: Axis, angle: i8) -> Result<(), CubeError> {
        self.range(axis.positive_face(), 1, self.spec().edge_length, angle).await
    }

    /// Applies `count` random single-slice quarter turns from the outer half of the cube.
    pub async fn shuffle(&self, count: u32) -> Result<(), CubeError> {
        let outer_half = (self.spec().edge_length + 1) / 2;
        let moves: Vec<Move> = {
            let mut rng = rand::thread_rng();
            (0..count)
                .map(|_| {
                    let face = Face::ALL[rng.gen_range(0..Face::ALL.len())];
                    let slice = rng.gen_range(1..=outer_half);
                    Move::new(face, slice, slice, 1)
                })
                .collect()
        };
        for mv in moves {
            self.apply(mv).await?;
        }
        Ok(())
    }

    /// Replaces the state with the solved snapshot (a change without a move).
    pub async fn reset(&self) -> Result<(), CubeError> {
        let solved = CubeSnapshot::solved(self.spec());
        self.cube.set_state(solved, MutationOrigin::DirectReplacement, false).await?;
        self.synchronized().await;
        Ok(())
    }

    /// Waits until every forwarded change has been acknowledged.
    async fn synchronized(&self) {
        loop {
            let next = self.forwarded.lock().expect("forward queue poisoned").pop_front();
            match next {
                Some(ack) => ack.await,
                None => break,
            }
        }
    }
}

pub struct SystemApi {
    _private: (),
}

impl SystemApi {
    pub(crate) fn new() -> Self {
        Self { _private: () }
    }

    pub async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    /// Reads additional program text for `load`.
    pub async fn load_source(&self, path: &str) -> std::io::Result<String> {
        tokio::fs::read_to_string(path).await
    }
}
