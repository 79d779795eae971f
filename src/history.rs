//! Branchable, navigable record of every change to one cube.
//!
//! Position `-1` is the initial state; position `k` means entry `k` has been applied. Navigation
//! replays entries onto the cube tagged [`MutationOrigin::HistoryReplay`], which the history's own
//! listener recognizes and turns into a pointer move instead of a new entry.

use std::fmt;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::cube::{Cube, CubeError, CubeSnapshot, Move};
use crate::event::{ChangeEvent, Event, MutationOrigin};

/// Errors returned by history operations.
///
/// Navigation past either end and operations attempted while a play loop runs are reported
/// without touching the cube. Cube errors only occur when a recorded move no longer fits the cube,
/// e.g. after the cube was replaced with one of another size.
#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("already at the start of the history")]
    AtStart,
    #[error("already at the end of the history")]
    AtEnd,
    #[error("invalid history position {0}")]
    InvalidPosition(i64),
    #[error("cannot {operation} while the history is {state}")]
    InvalidState {
        operation: &'static str,
        state: HistoryState,
    },
    #[error(transparent)]
    Cube(#[from] CubeError),
    #[error("failed to parse history item {index}: {source}")]
    Restore {
        index: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize history item: {0}")]
    Export(#[source] serde_json::Error),
}

/// Whether a play loop currently owns the cube.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryState {
    Idle,
    /// `play_back` or `play_ahead` is stepping through entries.
    Playing,
}

impl fmt::Display for HistoryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HistoryState::Idle => "idle",
            HistoryState::Playing => "playing",
        })
    }
}

/// One recorded change. `cube_move` is absent for full-state replacements.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub old_state: CubeSnapshot,
    pub new_state: CubeSnapshot,
    pub cube_move: Option<Move>,
}

/// Serialized form of an entry for export and restore.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
///
/// Moves are stored as notation-level values; full-state replacements carry the whole snapshot.
pub enum HistoryItem {
    State(CubeSnapshot),
    Move(Move),
}

/// The current position moved from `from` to `to`; `by` is the signed distance.
///
/// Raised for every navigation step, including each step of a play loop. Recording a new entry
/// raises [`HistoryRecorded`] instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryMoved {
    pub from: i64,
    pub by: i64,
    pub to: i64,
}

/// A new entry was appended at `position`, after any abandoned future was discarded.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecorded {
    pub entry: HistoryEntry,
    pub position: i64,
}

/// Entries `0..=before` were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryPastCleaned {
    pub before: i64,
}

/// Entries after `after` were dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryFutureCleaned {
    pub after: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryStateChanged {
    pub old_state: HistoryState,
    pub new_state: HistoryState,
}

/// Notification streams of a [`History`].
///
/// Listeners are called after the history's lock is released, in registration order, so a
/// listener may read the history (positions, entries) but sees the state after the whole
/// operation, not an intermediate one.
#[derive(Default)]
pub struct HistoryEvents {
    pub moved: Event<HistoryMoved>,
    pub recorded: Event<HistoryRecorded>,
    pub past_cleaned: Event<HistoryPastCleaned>,
    pub future_cleaned: Event<HistoryFutureCleaned>,
    pub state_changed: Event<HistoryStateChanged>,
}

/// Notifications are collected under the lock and raised after it is released.
enum Notification {
    Moved(HistoryMoved),
    Recorded(HistoryRecorded),
    PastCleaned(HistoryPastCleaned),
    FutureCleaned(HistoryFutureCleaned),
    StateChanged(HistoryStateChanged),
}

impl HistoryEvents {
    fn raise(&self, notifications: Vec<Notification>) {
        for notification in notifications {
            match notification {
                Notification::Moved(e) => self.moved.trigger(&e),
                Notification::Recorded(e) => self.recorded.trigger(&e),
                Notification::PastCleaned(e) => self.past_cleaned.trigger(&e),
                Notification::FutureCleaned(e) => self.future_cleaned.trigger(&e),
                Notification::StateChanged(e) => self.state_changed.trigger(&e),
            }
        }
    }
}

struct HistoryInner {
    initial_state: CubeSnapshot,
    entries: Vec<HistoryEntry>,
    current_position: i64,
    state: HistoryState,
    /// Bumped whenever a play loop starts or is aborted; a loop stops once it no longer matches.
    play_generation: u64,
}

impl HistoryInner {
    fn last_position(&self) -> i64 {
        self.entries.len() as i64 - 1
    }

    fn is_at_start(&self) -> bool {
        self.current_position <= -1
    }

    fn is_at_end(&self) -> bool {
        self.current_position >= self.last_position()
    }

    fn check_position(&self, position: i64) -> Result<(), HistoryError> {
        if position < -1 || position > self.last_position() {
            return Err(HistoryError::InvalidPosition(position));
        }
        Ok(())
    }

    fn set_state(&mut self, new_state: HistoryState) -> Notification {
        let old_state = std::mem::replace(&mut self.state, new_state);
        Notification::StateChanged(HistoryStateChanged { old_state, new_state })
    }

    fn record(&mut self, event: &ChangeEvent) -> Vec<Notification> {
        let mut notifications = Vec::new();

        if let Some(delta) = event.origin.history_delta() {
            let from = self.current_position;
            let to = from + delta;
            if to < -1 || to > self.last_position() {
                warn!(from, delta, "history replay outside the recorded range");
            }
            self.current_position = to.clamp(-1, self.last_position());
            notifications.push(Notification::Moved(HistoryMoved {
                from,
                by: delta,
                to: self.current_position,
            }));
            return notifications;
        }

        let position = self.current_position + 1;
        if self.last_position() != self.current_position {
            self.entries.truncate(position as usize);
            notifications.push(Notification::FutureCleaned(HistoryFutureCleaned {
                after: self.current_position,
            }));
        }

        let entry = HistoryEntry {
            old_state: event.old_state.clone(),
            new_state: event.new_state.clone(),
            cube_move: event.cube_move,
        };
        self.entries.push(entry.clone());
        notifications.push(Notification::Recorded(HistoryRecorded { entry, position }));

        let from = self.current_position;
        self.current_position = position;
        notifications.push(Notification::Moved(HistoryMoved {
            from,
            by: 1,
            to: position,
        }));
        notifications
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Back,
    Ahead,
}

/// Branchable, navigable record of every change made to one cube.
///
/// Positions run from `-1` (the initial state, before any entry) to `len() - 1`. A change made
/// while the position is not at the end discards the entries after it before being recorded, so
/// the history never branches in memory: the newest branch wins.
///
/// Navigation drives the cube itself with a [`MutationOrigin::HistoryReplay`] origin, which the
/// recorder recognises and turns into a pointer move instead of a new entry.
pub struct History {
    cube: Arc<Cube>,
    inner: Arc<Mutex<HistoryInner>>,
    pub events: Arc<HistoryEvents>,
}

impl History {
    /// Starts recording every change of `cube`, with its current state as the initial state.
    pub fn new(cube: Arc<Cube>) -> Self {
        let inner = Arc::new(Mutex::new(HistoryInner {
            initial_state: cube.state(),
            entries: Vec::new(),
            current_position: -1,
            state: HistoryState::Idle,
            play_generation: 0,
        }));
        let events = Arc::new(HistoryEvents::default());

        {
            let inner = inner.clone();
            let events = events.clone();
            cube.state_changed.on(move |event: &ChangeEvent| {
                let notifications = inner.lock().expect("history poisoned").record(event);
                events.raise(notifications);
            });
        }

        Self { cube, inner, events }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HistoryInner> {
        self.inner.lock().expect("history poisoned")
    }

    pub fn state(&self) -> HistoryState {
        self.lock().state
    }

    /// Index of the entry that produced the cube's current state, `-1` for the initial state.
    pub fn current_position(&self) -> i64 {
        self.lock().current_position
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    pub fn is_at_start(&self) -> bool {
        self.lock().is_at_start()
    }

    /// True when there is nothing to step ahead to. An empty history is both at start and at end.
    pub fn is_at_end(&self) -> bool {
        self.lock().is_at_end()
    }

    /// State at position `-1`; moves forward when the past is cleaned.
    pub fn initial_state(&self) -> CubeSnapshot {
        self.lock().initial_state.clone()
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().entries.clone()
    }

    /// Entry at `position`, or [`HistoryError::InvalidPosition`] outside `0..len()`.
    pub fn entry(&self, position: i64) -> Result<HistoryEntry, HistoryError> {
        let inner = self.lock();
        usize::try_from(position)
            .ok()
            .and_then(|index| inner.entries.get(index))
            .cloned()
            .ok_or(HistoryError::InvalidPosition(position))
    }

    /// The entry that produced the current state, if any.
    pub fn last_entry(&self) -> Option<HistoryEntry> {
        let inner = self.lock();
        usize::try_from(inner.current_position)
            .ok()
            .and_then(|index| inner.entries.get(index))
            .cloned()
    }

    /// Undoes the entry at the current position on the cube (animated).
    pub async fn step_back(&self) -> Result<(), HistoryError> {
        let entry = {
            let inner = self.lock();
            if inner.is_at_start() {
                return Err(HistoryError::AtStart);
            }
            inner.entries[inner.current_position as usize].clone()
        };
        let origin = MutationOrigin::HistoryReplay { delta: -1 };
        match entry.cube_move {
            Some(mv) => self.cube.apply_move(&mv.inverse(), origin, true).await?,
            None => self.cube.set_state(entry.old_state, origin, true).await?,
        }
        Ok(())
    }

    /// Re-applies the entry after the current position on the cube (animated).
    pub async fn step_ahead(&self) -> Result<(), HistoryError> {
        let entry = {
            let inner = self.lock();
            if inner.is_at_end() {
                return Err(HistoryError::AtEnd);
            }
            inner.entries[(inner.current_position + 1) as usize].clone()
        };
        let origin = MutationOrigin::HistoryReplay { delta: 1 };
        match entry.cube_move {
            Some(mv) => self.cube.apply_move(&mv, origin, true).await?,
            None => self.cube.set_state(entry.new_state, origin, true).await?,
        }
        Ok(())
    }

    /// Replaces the cube's state with the one at `position` without animation.
    pub async fn jump_to_position(&self, position: i64) -> Result<(), HistoryError> {
        let (target, delta) = {
            let inner = self.lock();
            inner.check_position(position)?;
            if position == inner.current_position {
                return Ok(());
            }
            let target = match position {
                -1 => inner.initial_state.clone(),
                p => inner.entries[p as usize].new_state.clone(),
            };
            (target, position - inner.current_position)
        };
        self.cube
            .set_state(target, MutationOrigin::HistoryReplay { delta }, false)
            .await?;
        Ok(())
    }

    /// Jumps to the initial state, position `-1`.
    pub async fn jump_to_start(&self) -> Result<(), HistoryError> {
        self.jump_to_position(-1).await
    }

    /// Jumps to the newest entry.
    pub async fn jump_to_end(&self) -> Result<(), HistoryError> {
        let last = self.lock().last_position();
        self.jump_to_position(last).await
    }

    /// Steps back, animated, until the start is reached or [`History::abort`] is called.
    ///
    /// The history is `Playing` for the duration and returns to `Idle` when the loop ends on its
    /// own. Starting a second loop while one runs is rejected.
    pub async fn play_back(&self) -> Result<(), HistoryError> {
        self.play(Direction::Back).await
    }

    /// Like [`History::play_back`], towards the end.
    pub async fn play_ahead(&self) -> Result<(), HistoryError> {
        self.play(Direction::Ahead).await
    }

    /// Steps in `direction` until the boundary or until [`History::abort`].
    async fn play(&self, direction: Direction) -> Result<(), HistoryError> {
        let (generation, started) = {
            let mut inner = self.lock();
            if inner.state == HistoryState::Playing {
                return Err(HistoryError::InvalidState {
                    operation: "play",
                    state: inner.state,
                });
            }
            match direction {
                Direction::Back if inner.is_at_start() => return Err(HistoryError::AtStart),
                Direction::Ahead if inner.is_at_end() => return Err(HistoryError::AtEnd),
                _ => {}
            }
            inner.play_generation += 1;
            (inner.play_generation, inner.set_state(HistoryState::Playing))
        };
        self.events.raise(vec![started]);

        let result = loop {
            {
                let inner = self.lock();
                let at_boundary = match direction {
                    Direction::Back => inner.is_at_start(),
                    Direction::Ahead => inner.is_at_end(),
                };
                if inner.play_generation != generation || at_boundary {
                    break Ok(());
                }
            }
            let step = match direction {
                Direction::Back => self.step_back().await,
                Direction::Ahead => self.step_ahead().await,
            };
            if let Err(err) = step {
                break Err(err);
            }
        };

        let stopped = {
            let mut inner = self.lock();
            (inner.play_generation == generation && inner.state == HistoryState::Playing)
                .then(|| inner.set_state(HistoryState::Idle))
        };
        if let Some(stopped) = stopped {
            self.events.raise(vec![stopped]);
        }
        result
    }

    /// Stops a running play loop after its current step.
    pub fn abort(&self) -> Result<(), HistoryError> {
        let stopped = {
            let mut inner = self.lock();
            if inner.state != HistoryState::Playing {
                return Err(HistoryError::InvalidState {
                    operation: "abort",
                    state: inner.state,
                });
            }
            inner.play_generation += 1;
            inner.set_state(HistoryState::Idle)
        };
        debug!("history playback aborted");
        self.events.raise(vec![stopped]);
        Ok(())
    }

    /// Drops entries `0..=position`; the state after `position` becomes the initial state.
    pub fn clean_past_before(&self, position: i64) -> Result<(), HistoryError> {
        let notification = {
            let mut inner = self.lock();
            inner.check_position(position)?;
            if position == -1 {
                return Ok(());
            }
            inner.initial_state = inner.entries[position as usize].new_state.clone();
            inner.entries.drain(..=position as usize);
            inner.current_position = if inner.current_position <= position {
                -1
            } else {
                inner.current_position - (position + 1)
            };
            Notification::PastCleaned(HistoryPastCleaned { before: position })
        };
        self.events.raise(vec![notification]);
        Ok(())
    }

    /// Drops every entry after `position`, pulling the current position back to it if needed.
    pub fn clean_future_after(&self, position: i64) -> Result<(), HistoryError> {
        let notification = {
            let mut inner = self.lock();
            inner.check_position(position)?;
            inner.entries.truncate((position + 1) as usize);
            inner.current_position = inner.current_position.min(position);
            Notification::FutureCleaned(HistoryFutureCleaned { after: position })
        };
        self.events.raise(vec![notification]);
        Ok(())
    }

    /// Rebuilds a previous session: replays `items` onto the cube unanimated, then jumps to
    /// `position`. Nothing is replayed unless every item parses.
    pub async fn restore_changes(&self, items: &[String], position: i64) -> Result<(), HistoryError> {
        let state = self.state();
        if state != HistoryState::Idle {
            return Err(HistoryError::InvalidState {
                operation: "restore",
                state,
            });
        }

        let items = items
            .iter()
            .enumerate()
            .map(|(index, raw)| serde_json::from_str(raw).map_err(|source| HistoryError::Restore { index, source }))
            .collect::<Result<Vec<HistoryItem>, _>>()?;

        for item in items {
            match item {
                HistoryItem::State(state) => {
                    self.cube
                        .set_state(state, MutationOrigin::DirectReplacement, false)
                        .await?
                }
                HistoryItem::Move(mv) => self.cube.apply_move(&mv, MutationOrigin::UserMove, false).await?,
            }
        }
        self.jump_to_position(position).await
    }

    /// Serializes the entries in the form [`History::restore_changes`] accepts.
    pub fn export_changes(&self) -> Result<Vec<String>, HistoryError> {
        self.lock()
            .entries
            .iter()
            .map(|entry| {
                let item = match entry.cube_move {
                    Some(mv) => HistoryItem::Move(mv),
                    None => HistoryItem::State(entry.new_state.clone()),
                };
                serde_json::to_string(&item).map_err(HistoryError::Export)
            })
            .collect()
    }
}
