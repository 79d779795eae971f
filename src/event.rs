//! Change notifications and the observer registry shared by cube, history and program manager.
//!
//! A [`ChangeEvent`] is the unit every consumer reacts to: the shared cube fires one per mutation,
//! the history decides from its [`MutationOrigin`] whether it is a new mutation (record it) or a
//! replay caused by history navigation (only move the pointer).

use std::sync::{Arc, RwLock};

use blake3::Hasher;
use serde::{Deserialize, Serialize};

use crate::cube::{CubeSnapshot, Move};

/// 32-byte BLAKE3 digest used to identify snapshots in logs and the front-end.
pub type Fingerprint = [u8; 32];

/// Who caused a mutation.
///
/// The history only ever inspects this value by pattern matching: a `HistoryReplay` is a jump of
/// `delta` positions inside already-recorded history (positive = forward), everything else is new.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MutationOrigin {
    /// Direct manipulation from the controlling front-end.
    UserMove,
    /// A move issued by a sandboxed program.
    Program,
    /// Replay caused by history navigation; must not be recorded again.
    HistoryReplay { delta: i64 },
    /// Full-state replacement without a move.
    DirectReplacement,
}

impl MutationOrigin {
    pub fn history_delta(&self) -> Option<i64> {
        match self {
            MutationOrigin::HistoryReplay { delta } => Some(*delta),
            _ => None,
        }
    }
}

/// Emitted by a `Cube` on every mutation.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub old_state: CubeSnapshot,
    pub new_state: CubeSnapshot,
    /// Absent for direct state replacements.
    pub cube_move: Option<Move>,
    pub origin: MutationOrigin,
}

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered registry of synchronous listeners.
///
/// `trigger` works on a copy of the listener list, so listeners may register further listeners or
/// cause nested triggers (a history replay mutating the cube from inside a notification) without
/// deadlocking.
pub struct Event<T> {
    listeners: RwLock<Vec<Listener<T>>>,
}

impl<T> Event<T> {
    pub fn new() -> Self {
        Self {
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn on(&self, listener: impl Fn(&T) + Send + Sync + 'static) {
        self.listeners
            .write()
            .expect("event listeners poisoned")
            .push(Arc::new(listener));
    }

    pub fn trigger(&self, data: &T) {
        let listeners = self.listeners.read().expect("event listeners poisoned").clone();
        for listener in listeners {
            listener(data);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.read().expect("event listeners poisoned").len()
    }
}

impl<T> Default for Event<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// BLAKE3 digest of the bincode encoding of `value`.
pub fn fingerprint<T: Serialize>(value: &T) -> Fingerprint {
    let bytes = bincode::serialize(value).expect("Failed to serialize value for fingerprinting");
    let mut hasher = Hasher::new();
    hasher.update(&bytes);
    *hasher.finalize().as_bytes()
}

/// First `len` bytes of a fingerprint as lowercase hex.
pub fn short_hex(fingerprint: &Fingerprint, len: usize) -> String {
    fingerprint.iter().take(len).map(|b| format!("{:02x}", b)).collect::<String>()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::cube::{CubeSpec, Face};

    #[test]
    fn listeners_run_in_registration_order() {
        let event = Event::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            event.on(move |value| seen.lock().unwrap().push(format!("{tag}:{value}")));
        }

        event.trigger(&7);

        assert_eq!(*seen.lock().unwrap(), vec!["first:7", "second:7"]);
        assert_eq!(event.listener_count(), 2);
    }

    #[test]
    fn origin_serializes_as_tagged_variant() {
        let json = serde_json::to_string(&MutationOrigin::HistoryReplay { delta: -2 }).unwrap();
        assert_eq!(json, r#"{"kind":"historyReplay","delta":-2}"#);
        let back: MutationOrigin = serde_json::from_str(&json).unwrap();
        assert_eq!(back.history_delta(), Some(-2));
        assert_eq!(MutationOrigin::Program.history_delta(), None);
    }

    #[test]
    fn fingerprint_tracks_content() {
        let spec = CubeSpec::new(2).unwrap();
        let solved = CubeSnapshot::solved(spec);
        let turned = solved.apply(&Move::outer(Face::F, 1)).unwrap();
        assert_eq!(solved.fingerprint(), CubeSnapshot::solved(spec).fingerprint());
        assert_ne!(solved.fingerprint(), turned.fingerprint());
        assert_eq!(short_hex(&solved.fingerprint(), 4).len(), 8);
    }
}
