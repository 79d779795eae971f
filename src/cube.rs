//! Puzzle-cube model: sizes, moves, immutable snapshots and the observable `Cube`.
//!
//! The rest of the crate only relies on a narrow contract from this module:
//! - a `Cube` accepts a [`Move`] or a full [`CubeSnapshot`] replacement,
//! - every mutation produces a *new* snapshot (snapshots are never edited in place),
//! - every mutation fires a [`ChangeEvent`] carrying old state, new state, optional move and the
//!   [`MutationOrigin`] supplied by the caller.
//!
//! Geometry: stickers are addressed by doubled integer coordinates so that cubie centres of an
//! `n`-cube sit on `{-(n-1), -(n-3), ..., n-1}` along every axis. A move rotates every sticker whose
//! cubie lies in the selected slice range by a multiple of 90 degrees around the face axis, which
//! keeps the algebra exact (no floating point) for any edge length.

use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{ChangeEvent, Event, MutationOrigin};

/// Largest edge length the lab accepts.
pub const MAX_EDGE_LENGTH: u8 = 7;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CubeError {
    #[error("unsupported edge length {0} (expected 1..={MAX_EDGE_LENGTH})")]
    EdgeLength(u8),
    #[error("invalid slice range {start}..={end} for edge length {edge_length}")]
    SliceRange { start: u8, end: u8, edge_length: u8 },
    #[error("snapshot for edge length {found} does not fit a cube of edge length {expected}")]
    SpecMismatch { expected: u8, found: u8 },
    #[error("snapshot holds {found} stickers, expected {expected}")]
    StickerCount { expected: usize, found: usize },
    #[error("sticker {face}[{row},{col}] is outside a cube of edge length {edge_length}")]
    Sticker { face: Face, row: u8, col: u8, edge_length: u8 },
    #[error("invalid move notation `{0}`")]
    Notation(String),
}

/// The six faces, doubling as sticker colours (a face's home colour).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Face {
    F,
    R,
    U,
    B,
    L,
    D,
}

impl Face {
    pub const ALL: [Face; 6] = [Face::F, Face::R, Face::U, Face::B, Face::L, Face::D];

    pub fn index(self) -> usize {
        match self {
            Face::F => 0,
            Face::R => 1,
            Face::U => 2,
            Face::B => 3,
            Face::L => 4,
            Face::D => 5,
        }
    }

    /// Axis (0 = x, 1 = y, 2 = z) and direction of the outward normal.
    fn normal(self) -> (usize, i32) {
        match self {
            Face::R => (0, 1),
            Face::L => (0, -1),
            Face::U => (1, 1),
            Face::D => (1, -1),
            Face::F => (2, 1),
            Face::B => (2, -1),
        }
    }

    fn from_normal(axis: usize, sign: i32) -> Face {
        match (axis, sign > 0) {
            (0, true) => Face::R,
            (0, false) => Face::L,
            (1, true) => Face::U,
            (1, false) => Face::D,
            (2, true) => Face::F,
            _ => Face::B,
        }
    }

    pub fn from_letter(letter: char) -> Option<Face> {
        match letter.to_ascii_uppercase() {
            'F' => Some(Face::F),
            'R' => Some(Face::R),
            'U' => Some(Face::U),
            'B' => Some(Face::B),
            'L' => Some(Face::L),
            'D' => Some(Face::D),
            _ => None,
        }
    }
}

impl fmt::Display for Face {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Face {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut chars = s.chars();
        match (chars.next(), chars.next()) {
            (Some(letter), None) => Face::from_letter(letter).ok_or_else(|| CubeError::Notation(s.to_string())),
            _ => Err(CubeError::Notation(s.to_string())),
        }
    }
}

/// Whole-cube rotation axis; rotations turn along the positive face of the axis (R, U, F).
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub fn positive_face(self) -> Face {
        match self {
            Axis::X => Face::R,
            Axis::Y => Face::U,
            Axis::Z => Face::F,
        }
    }
}

impl FromStr for Axis {
    type Err = CubeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "x" | "X" => Ok(Axis::X),
            "y" | "Y" => Ok(Axis::Y),
            "z" | "Z" => Ok(Axis::Z),
            _ => Err(CubeError::Notation(s.to_string())),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CubeSpec {
    pub edge_length: u8,
}

impl CubeSpec {
    pub fn new(edge_length: u8) -> Result<Self, CubeError> {
        if edge_length == 0 || edge_length > MAX_EDGE_LENGTH {
            return Err(CubeError::EdgeLength(edge_length));
        }
        Ok(Self { edge_length })
    }

    pub fn sticker_count(&self) -> usize {
        let n = self.edge_length as usize;
        6 * n * n
    }
}

/// When a cube counts as solved.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum SolutionCondition {
    /// Every face shows its home colour.
    #[default]
    Strict,
    /// Every face is single-coloured, whatever the colour (whole-cube rotations allowed).
    Uniform,
}

impl FromStr for SolutionCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "strict" => Ok(Self::Strict),
            "uniform" => Ok(Self::Uniform),
            other => Err(format!("unknown solution condition `{other}` (strict|uniform)")),
        }
    }
}

/// A rotation of the slices `slice_start..=slice_end` (numbered from `face` inward, starting at 1)
/// by `angle` quarter turns, clockwise as seen from `face` when positive.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Move {
    pub face: Face,
    pub slice_start: u8,
    pub slice_end: u8,
    pub angle: i8,
}

impl Move {
    pub fn new(face: Face, slice_start: u8, slice_end: u8, angle: i8) -> Self {
        Self {
            face,
            slice_start,
            slice_end,
            angle,
        }
    }

    /// Single outer-layer move, e.g. `R` or `U'`.
    pub fn outer(face: Face, angle: i8) -> Self {
        Self::new(face, 1, 1, angle)
    }

    /// The move that undoes this one. `i8::MIN` is a whole number of turns and inverts to itself.
    pub fn inverse(&self) -> Self {
        Self {
            angle: self.angle.wrapping_neg(),
            ..*self
        }
    }

    /// Absolute number of quarter turns, used to scale animation time.
    pub fn quarter_turns(&self) -> u32 {
        match self.angle.rem_euclid(4) {
            0 => 0,
            2 => 2,
            _ => 1,
        }
    }

    pub fn validate(&self, spec: &CubeSpec) -> Result<(), CubeError> {
        if self.slice_start == 0 || self.slice_start > self.slice_end || self.slice_end > spec.edge_length {
            return Err(CubeError::SliceRange {
                start: self.slice_start,
                end: self.slice_end,
                edge_length: spec.edge_length,
            });
        }
        Ok(())
    }

    /// Parses a whitespace-separated sequence such as `R U' F2`.
    pub fn parse_sequence(text: &str) -> Result<Vec<Move>, CubeError> {
        text.split_whitespace().map(str::parse).collect()
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.face)?;
        if self.slice_start != 1 || self.slice_end != 1 {
            write!(f, "[{}..{}]", self.slice_start, self.slice_end)?;
        }
        match self.angle {
            1 => Ok(()),
            -1 => write!(f, "'"),
            2 => write!(f, "2"),
            -2 => write!(f, "2'"),
            other => write!(f, "({other})"),
        }
    }
}

impl FromStr for Move {
    type Err = CubeError;

    /// Accepts `R`, `R'`, `R2`, `R2'` and the ranged form `R[1..2]` with the same suffixes.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CubeError::Notation(s.to_string());
        let mut chars = s.chars();
        let face = chars.next().and_then(Face::from_letter).ok_or_else(invalid)?;
        let mut rest = chars.as_str();

        let (mut slice_start, mut slice_end) = (1, 1);
        if let Some(ranged) = rest.strip_prefix('[') {
            let close = ranged.find(']').ok_or_else(invalid)?;
            let (start, end) = ranged[..close].split_once("..").ok_or_else(invalid)?;
            slice_start = start.parse().map_err(|_| invalid())?;
            slice_end = end.parse().map_err(|_| invalid())?;
            rest = &ranged[close + 1..];
        }

        let angle = match rest {
            "" => 1,
            "'" => -1,
            "2" => 2,
            "2'" => -2,
            _ => return Err(invalid()),
        };

        Ok(Move::new(face, slice_start, slice_end, angle))
    }
}

/// Immutable full sticker configuration of a cube.
///
/// Stickers are stored face by face (in [`Face::ALL`] order), row-major within a face. Each sticker
/// holds the face whose home colour it carries.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CubeSnapshot {
    edge_length: u8,
    stickers: Vec<Face>,
}

impl CubeSnapshot {
    pub fn solved(spec: CubeSpec) -> Self {
        let n = spec.edge_length as usize;
        let stickers = Face::ALL
            .iter()
            .flat_map(|face| std::iter::repeat(*face).take(n * n))
            .collect();
        Self {
            edge_length: spec.edge_length,
            stickers,
        }
    }

    pub fn edge_length(&self) -> u8 {
        self.edge_length
    }

    pub fn stickers(&self) -> &[Face] {
        &self.stickers
    }

    /// Checks that the snapshot describes a cube of `spec` (used on anything deserialized).
    pub fn validate(&self, spec: &CubeSpec) -> Result<(), CubeError> {
        if self.edge_length != spec.edge_length {
            return Err(CubeError::SpecMismatch {
                expected: spec.edge_length,
                found: self.edge_length,
            });
        }
        if self.stickers.len() != spec.sticker_count() {
            return Err(CubeError::StickerCount {
                expected: spec.sticker_count(),
                found: self.stickers.len(),
            });
        }
        Ok(())
    }

    pub fn sticker(&self, face: Face, row: u8, col: u8) -> Result<Face, CubeError> {
        let n = self.edge_length;
        if row >= n || col >= n {
            return Err(CubeError::Sticker {
                face,
                row,
                col,
                edge_length: n,
            });
        }
        Ok(self.stickers[sticker_index(n as usize, face, row as usize, col as usize)])
    }

    /// Stickers of one face, row-major.
    pub fn face(&self, face: Face) -> &[Face] {
        let n = self.edge_length as usize;
        let start = face.index() * n * n;
        &self.stickers[start..start + n * n]
    }

    pub fn is_solved(&self, condition: SolutionCondition) -> bool {
        Face::ALL.iter().all(|face| {
            let stickers = self.face(*face);
            match condition {
                SolutionCondition::Strict => stickers.iter().all(|s| s == face),
                SolutionCondition::Uniform => stickers.iter().all(|s| *s == stickers[0]),
            }
        })
    }

    /// Returns the snapshot produced by applying `mv`; `self` is left untouched.
    pub fn apply(&self, mv: &Move) -> Result<Self, CubeError> {
        let n = self.edge_length as usize;
        let spec = CubeSpec {
            edge_length: self.edge_length,
        };
        mv.validate(&spec)?;

        let (axis, sign) = mv.face.normal();
        // One clockwise quarter seen from the face is -90 degrees around its outward normal,
        // i.e. three positive quarters around +axis for a positive face and one for a negative face.
        let per_quarter = if sign > 0 { 3 } else { 1 };
        let turns = (mv.angle as i32).rem_euclid(4) * per_quarter % 4;

        let m = n as i32 - 1;
        let mut stickers = self.stickers.clone();
        for (index, colour) in self.stickers.iter().enumerate() {
            let (mut position, face) = sticker_geometry(n, index);
            let depth = ((m - sign * position[axis]) / 2 + 1) as u8;
            if depth < mv.slice_start || depth > mv.slice_end {
                continue;
            }

            let (normal_axis, normal_sign) = face.normal();
            let mut normal = [0i32; 3];
            normal[normal_axis] = normal_sign;
            for _ in 0..turns {
                position = rotate_quarter(position, axis);
                normal = rotate_quarter(normal, axis);
            }

            let target_axis = (0..3).find(|a| normal[*a] != 0).unwrap_or(0);
            let target_face = Face::from_normal(target_axis, normal[target_axis]);
            stickers[locate(n, target_face, position)] = *colour;
        }

        Ok(Self {
            edge_length: self.edge_length,
            stickers,
        })
    }

    /// Content address of the snapshot (BLAKE3 over its bincode encoding).
    pub fn fingerprint(&self) -> crate::event::Fingerprint {
        crate::event::fingerprint(self)
    }
}

fn sticker_index(n: usize, face: Face, row: usize, col: usize) -> usize {
    face.index() * n * n + row * n + col
}

/// The two in-plane axes of a face as (column axis, row axis).
fn face_plane(face: Face) -> (usize, usize) {
    match face.normal().0 {
        0 => (2, 1),
        1 => (0, 2),
        _ => (0, 1),
    }
}

fn sticker_geometry(n: usize, index: usize) -> ([i32; 3], Face) {
    let face = Face::ALL[index / (n * n)];
    let within = index % (n * n);
    let (row, col) = (within / n, within % n);
    let m = n as i32 - 1;

    let (axis, sign) = face.normal();
    let (col_axis, row_axis) = face_plane(face);
    let mut position = [0i32; 3];
    position[axis] = sign * m;
    position[col_axis] = -m + 2 * col as i32;
    position[row_axis] = -m + 2 * row as i32;
    (position, face)
}

fn locate(n: usize, face: Face, position: [i32; 3]) -> usize {
    let m = n as i32 - 1;
    let (col_axis, row_axis) = face_plane(face);
    let col = ((position[col_axis] + m) / 2) as usize;
    let row = ((position[row_axis] + m) / 2) as usize;
    sticker_index(n, face, row, col)
}

/// +90 degrees around the given axis (right-hand rule).
fn rotate_quarter(v: [i32; 3], axis: usize) -> [i32; 3] {
    let [x, y, z] = v;
    match axis {
        0 => [x, -z, y],
        1 => [z, y, -x],
        _ => [-y, x, z],
    }
}

/// Observable cube owned by one execution context.
///
/// Mutations are asynchronous: the [`ChangeEvent`] fires synchronously as soon as the new snapshot
/// is in place, then (when animated) the call suspends for the animation time so that callers only
/// continue once the visible cube has caught up.
pub struct Cube {
    spec: CubeSpec,
    solution_condition: SolutionCondition,
    state: Mutex<CubeSnapshot>,
    animation: Duration,
    /// Fired on every mutation, including history replays.
    pub state_changed: Event<ChangeEvent>,
}

impl Cube {
    pub fn new(spec: CubeSpec, solution_condition: SolutionCondition, state: CubeSnapshot) -> Result<Self, CubeError> {
        state.validate(&spec)?;
        Ok(Self {
            spec,
            solution_condition,
            state: Mutex::new(state),
            animation: Duration::ZERO,
            state_changed: Event::new(),
        })
    }

    /// Sets the time one animated quarter turn (or one animated replacement) takes.
    pub fn with_animation(mut self, per_quarter_turn: Duration) -> Self {
        self.animation = per_quarter_turn;
        self
    }

    pub fn spec(&self) -> CubeSpec {
        self.spec
    }

    pub fn solution_condition(&self) -> SolutionCondition {
        self.solution_condition
    }

    pub fn state(&self) -> CubeSnapshot {
        self.state.lock().expect("cube state poisoned").clone()
    }

    pub fn is_solved(&self) -> bool {
        self.state().is_solved(self.solution_condition)
    }

    pub async fn apply_move(&self, mv: &Move, origin: MutationOrigin, animate: bool) -> Result<(), CubeError> {
        let (old_state, new_state) = {
            let mut state = self.state.lock().expect("cube state poisoned");
            let new_state = state.apply(mv)?;
            let old_state = std::mem::replace(&mut *state, new_state.clone());
            (old_state, new_state)
        };

        self.state_changed.trigger(&ChangeEvent {
            old_state,
            new_state,
            cube_move: Some(*mv),
            origin,
        });

        if animate {
            self.animate(mv.quarter_turns().max(1)).await;
        }
        Ok(())
    }

    pub async fn set_state(&self, snapshot: CubeSnapshot, origin: MutationOrigin, animate: bool) -> Result<(), CubeError> {
        snapshot.validate(&self.spec)?;
        let old_state = {
            let mut state = self.state.lock().expect("cube state poisoned");
            std::mem::replace(&mut *state, snapshot.clone())
        };

        self.state_changed.trigger(&ChangeEvent {
            old_state,
            new_state: snapshot,
            cube_move: None,
            origin,
        });

        if animate {
            self.animate(1).await;
        }
        Ok(())
    }

    async fn animate(&self, units: u32) {
        if !self.animation.is_zero() {
            tokio::time::sleep(self.animation * units).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn three() -> CubeSpec {
        CubeSpec::new(3).expect("3 is a valid edge length")
    }

    #[test]
    fn four_quarter_turns_are_identity() {
        let solved = CubeSnapshot::solved(three());
        let mut state = solved.clone();
        for _ in 0..4 {
            state = state.apply(&Move::outer(Face::R, 1)).expect("valid move");
        }
        assert_eq!(state, solved);
        assert_ne!(solved.apply(&Move::outer(Face::R, 1)).unwrap(), solved);
    }

    #[test]
    fn inverse_undoes_move() {
        let solved = CubeSnapshot::solved(three());
        let mv: Move = "U[1..2]'".parse().expect("ranged notation parses");
        let turned = solved.apply(&mv).unwrap();
        assert_eq!(turned.apply(&mv.inverse()).unwrap(), solved);
    }

    #[test]
    fn extreme_angle_inverts_without_overflow() {
        let mv = Move::new(Face::R, 1, 1, i8::MIN);
        let inverse = mv.inverse();
        assert_eq!(inverse.angle.rem_euclid(4), 0);

        let solved = CubeSnapshot::solved(three());
        let turned = solved.apply(&Move::new(Face::R, 1, 1, i8::MIN + 1)).unwrap();
        assert_eq!(turned.apply(&Move::new(Face::R, 1, 1, i8::MIN + 1).inverse()).unwrap(), solved);
        assert_eq!(solved.apply(&inverse).unwrap(), solved);
    }

    #[test]
    fn right_turn_carries_front_column_to_up() {
        let solved = CubeSnapshot::solved(three());
        let turned = solved.apply(&Move::outer(Face::R, 1)).unwrap();
        let front_on_up = turned.face(Face::U).iter().filter(|s| **s == Face::F).count();
        assert_eq!(front_on_up, 3, "one column of front stickers moves onto the up face");
        assert!(turned.face(Face::R).iter().all(|s| *s == Face::R), "the turned face keeps its colour");
    }

    #[test]
    fn whole_cube_rotation_is_solved_only_uniformly() {
        let solved = CubeSnapshot::solved(three());
        let rotated = solved.apply(&Move::new(Face::U, 1, 3, 1)).unwrap();
        assert!(rotated.is_solved(SolutionCondition::Uniform));
        assert!(!rotated.is_solved(SolutionCondition::Strict));
    }

    #[test]
    fn notation_round_trips_through_display() {
        for text in ["R", "U'", "F2", "B2'", "L[2..3]"] {
            let mv: Move = text.parse().expect("notation parses");
            assert_eq!(mv.to_string(), text);
        }
        assert!("X".parse::<Move>().is_err());
        assert!("R3".parse::<Move>().is_err());
    }

    #[test]
    fn move_outside_slices_is_rejected() {
        let solved = CubeSnapshot::solved(three());
        let err = solved.apply(&Move::new(Face::R, 2, 4, 1)).unwrap_err();
        assert!(matches!(err, CubeError::SliceRange { .. }));
    }

    #[tokio::test]
    async fn mutations_fire_change_events_in_order() {
        let cube = Cube::new(three(), SolutionCondition::Strict, CubeSnapshot::solved(three())).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cube.state_changed.on(move |e: &ChangeEvent| {
            sink.lock().unwrap().push((e.cube_move, e.origin));
        });

        let r = Move::outer(Face::R, 1);
        cube.apply_move(&r, MutationOrigin::UserMove, false).await.unwrap();
        cube.set_state(CubeSnapshot::solved(three()), MutationOrigin::DirectReplacement, false)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(
            *seen,
            vec![(Some(r), MutationOrigin::UserMove), (None, MutationOrigin::DirectReplacement)]
        );
        assert!(cube.is_solved());
    }

    #[tokio::test]
    async fn foreign_snapshot_is_rejected() {
        let cube = Cube::new(three(), SolutionCondition::Strict, CubeSnapshot::solved(three())).unwrap();
        let two = CubeSnapshot::solved(CubeSpec::new(2).unwrap());
        let err = cube.set_state(two, MutationOrigin::DirectReplacement, false).await.unwrap_err();
        assert_eq!(err, CubeError::SpecMismatch { expected: 3, found: 2 });
    }
}
