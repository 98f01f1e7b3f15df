//! Game abstraction consumed by the actor grid.
//!
//! The coordination layer treats a game as opaque beyond what is needed to
//! drive turns and score episodes: seat count, per-seat features, a legal
//! action mask, a step function and a terminal score. Every seat submits one
//! action per step; seats that are not on turn only have the pass action
//! legal.

pub mod beacon;

use std::sync::Arc;

pub use beacon::{BeaconConfig, BeaconFactory, BeaconGame};

/// Index of a player within one game.
pub type Seat = usize;

/// Index into a game's discrete action space.
pub type Action = usize;

/// Coarse classification of an action, used for per-move statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MoveKind {
    Play,
    Discard,
    Hint,
    Pass,
}

impl MoveKind {
    /// Counter key used in actor statistics.
    pub fn stat_key(self) -> &'static str {
        match self {
            MoveKind::Play => "play",
            MoveKind::Discard => "discard",
            MoveKind::Hint => "hint",
            MoveKind::Pass => "pass",
        }
    }
}

/// The most recent non-pass move made in a game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastMove {
    pub seat: Seat,
    pub action: Action,
}

/// Everything one seat is allowed to see before acting.
#[derive(Debug, Clone)]
pub struct Observation {
    /// Seat this observation was produced for.
    pub seat: Seat,
    /// Seat whose move takes effect this step.
    pub current_seat: Seat,
    /// Encoded state, `feature_size(seat)` long.
    pub features: Vec<f32>,
    /// Legal action mask, `num_actions()` long.
    pub legal: Vec<bool>,
    pub last_move: Option<LastMove>,
    /// Actions that would currently succeed if taken by the next seat.
    ///
    /// Convention senders use this to decide whether a signal is warranted.
    pub partner_cues: Vec<Action>,
    /// Move kind of every action, shared by all observations of a game.
    pub catalog: Arc<[MoveKind]>,
}

impl Observation {
    pub fn num_actions(&self) -> usize {
        self.legal.len()
    }

    pub fn is_legal(&self, action: Action) -> bool {
        self.legal.get(action).copied().unwrap_or(false)
    }

    /// Indices of all legal actions, ascending.
    pub fn legal_actions(&self) -> Vec<Action> {
        self.legal
            .iter()
            .enumerate()
            .filter_map(|(a, &ok)| ok.then_some(a))
            .collect()
    }

    /// True if this seat's move is the one applied this step.
    pub fn on_turn(&self) -> bool {
        self.seat == self.current_seat
    }

    pub fn move_kind(&self, action: Action) -> Option<MoveKind> {
        self.catalog.get(action).copied()
    }
}

/// Result of advancing a game by one step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepResult {
    /// Team reward for this step.
    pub reward: f32,
    pub terminal: bool,
}

/// What an actor learns after the step its action took part in.
pub type Outcome = StepResult;

/// One running episode of a cooperative turn-based game.
pub trait GameEnv: Send + 'static {
    fn num_seats(&self) -> usize;

    fn feature_size(&self, seat: Seat) -> usize;

    fn num_actions(&self) -> usize;

    fn observe(&self, seat: Seat) -> Observation;

    /// Apply one action per seat. Only the current seat's action has effect.
    fn step(&mut self, actions: &[Action]) -> StepResult;

    fn terminated(&self) -> bool;

    /// Episode score so far; final once `terminated()`.
    fn score(&self) -> f32;

    /// Best score an episode can reach.
    fn max_score(&self) -> f32;

    /// True if the episode ended by exhausting its lives.
    fn bombed(&self) -> bool;

    fn step_count(&self) -> usize;

    /// Start a new episode.
    fn reset(&mut self);
}

/// Creates game instances for the actor grid and evaluator.
pub trait GameFactory: Send + Sync {
    type Game: GameEnv;

    /// Create `count` independent games seeded from `seed`.
    ///
    /// `bomb` is the number of lives; losing all of them zeroes the score.
    /// Episodes are truncated after `max_len` steps.
    fn create(
        &self,
        count: usize,
        seed: u64,
        num_seats: usize,
        bomb: usize,
        max_len: usize,
    ) -> Vec<Self::Game>;
}
