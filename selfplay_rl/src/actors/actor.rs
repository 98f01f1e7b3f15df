//! The capability set every seat-playing actor exposes.
//!
//! The game-thread loop drives actors in two phases so that one thread's
//! requests for all of its games reach the inference server together:
//!
//! 1. [`Actor::prepare_act`] for every seat of every live game
//! 2. [`Actor::act`] in seat order, which resolves the reply from phase 1
//!
//! Rule-based actors implement the same trait and simply ignore phase 1.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::environment::{Action, Observation, Outcome, Seat};
use crate::inference::InferenceError;

/// Grid coordinates of one actor: (thread, game on that thread, seat).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActorId {
    pub thread: usize,
    pub game: usize,
    pub seat: Seat,
}

impl ActorId {
    pub fn new(thread: usize, game: usize, seat: Seat) -> Self {
        Self { thread, game, seat }
    }

    /// True if `other` plays in the same game instance.
    pub fn same_game(&self, other: &ActorId) -> bool {
        self.thread == other.thread && self.game == other.game
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}/g{}/s{}", self.thread, self.game, self.seat)
    }
}

/// Named event counters accumulated over an actor's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatCounters {
    counts: BTreeMap<String, u64>,
}

impl StatCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&mut self, key: &str) {
        self.add(key, 1);
    }

    pub fn add(&mut self, key: &str, n: u64) {
        *self.counts.entry(key.to_string()).or_insert(0) += n;
    }

    /// Count for `key`, zero if never incremented.
    pub fn get(&self, key: &str) -> u64 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    /// Add every counter of `other` into `self`.
    pub fn merge(&mut self, other: &StatCounters) {
        for (key, &n) in &other.counts {
            self.add(key, n);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.counts.iter().map(|(k, &v)| (k.as_str(), v))
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

/// One seat of one game instance.
pub trait Actor: Send {
    fn id(&self) -> ActorId;

    /// The other actors of this actor's game, never including itself.
    fn siblings(&self) -> &[ActorId];

    /// Wire the sibling list.
    ///
    /// # Panics
    ///
    /// Panics if `siblings` contains this actor's own id.
    fn set_siblings(&mut self, siblings: Vec<ActorId>);

    /// Issue the inference request for `obs` without waiting for it.
    fn prepare_act(&mut self, obs: &Observation) -> Result<(), InferenceError>;

    /// Choose an action for `obs`, resolving a prepared request if any.
    fn act(&mut self, obs: &Observation) -> Result<Action, InferenceError>;

    /// Record the outcome of the step the last action took part in.
    fn observe_outcome(&mut self, outcome: &Outcome) -> Result<(), InferenceError>;

    /// Counters accumulated since construction.
    fn stats(&self) -> &StatCounters;

    /// Forget per-episode state before the game is reset.
    fn reset(&mut self);
}

/// Check a sibling list against the owner's id.
pub(crate) fn assert_not_self(id: ActorId, siblings: &[ActorId]) {
    assert!(
        !siblings.contains(&id),
        "actor {id} appears in its own sibling list"
    );
}

/// Seats of `siblings`, for convention lookups.
pub(crate) fn sibling_seats(siblings: &[ActorId]) -> Vec<Seat> {
    siblings.iter().map(|s| s.seat).collect()
}

/// Count the move kind of an action the actor actually made.
pub(crate) fn record_move(obs: &Observation, action: Action, stats: &mut StatCounters) {
    if !obs.on_turn() {
        return;
    }
    stats.incr("moves");
    if let Some(kind) = obs.move_kind(action) {
        stats.incr(kind.stat_key());
    }
}
