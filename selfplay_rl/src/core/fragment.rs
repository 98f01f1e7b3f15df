//! Trajectory fragments emitted by learning seats.
//!
//! A fragment is a contiguous run of one seat's steps. Actors cut a fragment
//! when the episode ends or when it reaches `max_len` steps; in the latter
//! case the next observation is kept as the bootstrap state.

use crate::environment::{Action, Observation, Seat};

/// Contiguous run of transitions from one seat.
#[derive(Debug, Clone, PartialEq)]
pub struct Fragment {
    pub seat: Seat,
    pub features: Vec<Vec<f32>>,
    pub legal: Vec<Vec<bool>>,
    pub actions: Vec<Action>,
    pub rewards: Vec<f32>,
    pub terminals: Vec<bool>,
    /// Features and legal mask after the last step, absent when it was terminal.
    pub bootstrap: Option<(Vec<f32>, Vec<bool>)>,
}

impl Fragment {
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Features and legal mask of the state following step `t`, if any.
    pub fn next_state(&self, t: usize) -> Option<(&[f32], &[bool])> {
        if self.terminals.get(t).copied().unwrap_or(true) {
            return None;
        }
        if t + 1 < self.len() {
            return Some((&self.features[t + 1], &self.legal[t + 1]));
        }
        self.bootstrap
            .as_ref()
            .map(|(f, l)| (f.as_slice(), l.as_slice()))
    }

    pub fn total_reward(&self) -> f32 {
        self.rewards.iter().sum()
    }
}

/// Accumulates steps until a fragment boundary.
#[derive(Debug, Clone)]
pub(crate) struct FragmentBuilder {
    seat: Seat,
    features: Vec<Vec<f32>>,
    legal: Vec<Vec<bool>>,
    actions: Vec<Action>,
    rewards: Vec<f32>,
    terminals: Vec<bool>,
}

impl FragmentBuilder {
    pub(crate) fn new(seat: Seat) -> Self {
        Self {
            seat,
            features: Vec::new(),
            legal: Vec::new(),
            actions: Vec::new(),
            rewards: Vec::new(),
            terminals: Vec::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.actions.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// True once every recorded step has received its outcome.
    pub(crate) fn settled(&self) -> bool {
        self.rewards.len() == self.actions.len()
    }

    pub(crate) fn record_action(&mut self, obs: &Observation, action: Action) {
        self.features.push(obs.features.clone());
        self.legal.push(obs.legal.clone());
        self.actions.push(action);
    }

    /// Attach the outcome of the most recent action. Ignored if none is pending.
    pub(crate) fn record_outcome(&mut self, reward: f32, terminal: bool) {
        if self.settled() {
            return;
        }
        self.rewards.push(reward);
        self.terminals.push(terminal);
    }

    /// Take the settled steps as a fragment, leaving the builder empty.
    pub(crate) fn finish(&mut self, bootstrap: Option<&Observation>) -> Fragment {
        let keep = self.rewards.len();
        Fragment {
            seat: self.seat,
            features: self.features.drain(..keep).collect(),
            legal: self.legal.drain(..keep).collect(),
            actions: self.actions.drain(..keep).collect(),
            rewards: std::mem::take(&mut self.rewards),
            terminals: std::mem::take(&mut self.terminals),
            bootstrap: bootstrap.map(|o| (o.features.clone(), o.legal.clone())),
        }
    }

    pub(crate) fn clear(&mut self) {
        self.features.clear();
        self.legal.clear();
        self.actions.clear();
        self.rewards.clear();
        self.terminals.clear();
    }
}
