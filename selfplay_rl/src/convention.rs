//! Fixed signal/response conventions between cooperating seats.
//!
//! A convention is an ordered list of `(signal, response)` action pairs
//! loaded from a JSON file such as `[[6, 0], [7, 1]]`. In every game one seat
//! is the sender and the others are receivers:
//!
//! - a sender should play `signal` when the next seat could profitably play
//!   `response` and `signal` is legal;
//! - a receiver should play `response` right after a sibling played `signal`.
//!
//! With the override flag set, the scripted move replaces the policy's
//! choice in matching situations, and a convention move the situation does
//! not warrant is swapped for a random other legal move. Without it the
//! convention is only used for statistics.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::actors::StatCounters;
use crate::environment::{Action, Observation, Seat};

#[derive(Debug, Error)]
pub enum ConventionError {
    #[error("failed to read convention file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed convention: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("convention action {action} is outside the action space of size {num_actions}")]
    ActionOutOfRange { action: Action, num_actions: usize },

    #[error("convention sender seat {sender} does not exist in a {num_seats}-seat game")]
    BadSender { sender: Seat, num_seats: usize },
}

/// Ordered `(signal, response)` pairs. Empty means no convention.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConventionSpec {
    pairs: Vec<(Action, Action)>,
}

impl ConventionSpec {
    pub fn new(pairs: Vec<(Action, Action)>) -> Self {
        Self { pairs }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_json(text: &str) -> Result<Self, ConventionError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConventionError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConventionError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn pairs(&self) -> &[(Action, Action)] {
        &self.pairs
    }

    /// Check every action exists in a game with `num_actions` actions.
    pub fn validate(&self, num_actions: usize) -> Result<(), ConventionError> {
        for &(signal, response) in &self.pairs {
            for action in [signal, response] {
                if action >= num_actions {
                    return Err(ConventionError::ActionOutOfRange { action, num_actions });
                }
            }
        }
        Ok(())
    }

    fn is_signal(&self, action: Action) -> bool {
        self.pairs.iter().any(|&(s, _)| s == action)
    }

    fn is_response(&self, action: Action) -> bool {
        self.pairs.iter().any(|&(_, r)| r == action)
    }
}

/// Which side of the convention a seat plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

/// Role of every seat when `sender` is the sending seat.
///
/// With two seats, `sender = 0` gives `[Sender, Receiver]` and `sender = 1`
/// gives `[Receiver, Sender]`.
pub fn roles_for(sender: Seat, num_seats: usize) -> Result<Vec<Role>, ConventionError> {
    if sender >= num_seats {
        return Err(ConventionError::BadSender { sender, num_seats });
    }
    Ok((0..num_seats)
        .map(|seat| if seat == sender { Role::Sender } else { Role::Receiver })
        .collect())
}

/// One actor's view of the convention.
#[derive(Debug, Clone)]
pub struct ConventionBinding {
    spec: Arc<ConventionSpec>,
    role: Role,
    override_policy: bool,
}

impl ConventionBinding {
    pub fn new(spec: Arc<ConventionSpec>, role: Role, override_policy: bool) -> Self {
        Self {
            spec,
            role,
            override_policy,
        }
    }

    /// Binding that never overrides and records nothing.
    pub fn none() -> Self {
        Self::new(Arc::new(ConventionSpec::empty()), Role::Receiver, false)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// True when matching situations bypass the policy.
    pub fn overrides(&self) -> bool {
        self.override_policy && !self.spec.is_empty()
    }

    /// The convention move this observation calls for, if any.
    pub fn warranted(&self, obs: &Observation, siblings: &[Seat]) -> Option<Action> {
        if !obs.on_turn() {
            return None;
        }
        match self.role {
            Role::Sender => self
                .spec
                .pairs()
                .iter()
                .find(|&&(signal, response)| {
                    obs.partner_cues.contains(&response) && obs.is_legal(signal)
                })
                .map(|&(signal, _)| signal),
            Role::Receiver => {
                let last = obs.last_move.filter(|m| siblings.contains(&m.seat))?;
                self.spec
                    .pairs()
                    .iter()
                    .find(|&&(signal, response)| last.action == signal && obs.is_legal(response))
                    .map(|&(_, response)| response)
            }
        }
    }

    /// Scripted action when overriding and the situation matches.
    pub fn scripted_action(&self, obs: &Observation, siblings: &[Seat]) -> Option<Action> {
        if !self.overrides() {
            return None;
        }
        self.warranted(obs, siblings)
    }

    /// Replace an unwarranted convention move with a random other legal move.
    ///
    /// Only called for moves the scripted path did not choose.
    pub fn steer(&self, obs: &Observation, proposed: Action, rng: &mut fastrand::Rng) -> Action {
        if !self.overrides() {
            return proposed;
        }
        let is_convention_move = |a: Action| match self.role {
            Role::Sender => self.spec.is_signal(a),
            Role::Receiver => self.spec.is_response(a),
        };
        if !is_convention_move(proposed) {
            return proposed;
        }
        let alternatives: Vec<Action> = obs
            .legal_actions()
            .into_iter()
            .filter(|&a| !is_convention_move(a))
            .collect();
        if alternatives.is_empty() {
            return proposed;
        }
        alternatives[rng.usize(..alternatives.len())]
    }

    /// Count convention availability and use for the move actually played.
    pub fn record(
        &self,
        obs: &Observation,
        siblings: &[Seat],
        action: Action,
        stats: &mut StatCounters,
    ) {
        if self.spec.is_empty() || !obs.on_turn() {
            return;
        }
        let warranted = self.warranted(obs, siblings);
        if warranted.is_some() {
            stats.incr("convention_available");
        }
        let is_convention_move = match self.role {
            Role::Sender => self.spec.is_signal(action),
            Role::Receiver => self.spec.is_response(action),
        };
        if is_convention_move {
            stats.incr("convention_played");
            if warranted == Some(action) {
                stats.incr("convention_played_correct");
            } else {
                stats.incr("convention_played_incorrect");
            }
        }
    }
}
