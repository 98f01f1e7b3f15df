//! Fixed-policy actors for evaluation baselines.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::actor::{assert_not_self, record_move, sibling_seats, Actor, ActorId, StatCounters};
use crate::convention::ConventionBinding;
use crate::environment::{Action, Observation, Outcome, Seat};
use crate::inference::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleBotKind {
    /// Uniformly random legal action.
    Uniform,
    /// Lowest-index legal action.
    FirstLegal,
}

impl fmt::Display for RuleBotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleBotKind::Uniform => f.write_str("uniform"),
            RuleBotKind::FirstLegal => f.write_str("first_legal"),
        }
    }
}

impl FromStr for RuleBotKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "uniform" => Ok(RuleBotKind::Uniform),
            "first_legal" => Ok(RuleBotKind::FirstLegal),
            other => Err(format!("unknown rule bot `{other}`")),
        }
    }
}

/// Actor that never consults an inference server.
pub struct RuleBot {
    id: ActorId,
    kind: RuleBotKind,
    convention: ConventionBinding,
    siblings: Vec<ActorId>,
    sibling_seats: Vec<Seat>,
    rng: fastrand::Rng,
    stats: StatCounters,
}

impl RuleBot {
    pub fn new(id: ActorId, kind: RuleBotKind, seed: u64) -> Self {
        Self {
            id,
            kind,
            convention: ConventionBinding::none(),
            siblings: Vec::new(),
            sibling_seats: Vec::new(),
            rng: fastrand::Rng::with_seed(seed),
            stats: StatCounters::new(),
        }
    }

    pub fn with_convention(mut self, convention: ConventionBinding) -> Self {
        self.convention = convention;
        self
    }

    pub fn kind(&self) -> RuleBotKind {
        self.kind
    }

    fn choose(&mut self, obs: &Observation) -> Action {
        let legal = obs.legal_actions();
        if legal.is_empty() {
            return 0;
        }
        match self.kind {
            RuleBotKind::Uniform => legal[self.rng.usize(..legal.len())],
            RuleBotKind::FirstLegal => legal[0],
        }
    }
}

impl Actor for RuleBot {
    fn id(&self) -> ActorId {
        self.id
    }

    fn siblings(&self) -> &[ActorId] {
        &self.siblings
    }

    fn set_siblings(&mut self, siblings: Vec<ActorId>) {
        assert_not_self(self.id, &siblings);
        self.sibling_seats = sibling_seats(&siblings);
        self.siblings = siblings;
    }

    fn prepare_act(&mut self, _obs: &Observation) -> Result<(), InferenceError> {
        Ok(())
    }

    fn act(&mut self, obs: &Observation) -> Result<Action, InferenceError> {
        let action = match self.convention.scripted_action(obs, &self.sibling_seats) {
            Some(action) => {
                self.stats.incr("convention_scripted");
                action
            }
            None => {
                let proposed = self.choose(obs);
                self.convention.steer(obs, proposed, &mut self.rng)
            }
        };
        record_move(obs, action, &mut self.stats);
        self.convention
            .record(obs, &self.sibling_seats, action, &mut self.stats);
        Ok(action)
    }

    fn observe_outcome(&mut self, outcome: &Outcome) -> Result<(), InferenceError> {
        if outcome.terminal {
            self.stats.incr("episodes");
        }
        Ok(())
    }

    fn stats(&self) -> &StatCounters {
        &self.stats
    }

    fn reset(&mut self) {}
}
