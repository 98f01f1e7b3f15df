//! Actor backed by a batched inference server.

use std::sync::Arc;

use super::actor::{assert_not_self, record_move, sibling_seats, Actor, ActorId, StatCounters};
use crate::buffers::FragmentReplay;
use crate::convention::ConventionBinding;
use crate::core::FragmentBuilder;
use crate::environment::{Action, Observation, Outcome, Seat};
use crate::inference::{InferenceError, InferenceServer, PendingReply};
use crate::model::{greedy_legal, PolicyModel};

/// Default number of steps after which an unfinished episode is cut into a
/// fragment.
pub const DEFAULT_FRAGMENT_LEN: usize = 80;

/// Plays one seat with epsilon-greedy actions from a served model.
///
/// When a replay buffer is bound, the actor records every step it takes
/// part in and pushes a fragment at episode end or every `fragment_len`
/// steps, with an initial priority computed by its server.
pub struct LearnedActor<M: PolicyModel> {
    id: ActorId,
    server: Arc<InferenceServer<M>>,
    epsilon: f32,
    convention: ConventionBinding,
    replay: Option<Arc<FragmentReplay>>,
    fragment_len: usize,
    siblings: Vec<ActorId>,
    sibling_seats: Vec<Seat>,
    rng: fastrand::Rng,
    pending: Option<PendingReply<Vec<f32>>>,
    builder: FragmentBuilder,
    stats: StatCounters,
}

impl<M: PolicyModel> LearnedActor<M> {
    pub fn new(id: ActorId, server: Arc<InferenceServer<M>>, seed: u64) -> Self {
        Self {
            id,
            server,
            epsilon: 0.0,
            convention: ConventionBinding::none(),
            replay: None,
            fragment_len: DEFAULT_FRAGMENT_LEN,
            siblings: Vec::new(),
            sibling_seats: Vec::new(),
            rng: fastrand::Rng::with_seed(seed),
            pending: None,
            builder: FragmentBuilder::new(id.seat),
            stats: StatCounters::new(),
        }
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn with_convention(mut self, convention: ConventionBinding) -> Self {
        self.convention = convention;
        self
    }

    /// Bind a replay buffer; fragments are cut every `fragment_len` steps.
    pub fn with_replay(mut self, replay: Arc<FragmentReplay>, fragment_len: usize) -> Self {
        self.replay = Some(replay);
        self.fragment_len = fragment_len.max(1);
        self
    }

    pub fn epsilon(&self) -> f32 {
        self.epsilon
    }

    pub fn server(&self) -> &Arc<InferenceServer<M>> {
        &self.server
    }

    fn flush(&mut self, bootstrap: Option<&Observation>) -> Result<(), InferenceError> {
        let Some(replay) = &self.replay else {
            return Ok(());
        };
        if self.builder.is_empty() {
            return Ok(());
        }
        let fragment = Arc::new(self.builder.finish(bootstrap));
        if fragment.is_empty() {
            return Ok(());
        }
        let priority = self.server.compute_priority(Arc::clone(&fragment))?;
        replay.push(fragment, priority);
        self.stats.incr("fragments");
        Ok(())
    }
}

impl<M: PolicyModel> Actor for LearnedActor<M> {
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

    fn prepare_act(&mut self, obs: &Observation) -> Result<(), InferenceError> {
        self.pending = None;
        if self
            .convention
            .scripted_action(obs, &self.sibling_seats)
            .is_some()
        {
            return Ok(());
        }
        self.pending = Some(self.server.act_async(obs.clone())?);
        Ok(())
    }

    fn act(&mut self, obs: &Observation) -> Result<Action, InferenceError> {
        if self.builder.len() >= self.fragment_len && self.builder.settled() {
            self.flush(Some(obs))?;
        }

        let scripted = self.convention.scripted_action(obs, &self.sibling_seats);
        let action = match scripted {
            Some(action) => {
                self.pending = None;
                action
            }
            None => {
                let values = match self.pending.take() {
                    Some(pending) => pending.wait()?,
                    None => self.server.act(obs.clone())?,
                };
                let greedy = greedy_legal(&values, &obs.legal).unwrap_or(0);
                let chosen = if self.epsilon > 0.0 && self.rng.f32() < self.epsilon {
                    let legal = obs.legal_actions();
                    if legal.is_empty() {
                        greedy
                    } else {
                        legal[self.rng.usize(..legal.len())]
                    }
                } else {
                    greedy
                };
                self.convention.steer(obs, chosen, &mut self.rng)
            }
        };

        if scripted.is_some() {
            self.stats.incr("convention_scripted");
        }
        record_move(obs, action, &mut self.stats);
        self.convention
            .record(obs, &self.sibling_seats, action, &mut self.stats);
        if self.replay.is_some() {
            self.builder.record_action(obs, action);
        }
        Ok(action)
    }

    fn observe_outcome(&mut self, outcome: &Outcome) -> Result<(), InferenceError> {
        if self.replay.is_some() {
            self.builder.record_outcome(outcome.reward, outcome.terminal);
            if outcome.terminal {
                self.flush(None)?;
            }
        }
        if outcome.terminal {
            self.stats.incr("episodes");
        }
        Ok(())
    }

    fn stats(&self) -> &StatCounters {
        &self.stats
    }

    fn reset(&mut self) {
        self.pending = None;
        self.builder.clear();
    }
}
