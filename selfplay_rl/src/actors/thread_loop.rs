//! Game-thread loops.
//!
//! A [`GameThreadLoop`] owns a fixed set of games and the actors seated in
//! them, and advances every live game by one step per cycle:
//!
//! ```text
//! 1. reset (train) or retire (eval) games that finished
//! 2. observe + prepare_act for every seat of every live game
//! 3. act in seat order, step each game
//! 4. deliver the step outcome to every seat
//! ```
//!
//! Phase 2 issues all of the thread's inference requests before phase 3
//! waits on any of them, so they can land in the same server batch.
//!
//! [`ThreadLoopContext`] runs each loop on its own named OS thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::actor::Actor;
use crate::environment::{GameEnv, Observation, StepResult};
use crate::inference::InferenceError;

/// Whether finished games restart or retire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopMode {
    /// Reset finished games and run until stopped.
    Train,
    /// Play one episode per game, then exit.
    Eval,
}

/// A finished episode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EpisodeRecord {
    pub thread: usize,
    pub game: usize,
    pub score: f32,
    pub perfect: bool,
    pub bombed: bool,
    pub steps: usize,
}

/// Live counters shared by every loop of a context.
#[derive(Debug, Default)]
pub struct LoopProgress {
    episodes: AtomicU64,
    steps: AtomicU64,
    score_sum: Mutex<f64>,
}

impl LoopProgress {
    fn record(&self, episode: &EpisodeRecord) {
        self.episodes.fetch_add(1, Ordering::Relaxed);
        *self.score_sum.lock() += episode.score as f64;
    }

    pub fn episodes(&self) -> u64 {
        self.episodes.load(Ordering::Relaxed)
    }

    pub fn steps(&self) -> u64 {
        self.steps.load(Ordering::Relaxed)
    }

    /// Mean score of every episode finished so far.
    pub fn mean_score(&self) -> f64 {
        let n = self.episodes();
        if n == 0 {
            0.0
        } else {
            *self.score_sum.lock() / n as f64
        }
    }
}

/// What a loop hands back when it exits.
pub struct LoopOutcome {
    pub index: usize,
    pub episodes: Vec<EpisodeRecord>,
    pub actors: Vec<Box<dyn Actor>>,
    /// Set when the loop ended on an error other than a server shutdown.
    pub error: Option<InferenceError>,
}

struct GameSlot<G> {
    game: G,
    actors: Vec<Box<dyn Actor>>,
    retired: bool,
}

/// Drives a fixed subset of games and their actors.
pub struct GameThreadLoop<G: GameEnv> {
    index: usize,
    mode: LoopMode,
    slots: Vec<GameSlot<G>>,
}

impl<G: GameEnv> GameThreadLoop<G> {
    pub fn new(index: usize, mode: LoopMode) -> Self {
        Self {
            index,
            mode,
            slots: Vec::new(),
        }
    }

    /// Add a game with one actor per seat, in seat order.
    ///
    /// # Panics
    ///
    /// Panics if the actor count does not match the game's seat count.
    pub fn add_slot(&mut self, game: G, actors: Vec<Box<dyn Actor>>) {
        assert_eq!(
            actors.len(),
            game.num_seats(),
            "one actor per seat is required"
        );
        self.slots.push(GameSlot {
            game,
            actors,
            retired: false,
        });
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn num_games(&self) -> usize {
        self.slots.len()
    }

    /// Actors of game `game`, in seat order.
    pub fn game_actors(&self, game: usize) -> &[Box<dyn Actor>] {
        self.slots
            .get(game)
            .map(|s| s.actors.as_slice())
            .unwrap_or(&[])
    }

    /// Run until `stop` is set or, in eval mode, every game has finished.
    pub fn run(mut self, stop: &AtomicBool, progress: &LoopProgress) -> LoopOutcome {
        let mut episodes = Vec::new();
        let mut error = None;
        while !stop.load(Ordering::Acquire) {
            match self.cycle(&mut episodes, progress) {
                Ok(true) => {}
                Ok(false) => break,
                Err(InferenceError::Stopped) => {
                    log::debug!("game loop {} exiting: server stopped", self.index);
                    break;
                }
                Err(e) => {
                    log::error!("game loop {} failed: {}", self.index, e);
                    error = Some(e);
                    break;
                }
            }
        }
        LoopOutcome {
            index: self.index,
            episodes,
            actors: self.slots.into_iter().flat_map(|s| s.actors).collect(),
            error,
        }
    }

    /// One step of every live game. Returns false once nothing is live.
    fn cycle(
        &mut self,
        episodes: &mut Vec<EpisodeRecord>,
        progress: &LoopProgress,
    ) -> Result<bool, InferenceError> {
        for (g, slot) in self.slots.iter_mut().enumerate() {
            if slot.retired || !slot.game.terminated() {
                continue;
            }
            let episode = EpisodeRecord {
                thread: self.index,
                game: g,
                score: slot.game.score(),
                perfect: slot.game.score() >= slot.game.max_score(),
                bombed: slot.game.bombed(),
                steps: slot.game.step_count(),
            };
            progress.record(&episode);
            episodes.push(episode);
            match self.mode {
                LoopMode::Train => {
                    slot.game.reset();
                    for actor in &mut slot.actors {
                        actor.reset();
                    }
                }
                LoopMode::Eval => slot.retired = true,
            }
        }
        if self.slots.iter().all(|s| s.retired) {
            return Ok(false);
        }

        let mut observations: Vec<Vec<Observation>> = Vec::with_capacity(self.slots.len());
        for slot in &mut self.slots {
            if slot.retired {
                observations.push(Vec::new());
                continue;
            }
            let mut seat_obs = Vec::with_capacity(slot.actors.len());
            for (seat, actor) in slot.actors.iter_mut().enumerate() {
                let obs = slot.game.observe(seat);
                actor.prepare_act(&obs)?;
                seat_obs.push(obs);
            }
            observations.push(seat_obs);
        }

        let mut results: Vec<Option<StepResult>> = Vec::with_capacity(self.slots.len());
        for (slot, seat_obs) in self.slots.iter_mut().zip(&observations) {
            if slot.retired {
                results.push(None);
                continue;
            }
            let mut actions = Vec::with_capacity(slot.actors.len());
            for (actor, obs) in slot.actors.iter_mut().zip(seat_obs) {
                actions.push(actor.act(obs)?);
            }
            results.push(Some(slot.game.step(&actions)));
        }
        progress.steps.fetch_add(1, Ordering::Relaxed);

        for (slot, result) in self.slots.iter_mut().zip(results) {
            let Some(result) = result else { continue };
            for actor in &mut slot.actors {
                actor.observe_outcome(&result)?;
            }
        }
        Ok(true)
    }
}

/// Runs game loops on dedicated threads.
pub struct ThreadLoopContext<G: GameEnv> {
    pending: Vec<GameThreadLoop<G>>,
    handles: Vec<JoinHandle<LoopOutcome>>,
    stop: Arc<AtomicBool>,
    progress: Arc<LoopProgress>,
}

impl<G: GameEnv> ThreadLoopContext<G> {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            handles: Vec::new(),
            stop: Arc::new(AtomicBool::new(false)),
            progress: Arc::new(LoopProgress::default()),
        }
    }

    pub fn push(&mut self, game_loop: GameThreadLoop<G>) {
        self.pending.push(game_loop);
    }

    pub fn progress(&self) -> &Arc<LoopProgress> {
        &self.progress
    }

    pub fn num_loops(&self) -> usize {
        self.pending.len() + self.handles.len()
    }

    /// Spawn one thread per pushed loop.
    pub fn start(&mut self) {
        for game_loop in self.pending.drain(..) {
            let stop = Arc::clone(&self.stop);
            let progress = Arc::clone(&self.progress);
            let handle = std::thread::Builder::new()
                .name(format!("game-loop-{}", game_loop.index()))
                .spawn(move || game_loop.run(&stop, &progress))
                .expect("failed to spawn game loop thread");
            self.handles.push(handle);
        }
    }

    /// Ask every loop to exit after its current cycle.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Wait for every started loop and collect what it returned.
    pub fn join(&mut self) -> Vec<LoopOutcome> {
        let mut outcomes = Vec::with_capacity(self.handles.len());
        for handle in self.handles.drain(..) {
            match handle.join() {
                Ok(outcome) => outcomes.push(outcome),
                Err(_) => log::error!("game loop thread panicked"),
            }
        }
        outcomes.sort_by_key(|o| o.index);
        outcomes
    }
}

impl<G: GameEnv> Default for ThreadLoopContext<G> {
    fn default() -> Self {
        Self::new()
    }
}
