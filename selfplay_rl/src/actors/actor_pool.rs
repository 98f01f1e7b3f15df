//! Self-play actor pool.
//!
//! Builds the inference servers and the thread × game × seat actor grid for
//! training.
//!
//! # Architecture
//!
//! ```text
//! device d: online-d  (Act + ComputePriority)   partner-d (Act)
//!              ▲                                    ▲
//!   seat 0 of every game on threads t ≡ d      seats ≥ 1 of the same games
//!   (exploration, replay, weight pushes)       (frozen weights)
//! ```
//!
//! Cell `(t, g, p)` is served by device `t mod |D|`. Every actor's sibling
//! list holds the other seats of its game. The actors are handed to
//! game-thread loops by [`ActorPool::take_loops`]; the pool keeps the
//! servers and forwards weight updates to the online ones.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use super::actor::{Actor, ActorId};
use super::learned::{LearnedActor, DEFAULT_FRAGMENT_LEN};
use super::thread_loop::{GameThreadLoop, LoopMode};
use crate::buffers::FragmentReplay;
use crate::checkpoint::load_state_dict;
use crate::convention::{roles_for, ConventionBinding, ConventionError, ConventionSpec, Role};
use crate::environment::{GameEnv, GameFactory, Seat};
use crate::error::ConfigError;
use crate::inference::{InferenceError, InferenceServer, Method, MethodStats};
use crate::learner::WeightSink;
use crate::model::{Device, PolicyModel};
use crate::scheduling::ExplorationSchedule;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to load partner weights from {path}: {reason}")]
    PartnerWeights { path: String, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Convention(#[from] ConventionError),

    #[error("the actor grid was already handed to game loops")]
    GridTaken,

    #[error("game factory returned {actual} games, expected {expected}")]
    GameCount { expected: usize, actual: usize },
}

/// Configuration for the actor pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActorPoolConfig {
    /// One (online, partner) server pair per device.
    pub devices: Vec<Device>,
    pub num_threads: usize,
    pub games_per_thread: usize,
    pub num_seats: usize,
    /// Queue bound (and batch cap) of the online `Act` method.
    pub act_queue_capacity: usize,
    pub priority_queue_capacity: usize,
    pub partner_queue_capacity: usize,
    /// Steps after which an unfinished episode is cut into a fragment.
    pub fragment_len: usize,
    /// Episodes are truncated after this many steps.
    pub max_len: usize,
    /// Lives per game.
    pub bomb: usize,
    pub seed: u64,
    pub convention_sender: Seat,
    /// Let the convention override the learning seat's policy.
    pub override_learned: bool,
    /// Let the convention override the partner seats' policy.
    pub override_partner: bool,
}

impl Default for ActorPoolConfig {
    fn default() -> Self {
        Self {
            devices: vec![Device::cpu()],
            num_threads: 4,
            games_per_thread: 16,
            num_seats: 2,
            act_queue_capacity: 5000,
            priority_queue_capacity: 100,
            partner_queue_capacity: 5000,
            fragment_len: DEFAULT_FRAGMENT_LEN,
            max_len: 80,
            bomb: 1,
            seed: 1,
            convention_sender: 0,
            override_learned: false,
            override_partner: true,
        }
    }
}

impl ActorPoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_devices(mut self, devices: Vec<Device>) -> Self {
        self.devices = devices;
        self
    }

    pub fn with_threads(mut self, n: usize) -> Self {
        self.num_threads = n;
        self
    }

    pub fn with_games_per_thread(mut self, n: usize) -> Self {
        self.games_per_thread = n;
        self
    }

    pub fn with_seats(mut self, n: usize) -> Self {
        self.num_seats = n;
        self
    }

    pub fn with_fragment_len(mut self, n: usize) -> Self {
        self.fragment_len = n;
        self
    }

    pub fn with_max_len(mut self, n: usize) -> Self {
        self.max_len = n;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_convention_sender(mut self, sender: Seat) -> Self {
        self.convention_sender = sender;
        self
    }

    pub fn with_overrides(mut self, learned: bool, partner: bool) -> Self {
        self.override_learned = learned;
        self.override_partner = partner;
        self
    }

    /// Total actors in the grid.
    pub fn num_actors(&self) -> usize {
        self.num_threads * self.games_per_thread * self.num_seats
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::Invalid("at least one device is required".into()));
        }
        ConfigError::check_nonzero("num_threads", self.num_threads)?;
        ConfigError::check_nonzero("games_per_thread", self.games_per_thread)?;
        if self.num_seats < 2 {
            return Err(ConfigError::Invalid(format!(
                "self-play needs at least 2 seats, got {}",
                self.num_seats
            )));
        }
        ConfigError::check_nonzero("act_queue_capacity", self.act_queue_capacity)?;
        ConfigError::check_nonzero("priority_queue_capacity", self.priority_queue_capacity)?;
        ConfigError::check_nonzero("partner_queue_capacity", self.partner_queue_capacity)?;
        ConfigError::check_nonzero("fragment_len", self.fragment_len)?;
        ConfigError::check_nonzero("max_len", self.max_len)?;
        if self.convention_sender >= self.num_seats {
            return Err(ConfigError::Invalid(format!(
                "convention sender {} is not a seat of a {}-seat game",
                self.convention_sender, self.num_seats
            )));
        }
        Ok(())
    }
}

/// Where the frozen partner seats get their weights.
#[derive(Debug, Clone)]
pub enum PartnerWeights<M> {
    /// A frozen copy of the initial online model.
    SameAsOnline,
    /// A checkpoint written by the top-k saver.
    File(PathBuf),
    Model(M),
}

/// The servers of one device.
pub struct ServerPair<M: PolicyModel> {
    pub online: Arc<InferenceServer<M>>,
    pub partner: Arc<InferenceServer<M>>,
}

/// Static description of one grid cell.
#[derive(Debug, Clone, PartialEq)]
pub struct GridEntry {
    pub id: ActorId,
    pub siblings: Vec<ActorId>,
    /// Name of the server this actor submits to.
    pub server: String,
    pub learning: bool,
    pub role: Role,
    pub epsilon: f32,
}

type ThreadGrid = Vec<Vec<Box<dyn Actor>>>;

/// Owns the training servers and, until handed off, the actor grid.
pub struct ActorPool<M: PolicyModel> {
    config: ActorPoolConfig,
    convention: Arc<ConventionSpec>,
    servers: Vec<ServerPair<M>>,
    grid: Option<Vec<ThreadGrid>>,
    manifest: Vec<GridEntry>,
}

impl<M: PolicyModel> ActorPool<M> {
    /// Build servers and the actor grid. Servers are not started.
    pub fn new(
        config: ActorPoolConfig,
        model: &M,
        partner: PartnerWeights<M>,
        exploration: &ExplorationSchedule,
        convention: Arc<ConventionSpec>,
        replay: Arc<FragmentReplay>,
    ) -> Result<Self, PoolError> {
        config.validate()?;
        if exploration.len() != config.num_threads {
            return Err(ConfigError::Invalid(format!(
                "exploration schedule has {} rates for {} threads",
                exploration.len(),
                config.num_threads
            ))
            .into());
        }
        let roles = roles_for(config.convention_sender, config.num_seats)?;
        let partner_model = resolve_partner(model, partner)?;

        let mut servers = Vec::with_capacity(config.devices.len());
        for (d, device) in config.devices.iter().enumerate() {
            let online = InferenceServer::new(format!("online-{d}"), device.clone(), model.to_device(device));
            online.register(Method::Act, config.act_queue_capacity)?;
            online.register(Method::ComputePriority, config.priority_queue_capacity)?;
            let frozen = InferenceServer::new(
                format!("partner-{d}"),
                device.clone(),
                partner_model.to_device(device),
            );
            frozen.register(Method::Act, config.partner_queue_capacity)?;
            servers.push(ServerPair {
                online: Arc::new(online),
                partner: Arc::new(frozen),
            });
        }

        let mut grid = Vec::with_capacity(config.num_threads);
        let mut manifest = Vec::with_capacity(config.num_actors());
        for t in 0..config.num_threads {
            let pair = &servers[t % servers.len()];
            let mut thread_games: ThreadGrid = Vec::with_capacity(config.games_per_thread);
            for g in 0..config.games_per_thread {
                let ids: Vec<ActorId> = (0..config.num_seats).map(|p| ActorId::new(t, g, p)).collect();
                let mut seats: Vec<Box<dyn Actor>> = Vec::with_capacity(config.num_seats);
                for &id in &ids {
                    let learning = id.seat == 0;
                    let role = roles[id.seat];
                    let overrides = if learning {
                        config.override_learned
                    } else {
                        config.override_partner
                    };
                    let binding = ConventionBinding::new(Arc::clone(&convention), role, overrides);
                    let seed = actor_seed(config.seed, &id);
                    let (actor, server, epsilon) = if learning {
                        let epsilon = exploration.rate(t);
                        let actor = LearnedActor::new(id, Arc::clone(&pair.online), seed)
                            .with_epsilon(epsilon)
                            .with_convention(binding)
                            .with_replay(Arc::clone(&replay), config.fragment_len);
                        (actor, pair.online.name().to_string(), epsilon)
                    } else {
                        let actor = LearnedActor::new(id, Arc::clone(&pair.partner), seed)
                            .with_convention(binding);
                        (actor, pair.partner.name().to_string(), 0.0)
                    };
                    let mut actor: Box<dyn Actor> = Box::new(actor);
                    let siblings: Vec<ActorId> = ids.iter().copied().filter(|s| *s != id).collect();
                    actor.set_siblings(siblings.clone());
                    manifest.push(GridEntry {
                        id,
                        siblings,
                        server,
                        learning,
                        role,
                        epsilon,
                    });
                    seats.push(actor);
                }
                thread_games.push(seats);
            }
            grid.push(thread_games);
        }

        log::info!(
            "actor pool: {} devices, {} threads x {} games x {} seats = {} actors",
            config.devices.len(),
            config.num_threads,
            config.games_per_thread,
            config.num_seats,
            manifest.len()
        );
        Ok(Self {
            config,
            convention,
            servers,
            grid: Some(grid),
            manifest,
        })
    }

    pub fn config(&self) -> &ActorPoolConfig {
        &self.config
    }

    pub fn servers(&self) -> &[ServerPair<M>] {
        &self.servers
    }

    /// One entry per actor, in (thread, game, seat) order.
    pub fn manifest(&self) -> &[GridEntry] {
        &self.manifest
    }

    /// Start every server.
    pub fn start(&self) -> Result<(), PoolError> {
        for pair in &self.servers {
            pair.online.start()?;
            pair.partner.start()?;
        }
        Ok(())
    }

    /// Stop every server, failing requests still queued.
    pub fn stop(&self) {
        for pair in &self.servers {
            pair.online.stop();
            pair.partner.stop();
        }
    }

    /// Serve `model` on every online server. Partner servers are untouched.
    pub fn update_model(&self, model: &M) {
        for pair in &self.servers {
            pair.online
                .replace_weights(model.to_device(pair.online.device()));
        }
    }

    /// `Act` throughput summed over the online servers.
    pub fn act_stats(&self) -> MethodStats {
        self.servers
            .iter()
            .map(|p| p.online.stats(Method::Act))
            .fold(MethodStats::default(), |acc, s| MethodStats {
                batches: acc.batches + s.batches,
                requests: acc.requests + s.requests,
            })
    }

    /// Create the games and move the actor grid into one loop per thread.
    pub fn take_loops<F: GameFactory>(
        &mut self,
        factory: &F,
        mode: LoopMode,
    ) -> Result<Vec<GameThreadLoop<F::Game>>, PoolError> {
        let grid = self.grid.take().ok_or(PoolError::GridTaken)?;
        let mut loops = Vec::with_capacity(grid.len());
        for (t, thread_games) in grid.into_iter().enumerate() {
            let games = factory.create(
                self.config.games_per_thread,
                thread_seed(self.config.seed, t),
                self.config.num_seats,
                self.config.bomb,
                self.config.max_len,
            );
            if games.len() != thread_games.len() {
                return Err(PoolError::GameCount {
                    expected: thread_games.len(),
                    actual: games.len(),
                });
            }
            if let Some(game) = games.first() {
                self.convention.validate(game.num_actions())?;
            }
            let mut game_loop = GameThreadLoop::new(t, mode);
            for (game, actors) in games.into_iter().zip(thread_games) {
                game_loop.add_slot(game, actors);
            }
            loops.push(game_loop);
        }
        Ok(loops)
    }
}

impl<M: PolicyModel> WeightSink<M> for ActorPool<M> {
    fn push_weights(&self, model: &M) {
        self.update_model(model);
    }
}

fn resolve_partner<M: PolicyModel>(model: &M, partner: PartnerWeights<M>) -> Result<M, PoolError> {
    match partner {
        PartnerWeights::SameAsOnline => Ok(model.clone()),
        PartnerWeights::Model(m) => Ok(m),
        PartnerWeights::File(path) => {
            let failed = |reason: String| PoolError::PartnerWeights {
                path: path.display().to_string(),
                reason,
            };
            let state = load_state_dict(&path).map_err(|e| failed(e.to_string()))?;
            let mut partner = model.clone();
            partner
                .load_state_dict(&state)
                .map_err(|e| failed(e.to_string()))?;
            log::info!("loaded partner weights from {}", path.display());
            Ok(partner)
        }
    }
}

/// Game seed of thread `t`.
pub(crate) fn thread_seed(seed: u64, t: usize) -> u64 {
    seed.wrapping_add((t as u64).wrapping_mul(1_000_003))
}

/// Distinct, reproducible seed per grid cell.
pub(crate) fn actor_seed(seed: u64, id: &ActorId) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15)
        .wrapping_add((id.thread as u64) << 32)
        .wrapping_add((id.game as u64) << 8)
        .wrapping_add(id.seat as u64)
}
