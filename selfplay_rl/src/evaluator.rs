//! Non-learning evaluation harness.
//!
//! [`evaluate`] seats a mix of learned models and rule bots, plays a fixed
//! number of episodes split evenly across game threads, and returns every
//! finished episode together with the actors that played them. No weights
//! are pushed and nothing is written to a replay buffer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::actors::actor_pool::{actor_seed, thread_seed};
use crate::actors::{
    Actor, ActorId, EpisodeRecord, GameThreadLoop, LearnedActor, LoopMode, RuleBot, RuleBotKind,
    StatCounters, ThreadLoopContext,
};
use crate::convention::{roles_for, ConventionBinding, ConventionError, ConventionSpec};
use crate::environment::{GameEnv, GameFactory, MoveKind, Seat};
use crate::error::ConfigError;
use crate::inference::{InferenceError, InferenceServer, Method};
use crate::model::{Device, PolicyModel};

#[derive(Debug, Error)]
pub enum EvalError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{actual} agents for a {expected}-seat game")]
    AgentCount { expected: usize, actual: usize },

    #[error("{episodes} episodes cannot be split evenly over {threads} threads")]
    UnevenSplit { episodes: usize, threads: usize },

    #[error("game factory returned {actual} games, expected {expected}")]
    GameCount { expected: usize, actual: usize },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Convention(#[from] ConventionError),

    #[error("evaluation thread {thread} failed: {source}")]
    Loop {
        thread: usize,
        #[source]
        source: InferenceError,
    },
}

/// Who plays a seat.
pub enum AgentSpec<M> {
    Learned(Arc<M>),
    RuleBot(RuleBotKind),
}

impl<M> Clone for AgentSpec<M> {
    fn clone(&self) -> Self {
        match self {
            AgentSpec::Learned(m) => AgentSpec::Learned(Arc::clone(m)),
            AgentSpec::RuleBot(kind) => AgentSpec::RuleBot(*kind),
        }
    }
}

impl<M> fmt::Debug for AgentSpec<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentSpec::Learned(_) => f.write_str("Learned"),
            AgentSpec::RuleBot(kind) => write!(f, "RuleBot({kind})"),
        }
    }
}

/// Evaluation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    pub num_episodes: usize,
    /// Upper bound on game threads; shrunk to `num_episodes` if larger.
    pub num_threads: usize,
    pub num_seats: usize,
    pub seed: u64,
    pub max_len: usize,
    pub bomb: usize,
    pub device: Device,
    pub act_queue_capacity: usize,
    pub convention_sender: Seat,
    /// Per-seat convention override, missing seats do not override.
    pub overrides: Vec<bool>,
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            num_episodes: 1000,
            num_threads: 10,
            num_seats: 2,
            seed: 1,
            max_len: 80,
            bomb: 0,
            device: Device::cpu(),
            act_queue_capacity: 1000,
            convention_sender: 0,
            overrides: Vec::new(),
        }
    }
}

impl EvalConfig {
    pub fn new(num_episodes: usize, num_threads: usize) -> Self {
        Self {
            num_episodes,
            num_threads,
            ..Default::default()
        }
    }

    pub fn with_seats(mut self, num_seats: usize) -> Self {
        self.num_seats = num_seats;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    pub fn with_bomb(mut self, bomb: usize) -> Self {
        self.bomb = bomb;
        self
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_convention_sender(mut self, sender: Seat) -> Self {
        self.convention_sender = sender;
        self
    }

    pub fn with_overrides(mut self, overrides: Vec<bool>) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("num_episodes", self.num_episodes)?;
        ConfigError::check_nonzero("num_threads", self.num_threads)?;
        ConfigError::check_nonzero("num_seats", self.num_seats)?;
        ConfigError::check_nonzero("max_len", self.max_len)?;
        ConfigError::check_nonzero("act_queue_capacity", self.act_queue_capacity)
    }

    /// Thread count and games per thread after clamping.
    pub fn split(&self) -> Result<(usize, usize), EvalError> {
        self.validate()?;
        let threads = self.num_threads.min(self.num_episodes);
        if self.num_episodes % threads != 0 {
            return Err(EvalError::UnevenSplit {
                episodes: self.num_episodes,
                threads,
            });
        }
        Ok((threads, self.num_episodes / threads))
    }

    fn overrides(&self, seat: Seat) -> bool {
        self.overrides.get(seat).copied().unwrap_or(false)
    }
}

/// Everything an evaluation produced.
pub struct EvalOutcome {
    /// Finished episodes, ordered by thread.
    pub episodes: Vec<EpisodeRecord>,
    /// Every actor in (thread, game, seat) order.
    pub actors: Vec<Box<dyn Actor>>,
}

impl EvalOutcome {
    pub fn scores(&self) -> Vec<f32> {
        self.episodes.iter().map(|e| e.score).collect()
    }

    /// Episodes finished by each thread, indexed by thread.
    pub fn episodes_per_thread(&self) -> Vec<usize> {
        let threads = self.episodes.iter().map(|e| e.thread + 1).max().unwrap_or(0);
        let mut counts = vec![0; threads];
        for e in &self.episodes {
            counts[e.thread] += 1;
        }
        counts
    }

    pub fn report(&self) -> EvalReport {
        EvalReport::new(&self.episodes, &self.actors)
    }
}

/// `100 * n / total`, 0 for an empty total.
pub fn percent(n: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        100.0 * n as f32 / total as f32
    }
}

/// `n / total`, 0 for an empty total.
pub fn ratio(n: u64, total: u64) -> f32 {
    if total == 0 {
        0.0
    } else {
        n as f32 / total as f32
    }
}

/// Move and convention statistics of one seat, over all its actors.
#[derive(Debug, Clone, PartialEq)]
pub struct SeatReport {
    pub seat: Seat,
    pub moves: u64,
    /// Percent of moves per move kind.
    pub move_pct: BTreeMap<&'static str, f32>,
    /// Percent of moves where a convention move was warranted.
    pub convention_available_pct: f32,
    /// Percent of moves that were convention moves.
    pub convention_played_pct: f32,
    /// Fraction of convention moves that were warranted.
    pub convention_correct: f32,
    pub convention_incorrect: f32,
}

impl SeatReport {
    fn new(seat: Seat, stats: &StatCounters) -> Self {
        let moves = stats.get("moves");
        let move_pct = [MoveKind::Play, MoveKind::Discard, MoveKind::Hint, MoveKind::Pass]
            .into_iter()
            .map(|k| (k.stat_key(), percent(stats.get(k.stat_key()), moves)))
            .collect();
        let played = stats.get("convention_played");
        Self {
            seat,
            moves,
            move_pct,
            convention_available_pct: percent(stats.get("convention_available"), moves),
            convention_played_pct: percent(played, moves),
            convention_correct: ratio(stats.get("convention_played_correct"), played),
            convention_incorrect: ratio(stats.get("convention_played_incorrect"), played),
        }
    }
}

/// Summary statistics of an evaluation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EvalReport {
    pub episodes: usize,
    pub mean: f32,
    /// Standard error of the mean.
    pub sem: f32,
    pub perfect_rate: f32,
    /// Mean over episodes that scored above zero.
    pub non_zero_mean: f32,
    pub bomb_out_rate: f32,
    pub seats: Vec<SeatReport>,
}

impl EvalReport {
    pub fn new(episodes: &[EpisodeRecord], actors: &[Box<dyn Actor>]) -> Self {
        let n = episodes.len();
        let scores: Vec<f64> = episodes.iter().map(|e| e.score as f64).collect();
        let mean = if n == 0 {
            0.0
        } else {
            scores.iter().sum::<f64>() / n as f64
        };
        let sem = if n == 0 {
            0.0
        } else {
            let var = scores.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n as f64;
            var.sqrt() / (n as f64).sqrt()
        };
        let non_zero: Vec<f64> = scores.iter().copied().filter(|&s| s > 0.0).collect();
        let non_zero_mean = if non_zero.is_empty() {
            0.0
        } else {
            non_zero.iter().sum::<f64>() / non_zero.len() as f64
        };
        let perfect = episodes.iter().filter(|e| e.perfect).count() as u64;
        let bombed = episodes.iter().filter(|e| e.bombed).count() as u64;

        let mut per_seat: BTreeMap<Seat, StatCounters> = BTreeMap::new();
        for actor in actors {
            per_seat
                .entry(actor.id().seat)
                .or_default()
                .merge(actor.stats());
        }

        Self {
            episodes: n,
            mean: mean as f32,
            sem: sem as f32,
            perfect_rate: ratio(perfect, n as u64),
            non_zero_mean: non_zero_mean as f32,
            bomb_out_rate: ratio(bombed, n as u64),
            seats: per_seat
                .iter()
                .map(|(&seat, stats)| SeatReport::new(seat, stats))
                .collect(),
        }
    }
}

impl fmt::Display for EvalReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "episodes: {}, score: {:.3} +/- {:.3}, perfect: {:.1}%, non-zero mean: {:.3}, bomb out: {:.1}%",
            self.episodes,
            self.mean,
            self.sem,
            self.perfect_rate * 100.0,
            self.non_zero_mean,
            self.bomb_out_rate * 100.0
        )?;
        for seat in &self.seats {
            write!(f, "seat {}: {} moves", seat.seat, seat.moves)?;
            for (kind, pct) in &seat.move_pct {
                write!(f, ", {kind} {pct:.1}%")?;
            }
            writeln!(
                f,
                ", convention available {:.1}%, played {:.1}% (correct {:.2}, incorrect {:.2})",
                seat.convention_available_pct,
                seat.convention_played_pct,
                seat.convention_correct,
                seat.convention_incorrect
            )?;
        }
        Ok(())
    }
}

enum SeatPlayer<M: PolicyModel> {
    Server(Arc<InferenceServer<M>>),
    Bot(RuleBotKind),
}

/// Play `config.num_episodes` episodes with `agents` seated in order.
pub fn evaluate<M, F>(
    agents: &[AgentSpec<M>],
    factory: &F,
    convention: Arc<ConventionSpec>,
    config: &EvalConfig,
) -> Result<EvalOutcome, EvalError>
where
    M: PolicyModel,
    F: GameFactory,
{
    if agents.len() != config.num_seats {
        return Err(EvalError::AgentCount {
            expected: config.num_seats,
            actual: agents.len(),
        });
    }
    let (threads, games_per_thread) = config.split()?;
    let roles = roles_for(config.convention_sender, config.num_seats)?;

    let players: Vec<SeatPlayer<M>> = agents
        .iter()
        .enumerate()
        .map(|(seat, agent)| match agent {
            AgentSpec::Learned(model) => {
                let server = InferenceServer::new(
                    format!("eval-{seat}"),
                    config.device.clone(),
                    model.to_device(&config.device),
                );
                server.register(Method::Act, config.act_queue_capacity)?;
                Ok(SeatPlayer::Server(Arc::new(server)))
            }
            AgentSpec::RuleBot(kind) => Ok(SeatPlayer::Bot(*kind)),
        })
        .collect::<Result<_, InferenceError>>()?;

    let mut ctx = ThreadLoopContext::new();
    for t in 0..threads {
        let games = factory.create(
            games_per_thread,
            thread_seed(config.seed, t),
            config.num_seats,
            config.bomb,
            config.max_len,
        );
        if games.len() != games_per_thread {
            return Err(EvalError::GameCount {
                expected: games_per_thread,
                actual: games.len(),
            });
        }
        if let Some(game) = games.first() {
            convention.validate(game.num_actions())?;
        }
        let mut game_loop = GameThreadLoop::new(t, LoopMode::Eval);
        for (g, game) in games.into_iter().enumerate() {
            let ids: Vec<ActorId> = (0..config.num_seats).map(|p| ActorId::new(t, g, p)).collect();
            let mut seats: Vec<Box<dyn Actor>> = Vec::with_capacity(ids.len());
            for &id in &ids {
                let binding = ConventionBinding::new(
                    Arc::clone(&convention),
                    roles[id.seat],
                    config.overrides(id.seat),
                );
                let seed = actor_seed(config.seed, &id);
                let mut actor: Box<dyn Actor> = match &players[id.seat] {
                    SeatPlayer::Server(server) => Box::new(
                        LearnedActor::new(id, Arc::clone(server), seed).with_convention(binding),
                    ),
                    SeatPlayer::Bot(kind) => {
                        Box::new(RuleBot::new(id, *kind, seed).with_convention(binding))
                    }
                };
                actor.set_siblings(ids.iter().copied().filter(|s| *s != id).collect());
                seats.push(actor);
            }
            game_loop.add_slot(game, seats);
        }
        ctx.push(game_loop);
    }

    let servers: Vec<&Arc<InferenceServer<M>>> = players
        .iter()
        .filter_map(|p| match p {
            SeatPlayer::Server(server) => Some(server),
            SeatPlayer::Bot(_) => None,
        })
        .collect();
    for server in &servers {
        server.start()?;
    }
    log::info!(
        "evaluating {} episodes on {} threads ({} games each)",
        config.num_episodes,
        threads,
        games_per_thread
    );
    ctx.start();
    let outcomes = ctx.join();
    for server in &servers {
        server.stop();
    }

    let mut episodes = Vec::with_capacity(config.num_episodes);
    let mut actors = Vec::new();
    for outcome in outcomes {
        if let Some(source) = outcome.error {
            return Err(EvalError::Loop {
                thread: outcome.index,
                source,
            });
        }
        episodes.extend(outcome.episodes);
        actors.extend(outcome.actors);
    }
    Ok(EvalOutcome { episodes, actors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::BeaconFactory;
    use crate::test_support::EchoModel;

    fn bots() -> Vec<AgentSpec<EchoModel>> {
        vec![
            AgentSpec::RuleBot(RuleBotKind::Uniform),
            AgentSpec::RuleBot(RuleBotKind::FirstLegal),
        ]
    }

    fn episode(score: f32, perfect: bool, bombed: bool) -> EpisodeRecord {
        EpisodeRecord {
            thread: 0,
            game: 0,
            score,
            perfect,
            bombed,
            steps: 10,
        }
    }

    #[test]
    fn test_split_clamps_threads_to_episodes() {
        assert_eq!(EvalConfig::new(100, 10).split().unwrap(), (10, 10));
        assert_eq!(EvalConfig::new(5, 10).split().unwrap(), (5, 1));
    }

    #[test]
    fn test_split_rejects_remainder_and_zero() {
        assert!(matches!(
            EvalConfig::new(10, 3).split(),
            Err(EvalError::UnevenSplit {
                episodes: 10,
                threads: 3
            })
        ));
        assert!(matches!(
            EvalConfig::new(0, 3).split(),
            Err(EvalError::Config(ConfigError::Zero("num_episodes")))
        ));
    }

    #[test]
    fn test_zero_denominators() {
        assert_eq!(percent(3, 0), 0.0);
        assert_eq!(ratio(3, 0), 0.0);
        assert_eq!(percent(1, 4), 25.0);
        assert_eq!(ratio(1, 4), 0.25);
    }

    #[test]
    fn test_agent_count_must_match_seats() {
        let agents = vec![AgentSpec::<EchoModel>::RuleBot(RuleBotKind::Uniform)];
        let result = evaluate(
            &agents,
            &BeaconFactory::default(),
            Arc::new(ConventionSpec::empty()),
            &EvalConfig::new(4, 2),
        );
        assert!(matches!(
            result,
            Err(EvalError::AgentCount {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_rule_bots_play_every_episode_once() {
        let outcome = evaluate(
            &bots(),
            &BeaconFactory::default(),
            Arc::new(ConventionSpec::empty()),
            &EvalConfig::new(20, 4).with_max_len(40),
        )
        .unwrap();
        assert_eq!(outcome.episodes.len(), 20);
        assert_eq!(outcome.episodes_per_thread(), vec![5; 4]);
        assert_eq!(outcome.actors.len(), 40);
        assert_eq!(outcome.scores().len(), 20);

        let report = outcome.report();
        assert_eq!(report.episodes, 20);
        assert_eq!(report.seats.len(), 2);
        for seat in &report.seats {
            assert!(seat.moves > 0);
            let total: f32 = seat.move_pct.values().sum();
            assert!((total - 100.0).abs() < 1e-2);
            assert_eq!(seat.convention_played_pct, 0.0);
        }
    }

    #[test]
    fn test_learned_seat_consults_its_server() {
        let agents = vec![
            AgentSpec::Learned(Arc::new(EchoModel::new())),
            AgentSpec::RuleBot(RuleBotKind::FirstLegal),
        ];
        let model = match &agents[0] {
            AgentSpec::Learned(m) => Arc::clone(m),
            AgentSpec::RuleBot(_) => unreachable!(),
        };
        let outcome = evaluate(
            &agents,
            &BeaconFactory::default(),
            Arc::new(ConventionSpec::empty()),
            &EvalConfig::new(4, 2).with_max_len(30),
        )
        .unwrap();
        assert_eq!(outcome.episodes.len(), 4);
        assert!(model.act_requests() > 0);
        let learned_moves: u64 = outcome
            .actors
            .iter()
            .filter(|a| a.id().seat == 0)
            .map(|a| a.stats().get("moves"))
            .sum();
        assert!(learned_moves > 0);
    }

    #[test]
    fn test_report_statistics() {
        let episodes = vec![
            episode(0.0, false, true),
            episode(2.0, false, false),
            episode(4.0, true, false),
        ];
        let report = EvalReport::new(&episodes, &[]);
        assert_eq!(report.episodes, 3);
        assert!((report.mean - 2.0).abs() < 1e-6);
        let expected_sem = (8.0f32 / 3.0).sqrt() / 3.0f32.sqrt();
        assert!((report.sem - expected_sem).abs() < 1e-5);
        assert!((report.non_zero_mean - 3.0).abs() < 1e-6);
        assert!((report.perfect_rate - 1.0 / 3.0).abs() < 1e-6);
        assert!((report.bomb_out_rate - 1.0 / 3.0).abs() < 1e-6);
        assert!(report.seats.is_empty());
        assert!(report.to_string().contains("episodes: 3"));
    }

    #[test]
    fn test_empty_report_is_zero() {
        let report = EvalReport::new(&[], &[]);
        assert_eq!(report, EvalReport::default());
    }
}
