//! # selfplay_rl: actor/learner coordination for cooperative self-play
//!
//! Many lightweight actors play cooperative games on dedicated threads while
//! one learner consumes their experience and updates a shared policy.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │  game-loop 0        game-loop 1        game-loop T-1                │
//! │  ┌──────────┐       ┌──────────┐       ┌──────────┐                 │
//! │  │ G games  │       │ G games  │       │ G games  │                 │
//! │  │ x P seats│       │ x P seats│       │ x P seats│                 │
//! │  └──┬────┬──┘       └──┬────┬──┘       └──┬────┬──┘                 │
//! │     │    │ act          │    │             │    │                    │
//! │     │    └──────────────┼────┴─────────────┼────┴──▶ InferenceServer │
//! │     │ push fragments    │                  │         (online/partner │
//! │     ▼                   ▼                  ▼          per device)    │
//! │            ┌─────────────────────────┐                 ▲            │
//! │            │  PriorityReplayBuffer   │                 │ weights    │
//! │            └────────────┬────────────┘                 │            │
//! │                         ▼                              │            │
//! │            ┌─────────────────────────┐                 │            │
//! │            │  Learner (caller thread)│─────────────────┘            │
//! │            │  evaluate + top-k save  │                              │
//! │            └─────────────────────────┘                              │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use selfplay_rl::{BeaconFactory, LinearQModel, SelfPlayTrainer, TrainConfig};
//!
//! let factory = BeaconFactory::default();
//! let model = LinearQModel::new(factory.config.feature_size(2), factory.config.num_actions(), 1);
//! let summary = SelfPlayTrainer::new(TrainConfig::default(), model, factory)?.run()?;
//! println!("best score: {:?}", summary.best_score());
//! ```

pub mod actors;
pub mod buffers;
pub mod checkpoint;
pub mod convention;
pub mod core;
pub mod environment;
pub mod error;
pub mod evaluator;
pub mod inference;
pub mod learner;
pub mod metrics;
pub mod model;
pub mod runners;
pub mod scheduling;

#[cfg(test)]
mod test_support;

// Errors
pub use error::{ConfigError, TrainError};

// Games and models
pub use environment::{
    Action, BeaconConfig, BeaconFactory, BeaconGame, GameEnv, GameFactory, Observation, Seat,
    StepResult,
};
pub use model::{Device, LinearQModel, LossOutput, ModelError, PolicyModel, StateDict};

// Coordination layer
pub use actors::{
    Actor, ActorId, ActorPool, ActorPoolConfig, GameThreadLoop, LearnedActor, LoopMode,
    PartnerWeights, PoolError, RuleBot, RuleBotKind, StatCounters, ThreadLoopContext,
};
pub use buffers::{FragmentReplay, PriorityReplayBuffer, ReplayConfig, ReplayError};
pub use convention::{ConventionBinding, ConventionError, ConventionSpec, Role};
pub use core::Fragment;
pub use inference::{InferenceError, InferenceServer, Method};
pub use learner::{Learner, LearnerConfig, WeightSink};
pub use scheduling::ExplorationSchedule;

// Evaluation, checkpointing and training
pub use checkpoint::{CheckpointError, TopKSaver, TopKSaverConfig};
pub use evaluator::{evaluate, AgentSpec, EvalConfig, EvalError, EvalOutcome, EvalReport};
pub use metrics::{ConsoleLogger, CsvLogger, EpochSnapshot, MetricsLogger, MultiLogger};
pub use runners::{ExplorationConfig, SelfPlayTrainer, TrainConfig, TrainSummary};
