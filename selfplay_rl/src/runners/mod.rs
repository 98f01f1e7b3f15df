//! Training runners.
//!
//! - [`SelfPlayTrainer`]: actor pool + learner + per-epoch evaluation and
//!   top-k checkpointing
//! - [`TrainConfig`]: the serde document describing a run

pub mod config;
pub mod trainer;

pub use config::{eval_seed, ExplorationConfig, TrainConfig};
pub use trainer::{SelfPlayTrainer, TrainSummary};

#[cfg(test)]
mod tests;
