//! Configuration for self-play training.
//!
//! [`TrainConfig`] gathers the per-component configs into one serde
//! document so a run can be described by a single JSON file and overridden
//! from the command line.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::actors::ActorPoolConfig;
use crate::buffers::ReplayConfig;
use crate::checkpoint::TopKSaverConfig;
use crate::error::{ConfigError, TrainError};
use crate::evaluator::EvalConfig;
use crate::learner::LearnerConfig;
use crate::scheduling::ExplorationSchedule;

/// How per-thread exploration rates are laid out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExplorationConfig {
    /// Geometric spacing from `max` down to `min`.
    Geometric { min: f32, max: f32 },
    /// `base^(1 + i/(n-1) * alpha)`.
    ApeX { base: f32, alpha: f32 },
    Constant { rate: f32 },
}

impl Default for ExplorationConfig {
    fn default() -> Self {
        ExplorationConfig::Geometric {
            min: 1e-4,
            max: 0.1,
        }
    }
}

impl ExplorationConfig {
    /// One rate per thread.
    pub fn schedule(&self, threads: usize) -> Result<ExplorationSchedule, ConfigError> {
        match *self {
            ExplorationConfig::Geometric { min, max } => {
                ExplorationSchedule::geometric(min, max, threads)
            }
            ExplorationConfig::ApeX { base, alpha } => {
                ExplorationSchedule::ape_x(base, alpha, threads)
            }
            ExplorationConfig::Constant { rate } => {
                ConfigError::check_range("explore_rate", rate as f64, 0.0, 1.0, "[0, 1]")?;
                Ok(ExplorationSchedule::constant(rate, threads))
            }
        }
    }
}

/// Everything a training run needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub pool: ActorPoolConfig,
    pub replay: ReplayConfig,
    pub learner: LearnerConfig,
    /// Per-epoch evaluation; seats, lengths and seed are filled from the pool.
    pub eval: EvalConfig,
    pub checkpoint: TopKSaverConfig,
    pub exploration: ExplorationConfig,
    /// JSON convention file, none for no convention.
    pub convention: Option<PathBuf>,
    /// Frozen partner weights, none to mirror the initial online model.
    pub partner_weights: Option<PathBuf>,
    pub num_epochs: usize,
    /// Write `model_epoch{n}` every this many epochs, 0 never.
    pub save_every_epochs: usize,
    /// Optional CSV copy of the epoch table.
    pub csv_log: Option<PathBuf>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            pool: ActorPoolConfig::default(),
            replay: ReplayConfig::default(),
            learner: LearnerConfig::default(),
            eval: EvalConfig::default(),
            checkpoint: TopKSaverConfig::default(),
            exploration: ExplorationConfig::default(),
            convention: None,
            partner_weights: None,
            num_epochs: 1000,
            save_every_epochs: 0,
            csv_log: None,
        }
    }
}

impl TrainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a JSON config file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, TrainError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| {
            ConfigError::Invalid(format!("{}: {}", path.display(), e)).into()
        })
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }

    pub fn with_epochs(mut self, num_epochs: usize) -> Self {
        self.num_epochs = num_epochs;
        self
    }

    pub fn with_save_every(mut self, epochs: usize) -> Self {
        self.save_every_epochs = epochs;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;
        self.replay.validate()?;
        self.learner.validate()?;
        self.checkpoint.validate()?;
        ConfigError::check_nonzero("num_epochs", self.num_epochs)?;
        self.eval_config(0).split().map_err(|e| ConfigError::Invalid(e.to_string()))?;
        self.exploration.schedule(self.pool.num_threads)?;
        Ok(())
    }

    /// Evaluation settings for the evaluation after `epoch`.
    ///
    /// The game shape follows the pool; seats without an explicit override
    /// follow the pool's learned/partner override flags.
    pub fn eval_config(&self, epoch: usize) -> EvalConfig {
        let pool = &self.pool;
        let overrides = if self.eval.overrides.is_empty() {
            (0..pool.num_seats)
                .map(|p| {
                    if p == 0 {
                        pool.override_learned
                    } else {
                        pool.override_partner
                    }
                })
                .collect()
        } else {
            self.eval.overrides.clone()
        };
        self.eval
            .clone()
            .with_seats(pool.num_seats)
            .with_max_len(pool.max_len)
            .with_bomb(0)
            .with_convention_sender(pool.convention_sender)
            .with_overrides(overrides)
            .with_seed(eval_seed(epoch))
    }
}

/// Seed of the evaluation run after `epoch`.
pub fn eval_seed(epoch: usize) -> u64 {
    (9917 + epoch as u64 * 999_999) % 7_777_777
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eval_seed_sequence() {
        assert_eq!(eval_seed(0), 9917);
        assert_eq!(eval_seed(1), 1_009_916);
        assert_eq!(eval_seed(8), (9917 + 8 * 999_999) % 7_777_777);
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(TrainConfig::default().validate().is_ok());
    }

    #[test]
    fn test_json_round_trip_keeps_overrides() {
        let mut config = TrainConfig::new().with_epochs(3).with_save_every(2);
        config.pool.num_threads = 2;
        config.exploration = ExplorationConfig::ApeX {
            base: 0.4,
            alpha: 7.0,
        };
        let text = config.to_json();
        let parsed: TrainConfig = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.json");
        std::fs::write(
            &path,
            r#"{"num_epochs": 7, "pool": {"num_threads": 3}, "exploration": {"kind": "constant", "rate": 0.05}}"#,
        )
        .unwrap();
        let config = TrainConfig::from_json_file(&path).unwrap();
        assert_eq!(config.num_epochs, 7);
        assert_eq!(config.pool.num_threads, 3);
        assert_eq!(config.pool.num_seats, 2);
        assert_eq!(config.exploration.schedule(3).unwrap().rates(), &[0.05; 3]);
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            TrainConfig::from_json_file(&path),
            Err(TrainError::Config(ConfigError::Invalid(_)))
        ));
    }

    #[test]
    fn test_eval_config_follows_pool() {
        let mut config = TrainConfig::new();
        config.pool.num_seats = 3;
        config.pool.convention_sender = 2;
        config.pool.override_learned = true;
        config.pool.override_partner = false;
        let eval = config.eval_config(4);
        assert_eq!(eval.num_seats, 3);
        assert_eq!(eval.convention_sender, 2);
        assert_eq!(eval.overrides, vec![true, false, false]);
        assert_eq!(eval.seed, eval_seed(4));
    }

    #[test]
    fn test_uneven_eval_split_rejected() {
        let mut config = TrainConfig::new();
        config.eval.num_episodes = 10;
        config.eval.num_threads = 3;
        assert!(config.validate().is_err());
    }
}
