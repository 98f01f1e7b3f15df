//! Error types shared across the crate.
//!
//! Each component owns a narrow error enum next to its code; this module
//! holds the configuration error every config struct reports through and
//! [`TrainError`], the umbrella the runner and binary propagate.

use thiserror::Error;

use crate::actors::PoolError;
use crate::buffers::ReplayError;
use crate::checkpoint::CheckpointError;
use crate::convention::ConventionError;
use crate::evaluator::EvalError;
use crate::inference::InferenceError;
use crate::model::ModelError;

/// Invalid configuration detected by a `validate()` call.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("`{0}` must be greater than zero")]
    Zero(&'static str),

    #[error("`{name}` = {value} is outside {range}")]
    OutOfRange {
        name: &'static str,
        value: f64,
        range: &'static str,
    },

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    /// Reject a zero count or frequency.
    pub fn check_nonzero(name: &'static str, value: usize) -> Result<(), ConfigError> {
        if value == 0 {
            return Err(ConfigError::Zero(name));
        }
        Ok(())
    }

    /// Reject a value outside the closed interval `[low, high]`.
    pub fn check_range(
        name: &'static str,
        value: f64,
        low: f64,
        high: f64,
        range: &'static str,
    ) -> Result<(), ConfigError> {
        if !(low..=high).contains(&value) || value.is_nan() {
            return Err(ConfigError::OutOfRange { name, value, range });
        }
        Ok(())
    }
}

/// Anything that can end a training or evaluation run.
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error(transparent)]
    Replay(#[from] ReplayError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Eval(#[from] EvalError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Convention(#[from] ConventionError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("shutdown requested")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
