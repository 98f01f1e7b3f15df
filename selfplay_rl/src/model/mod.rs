//! The model interface the coordination layer drives.
//!
//! Forward/backward computation is opaque here: servers call [`PolicyModel::act`]
//! and [`PolicyModel::compute_priority`] on batches, the learner calls
//! [`PolicyModel::loss`] and [`PolicyModel::apply_gradients`]. Parameters
//! travel as a [`StateDict`] for checkpoints and partner weights.

pub mod linear;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;

use crate::core::Fragment;
use crate::environment::{Action, Observation};

pub use linear::LinearQModel;

/// Named flat parameter tensors.
pub type StateDict = BTreeMap<String, Vec<f32>>;

/// Where a model replica lives, e.g. `cpu`, `cuda:1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Device(String);

impl Device {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn cpu() -> Self {
        Self::new("cpu")
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::cpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Device {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(ModelError::BadDevice(s.to_string()));
        }
        Ok(Self::new(s))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModelError {
    #[error("state dict is missing `{0}`")]
    MissingKey(String),

    #[error("`{key}` has {actual} values, expected {expected}")]
    ShapeMismatch {
        key: String,
        expected: usize,
        actual: usize,
    },

    #[error("invalid device `{0}`")]
    BadDevice(String),
}

/// Output of one loss evaluation.
#[derive(Debug, Clone, Default)]
pub struct LossOutput {
    /// Importance-weighted scalar loss.
    pub loss: f32,
    /// New priority per batch item.
    pub priorities: Vec<f32>,
    /// Gradient of `loss` with respect to every parameter.
    pub gradients: StateDict,
    /// Extra diagnostics, e.g. mean Q.
    pub aux: BTreeMap<String, f32>,
}

/// A policy network as seen by servers and the learner.
pub trait PolicyModel: Clone + Send + Sync + 'static {
    /// Per-action values for each observation.
    fn act(&self, batch: &[Observation]) -> Vec<Vec<f32>>;

    /// Initial replay priority for each fragment.
    fn compute_priority(&self, batch: &[Arc<Fragment>]) -> Vec<f32>;

    /// Importance-weighted loss against `target`.
    fn loss(&self, target: &Self, batch: &[Arc<Fragment>], weights: &[f32]) -> LossOutput;

    fn apply_gradients(&mut self, gradients: &StateDict, lr: f32);

    /// Replica of this model placed on `device`.
    fn to_device(&self, device: &Device) -> Self;

    fn state_dict(&self) -> StateDict;

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError>;
}

/// Highest-valued legal action. Ties go to the lowest index.
pub fn greedy_legal(values: &[f32], legal: &[bool]) -> Option<Action> {
    let mut best: Option<(Action, f32)> = None;
    for (a, (&v, &ok)) in values.iter().zip(legal).enumerate() {
        if !ok {
            continue;
        }
        match best {
            Some((_, bv)) if bv >= v => {}
            _ => best = Some((a, v)),
        }
    }
    best.map(|(a, _)| a)
}

/// Scale gradients in place so their global L2 norm is at most `max_norm`.
///
/// Returns the norm before clipping. A non-positive `max_norm` disables
/// clipping.
pub fn clip_grad_norm(gradients: &mut StateDict, max_norm: f32) -> f32 {
    let norm = gradients
        .values()
        .flat_map(|g| g.iter())
        .map(|x| x * x)
        .sum::<f32>()
        .sqrt();
    if max_norm > 0.0 && norm > max_norm {
        let scale = max_norm / (norm + 1e-6);
        for g in gradients.values_mut() {
            g.iter_mut().for_each(|x| *x *= scale);
        }
    }
    norm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_greedy_skips_illegal() {
        let values = [5.0, 1.0, 3.0];
        assert_eq!(greedy_legal(&values, &[true, true, true]), Some(0));
        assert_eq!(greedy_legal(&values, &[false, true, true]), Some(2));
        assert_eq!(greedy_legal(&values, &[false, false, false]), None);
    }

    #[test]
    fn test_greedy_tie_prefers_lowest_index() {
        assert_eq!(greedy_legal(&[1.0, 1.0], &[true, true]), Some(0));
    }

    #[test]
    fn test_clip_grad_norm() {
        let mut grads = StateDict::new();
        grads.insert("w".into(), vec![3.0, 4.0]);
        let norm = clip_grad_norm(&mut grads, 1.0);
        assert!((norm - 5.0).abs() < 1e-5);
        let clipped: f32 = grads["w"].iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((clipped - 1.0).abs() < 1e-3);
    }

    #[test]
    fn test_clip_grad_norm_below_threshold_untouched() {
        let mut grads = StateDict::new();
        grads.insert("w".into(), vec![0.3, 0.4]);
        clip_grad_norm(&mut grads, 5.0);
        assert_eq!(grads["w"], vec![0.3, 0.4]);
    }

    #[test]
    fn test_device_parse() {
        let d: Device = "cuda:1".parse().unwrap();
        assert_eq!(d.name(), "cuda:1");
        assert_eq!(d.to_string(), "cuda:1");
        assert!("  ".parse::<Device>().is_err());
    }
}
