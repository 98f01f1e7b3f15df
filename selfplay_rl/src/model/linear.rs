//! Linear Q-function used by the binary and end-to-end tests.
//!
//! `Q(x, a) = W[a] · x + b[a]`, trained with one-step TD targets from a
//! target copy. Fragment priority mixes the largest and mean absolute TD
//! error: `eta * max|δ| + (1 - eta) * mean|δ|`.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::{Device, LossOutput, ModelError, PolicyModel, StateDict};
use crate::core::Fragment;
use crate::environment::Observation;

#[derive(Debug, Clone, PartialEq)]
pub struct LinearQModel {
    feature_size: usize,
    num_actions: usize,
    /// Row-major `[num_actions, feature_size]`.
    weight: Vec<f32>,
    bias: Vec<f32>,
    gamma: f32,
    eta: f32,
    device: Device,
}

impl LinearQModel {
    pub fn new(feature_size: usize, num_actions: usize, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let weight = (0..feature_size * num_actions)
            .map(|_| rng.gen_range(-0.01..0.01))
            .collect();
        Self {
            feature_size,
            num_actions,
            weight,
            bias: vec![0.0; num_actions],
            gamma: 0.999,
            eta: 0.9,
            device: Device::cpu(),
        }
    }

    pub fn with_gamma(mut self, gamma: f32) -> Self {
        self.gamma = gamma;
        self
    }

    pub fn with_eta(mut self, eta: f32) -> Self {
        self.eta = eta;
        self
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn q_values(&self, features: &[f32]) -> Vec<f32> {
        (0..self.num_actions)
            .map(|a| self.q(features, a))
            .collect()
    }

    fn q(&self, features: &[f32], action: usize) -> f32 {
        let row = &self.weight[action * self.feature_size..(action + 1) * self.feature_size];
        row.iter().zip(features).map(|(w, x)| w * x).sum::<f32>() + self.bias[action]
    }

    fn max_legal_q(&self, features: &[f32], legal: &[bool]) -> f32 {
        (0..self.num_actions)
            .filter(|&a| legal.get(a).copied().unwrap_or(false))
            .map(|a| self.q(features, a))
            .fold(None, |m: Option<f32>, q| Some(m.map_or(q, |m| m.max(q))))
            .unwrap_or(0.0)
    }

    /// One-step TD errors of every step in `fragment`.
    fn td_errors(&self, target: &Self, fragment: &Fragment) -> Vec<f32> {
        (0..fragment.len())
            .map(|t| {
                let bootstrap = fragment
                    .next_state(t)
                    .map(|(f, l)| self.gamma * target.max_legal_q(f, l))
                    .unwrap_or(0.0);
                let y = fragment.rewards[t] + bootstrap;
                y - self.q(&fragment.features[t], fragment.actions[t])
            })
            .collect()
    }

    fn priority(&self, deltas: &[f32]) -> f32 {
        if deltas.is_empty() {
            return 0.0;
        }
        let abs: Vec<f32> = deltas.iter().map(|d| d.abs()).collect();
        let max = abs.iter().copied().fold(0.0, f32::max);
        let mean = abs.iter().sum::<f32>() / abs.len() as f32;
        self.eta * max + (1.0 - self.eta) * mean
    }
}

impl PolicyModel for LinearQModel {
    fn act(&self, batch: &[Observation]) -> Vec<Vec<f32>> {
        batch.iter().map(|obs| self.q_values(&obs.features)).collect()
    }

    fn compute_priority(&self, batch: &[Arc<Fragment>]) -> Vec<f32> {
        batch
            .iter()
            .map(|f| self.priority(&self.td_errors(self, f)))
            .collect()
    }

    fn loss(&self, target: &Self, batch: &[Arc<Fragment>], weights: &[f32]) -> LossOutput {
        let mut grad_w = vec![0.0; self.weight.len()];
        let mut grad_b = vec![0.0; self.bias.len()];
        let mut loss = 0.0;
        let mut priorities = Vec::with_capacity(batch.len());
        let mut abs_td = 0.0;
        let mut steps = 0usize;
        let batch_len = batch.len().max(1) as f32;

        for (fragment, &w) in batch.iter().zip(weights) {
            let deltas = self.td_errors(target, fragment);
            priorities.push(self.priority(&deltas));
            if deltas.is_empty() {
                continue;
            }
            let scale = w / (batch_len * deltas.len() as f32);
            for (t, &delta) in deltas.iter().enumerate() {
                loss += 0.5 * delta * delta * scale;
                abs_td += delta.abs();
                steps += 1;

                let a = fragment.actions[t];
                let row = a * self.feature_size;
                for (g, x) in grad_w[row..row + self.feature_size]
                    .iter_mut()
                    .zip(&fragment.features[t])
                {
                    *g -= scale * delta * x;
                }
                grad_b[a] -= scale * delta;
            }
        }

        let mut gradients = StateDict::new();
        gradients.insert("weight".into(), grad_w);
        gradients.insert("bias".into(), grad_b);

        let mut aux = BTreeMap::new();
        aux.insert(
            "mean_abs_td".into(),
            if steps > 0 { abs_td / steps as f32 } else { 0.0 },
        );

        LossOutput {
            loss,
            priorities,
            gradients,
            aux,
        }
    }

    fn apply_gradients(&mut self, gradients: &StateDict, lr: f32) {
        if let Some(g) = gradients.get("weight") {
            self.weight.iter_mut().zip(g).for_each(|(w, g)| *w -= lr * g);
        }
        if let Some(g) = gradients.get("bias") {
            self.bias.iter_mut().zip(g).for_each(|(b, g)| *b -= lr * g);
        }
    }

    fn to_device(&self, device: &Device) -> Self {
        Self {
            device: device.clone(),
            ..self.clone()
        }
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("weight".into(), self.weight.clone());
        state.insert("bias".into(), self.bias.clone());
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        for (key, expected) in [("weight", self.weight.len()), ("bias", self.bias.len())] {
            let values = state
                .get(key)
                .ok_or_else(|| ModelError::MissingKey(key.to_string()))?;
            if values.len() != expected {
                return Err(ModelError::ShapeMismatch {
                    key: key.to_string(),
                    expected,
                    actual: values.len(),
                });
            }
        }
        self.weight.clone_from(&state["weight"]);
        self.bias.clone_from(&state["bias"]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(features: Vec<Vec<f32>>, actions: Vec<usize>, rewards: Vec<f32>) -> Arc<Fragment> {
        let n = actions.len();
        let mut terminals = vec![false; n];
        terminals[n - 1] = true;
        Arc::new(Fragment {
            seat: 0,
            legal: vec![vec![true, true]; n],
            features,
            actions,
            rewards,
            terminals,
            bootstrap: None,
        })
    }

    #[test]
    fn test_state_dict_round_trip() {
        let a = LinearQModel::new(3, 2, 1);
        let mut b = LinearQModel::new(3, 2, 2);
        assert_ne!(a, b);
        b.load_state_dict(&a.state_dict()).unwrap();
        assert_eq!(a.state_dict(), b.state_dict());
    }

    #[test]
    fn test_load_rejects_wrong_shape() {
        let mut m = LinearQModel::new(3, 2, 1);
        let mut state = m.state_dict();
        state.insert("bias".into(), vec![0.0; 5]);
        assert!(matches!(
            m.load_state_dict(&state),
            Err(ModelError::ShapeMismatch { expected: 2, actual: 5, .. })
        ));
        state.remove("weight");
        assert_eq!(
            m.load_state_dict(&state),
            Err(ModelError::MissingKey("weight".into()))
        );
    }

    #[test]
    fn test_gradient_step_reduces_loss() {
        let mut model = LinearQModel::new(2, 2, 3);
        let batch = vec![fragment(vec![vec![1.0, 0.5]], vec![1], vec![1.0])];
        let weights = vec![1.0];

        let before = model.loss(&model.clone(), &batch, &weights);
        model.apply_gradients(&before.gradients, 0.5);
        let after = model.loss(&model.clone(), &batch, &weights);
        assert!(after.loss < before.loss);
    }

    #[test]
    fn test_priority_mixes_max_and_mean() {
        let model = LinearQModel::new(1, 2, 0).with_eta(0.5);
        let mut zeroed = model.clone();
        zeroed.load_state_dict(&{
            let mut s = StateDict::new();
            s.insert("weight".into(), vec![0.0, 0.0]);
            s.insert("bias".into(), vec![0.0, 0.0]);
            s
        })
        .unwrap();
        let batch = vec![fragment(vec![vec![1.0], vec![1.0]], vec![0, 0], vec![1.0, 3.0])];
        // With zero weights and gamma bootstrapping off the zero target, the
        // deltas are the rewards themselves.
        let p = zeroed.compute_priority(&batch);
        assert!((p[0] - (0.5 * 3.0 + 0.5 * 2.0)).abs() < 1e-5);
    }

    #[test]
    fn test_to_device_keeps_weights() {
        let m = LinearQModel::new(2, 2, 0);
        let moved = m.to_device(&Device::new("cuda:0"));
        assert_eq!(moved.device().name(), "cuda:0");
        assert_eq!(moved.state_dict(), m.state_dict());
    }
}
