//! Mock models and observation builders shared by unit tests.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::Fragment;
use crate::environment::{Action, LastMove, MoveKind, Observation, Seat};
use crate::model::{Device, LossOutput, ModelError, PolicyModel, StateDict};

/// Model whose action values echo the observation's features.
///
/// `values[a] = features[a] + bias` (missing features count as 0). Records
/// every batch size it is asked to evaluate.
#[derive(Clone, Default)]
pub(crate) struct EchoModel {
    pub bias: f32,
    pub delay: Duration,
    /// Reported loss instead of the weight sum.
    pub fixed_loss: Option<f32>,
    pub act_calls: Arc<AtomicUsize>,
    pub batch_sizes: Arc<Mutex<Vec<usize>>>,
}

impl EchoModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bias(mut self, bias: f32) -> Self {
        self.bias = bias;
        self
    }

    pub fn with_loss(mut self, loss: f32) -> Self {
        self.fixed_loss = Some(loss);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn act_requests(&self) -> usize {
        self.batch_sizes.lock().iter().sum()
    }
}

impl PolicyModel for EchoModel {
    fn act(&self, batch: &[Observation]) -> Vec<Vec<f32>> {
        self.act_calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes.lock().push(batch.len());
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        batch
            .iter()
            .map(|o| {
                (0..o.legal.len())
                    .map(|a| o.features.get(a).copied().unwrap_or(0.0) + self.bias)
                    .collect()
            })
            .collect()
    }

    fn compute_priority(&self, batch: &[Arc<Fragment>]) -> Vec<f32> {
        batch.iter().map(|f| f.len() as f32).collect()
    }

    fn loss(&self, _target: &Self, batch: &[Arc<Fragment>], weights: &[f32]) -> LossOutput {
        let mut gradients = StateDict::new();
        gradients.insert("bias".into(), vec![1.0]);
        LossOutput {
            loss: self.fixed_loss.unwrap_or_else(|| weights.iter().sum()),
            priorities: vec![2.0; batch.len()],
            gradients,
            aux: Default::default(),
        }
    }

    fn apply_gradients(&mut self, gradients: &StateDict, lr: f32) {
        if let Some(g) = gradients.get("bias") {
            self.bias -= lr * g[0];
        }
    }

    fn to_device(&self, _device: &Device) -> Self {
        self.clone()
    }

    fn state_dict(&self) -> StateDict {
        let mut state = StateDict::new();
        state.insert("bias".into(), vec![self.bias]);
        state
    }

    fn load_state_dict(&mut self, state: &StateDict) -> Result<(), ModelError> {
        let bias = state
            .get("bias")
            .and_then(|b| b.first())
            .ok_or_else(|| ModelError::MissingKey("bias".into()))?;
        self.bias = *bias;
        Ok(())
    }
}

/// Hand-built observation with `n` actions, all of kind `Play` except the
/// last, which is `Pass`.
pub(crate) fn observation(seat: Seat, current_seat: Seat, features: Vec<f32>, legal: Vec<bool>) -> Observation {
    let n = legal.len();
    let catalog: Arc<[MoveKind]> = (0..n)
        .map(|a| if a + 1 == n { MoveKind::Pass } else { MoveKind::Play })
        .collect::<Vec<_>>()
        .into();
    Observation {
        seat,
        current_seat,
        features,
        legal,
        last_move: None,
        partner_cues: Vec::new(),
        catalog,
    }
}

pub(crate) fn with_last_move(mut obs: Observation, seat: Seat, action: Action) -> Observation {
    obs.last_move = Some(LastMove { seat, action });
    obs
}
