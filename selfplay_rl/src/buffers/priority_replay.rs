//! Prioritized replay shared by every learning seat and the learner.
//!
//! # Data flow
//!
//! ```text
//! Actor 0 ─┐
//! Actor 1 ─┼──> Injector (lock-free push) ──> consolidate ──> ring + SumTree
//! Actor N ─┘                                  (on sample)         │
//!                                                                 v
//!                                                    Learner: sample / update_priority
//! ```
//!
//! Producers never take a lock. The learner drains the injector into the
//! ring whenever it samples, so pushes racing a sample land in the next one
//! and are neither lost nor duplicated.
//!
//! # Sampling
//!
//! Item `i` is drawn with probability `P(i) = p_i / Σ p` where
//! `p_i = (|priority_i| + epsilon)^alpha`. Each sampled item carries the
//! importance weight
//!
//! ```text
//! w_i = (N * P(i))^-beta / max_j w_j
//! ```
//!
//! normalized by the largest weight in the batch.
//!
//! # Priority feedback
//!
//! [`PriorityReplayBuffer::update_priority`] only accepts the indices of the
//! most recent sample. Slots overwritten by newer pushes since then are
//! skipped.

use crossbeam_deque::{Injector, Steal};
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

use crate::core::Fragment;
use crate::error::ConfigError;

/// Replay buffer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Maximum number of stored items; oldest are replaced first.
    pub capacity: usize,
    /// Priority exponent. 0 = uniform sampling, 1 = fully prioritized.
    pub alpha: f32,
    /// Importance sampling exponent. 0 = no correction, 1 = full correction.
    pub beta: f32,
    /// Added to every priority so no item becomes unsampleable.
    pub epsilon: f32,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            capacity: 1 << 17,
            alpha: 0.9,
            beta: 0.6,
            epsilon: 1e-6,
        }
    }
}

impl ReplayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_beta(mut self, beta: f32) -> Self {
        self.beta = beta;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("replay.capacity", self.capacity)?;
        ConfigError::check_range("replay.alpha", self.alpha as f64, 0.0, 1.0, "[0, 1]")?;
        ConfigError::check_range("replay.beta", self.beta as f64, 0.0, 1.0, "[0, 1]")?;
        if self.epsilon <= 0.0 {
            return Err(ConfigError::OutOfRange {
                name: "replay.epsilon",
                value: self.epsilon as f64,
                range: "(0, inf)",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ReplayError {
    #[error("cannot sample from an empty replay buffer")]
    Empty,

    #[error("priority update for sample {got}, but the most recent sample is {expected:?}")]
    StaleIndices { expected: Option<u64>, got: u64 },

    #[error("{indices} sample indices but {priorities} priorities")]
    LengthMismatch { indices: usize, priorities: usize },
}

/// Handle to the slots drawn by one `sample` call.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleIndices {
    sample_id: u64,
    slots: Vec<usize>,
    generations: Vec<u64>,
}

impl SampleIndices {
    pub fn sample_id(&self) -> u64 {
        self.sample_id
    }

    /// Ring slots, one per sampled item, in batch order.
    pub fn slots(&self) -> &[usize] {
        &self.slots
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// One prioritized batch.
#[derive(Debug, Clone)]
pub struct SampledBatch<T> {
    pub items: Vec<T>,
    pub indices: SampleIndices,
    /// Importance weight per item, at most 1.0.
    pub weights: Vec<f32>,
}

/// Replay buffer of fragments as used by the actor pool and learner.
pub type FragmentReplay = PriorityReplayBuffer<Arc<Fragment>>;

/// Bounded FIFO ring with priority-proportional sampling.
pub struct PriorityReplayBuffer<T: Send> {
    injector: Injector<(T, f32)>,
    pushed: AtomicUsize,
    store: Mutex<Store<T>>,
    config: ReplayConfig,
}

struct Store<T> {
    slots: Vec<Option<T>>,
    /// Bumped whenever a slot is overwritten.
    generations: Vec<u64>,
    tree: SumTree,
    next: usize,
    len: usize,
    sample_count: u64,
    last_sample: Option<u64>,
}

impl<T: Send + Clone> PriorityReplayBuffer<T> {
    pub fn new(config: ReplayConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            injector: Injector::new(),
            pushed: AtomicUsize::new(0),
            store: Mutex::new(Store {
                slots: (0..capacity).map(|_| None).collect(),
                generations: vec![0; capacity],
                tree: SumTree::new(capacity),
                next: 0,
                len: 0,
                sample_count: 0,
                last_sample: None,
            }),
            config,
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity.max(1)
    }

    /// Insert `item` with an initial priority. Never blocks.
    pub fn push(&self, item: T, priority: f32) {
        self.injector.push((item, priority));
        self.pushed.fetch_add(1, Ordering::AcqRel);
    }

    /// Current occupancy, counting items not yet consolidated.
    ///
    /// Grows with every push until it reaches capacity, then stays there.
    pub fn size(&self) -> usize {
        self.pushed.load(Ordering::Acquire).min(self.capacity())
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Total number of pushes since construction.
    pub fn num_pushed(&self) -> usize {
        self.pushed.load(Ordering::Acquire)
    }

    fn scaled(&self, priority: f32) -> f64 {
        ((priority.abs() + self.config.epsilon) as f64).powf(self.config.alpha as f64)
    }

    fn consolidate(&self, store: &mut Store<T>) {
        loop {
            match self.injector.steal() {
                Steal::Success((item, priority)) => {
                    let slot = store.next;
                    if store.slots[slot].is_some() {
                        store.generations[slot] += 1;
                    }
                    store.slots[slot] = Some(item);
                    store.tree.update(slot, self.scaled(priority));
                    store.next = (slot + 1) % store.slots.len();
                    store.len = (store.len + 1).min(store.slots.len());
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }
    }

    /// Draw `batch_size` items with replacement, proportional to priority.
    ///
    /// Returns exactly `batch_size` items whenever the buffer is non-empty.
    pub fn sample(&self, batch_size: usize) -> Result<SampledBatch<T>, ReplayError> {
        let mut store = self.store.lock();
        self.consolidate(&mut store);
        if store.len == 0 {
            return Err(ReplayError::Empty);
        }

        let mut rng = rand::thread_rng();
        let total = store.tree.total();
        let n = store.len as f64;
        let segment = total / batch_size.max(1) as f64;

        let mut slots = Vec::with_capacity(batch_size);
        let mut probs = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            // Stratified: one draw per equal-mass segment.
            let low = segment * i as f64;
            let high = (segment * (i + 1) as f64).min(total);
            let value = if high > low { rng.gen_range(low..high) } else { low };
            let mut slot = store.tree.find(value);
            if slot >= store.len || store.tree.leaf(slot) <= 0.0 {
                slot = rng.gen_range(0..store.len);
            }
            slots.push(slot);
            probs.push(store.tree.leaf(slot) / total);
        }

        let beta = self.config.beta as f64;
        let raw: Vec<f64> = probs.iter().map(|&p| (n * p).powf(-beta)).collect();
        let max_weight = raw.iter().copied().fold(0.0, f64::max);
        let weights = raw
            .iter()
            .map(|&w| if max_weight > 0.0 { (w / max_weight) as f32 } else { 1.0 })
            .collect();

        let items = slots
            .iter()
            .filter_map(|&s| store.slots[s].clone())
            .collect();
        let generations = slots.iter().map(|&s| store.generations[s]).collect();

        store.sample_count += 1;
        let sample_id = store.sample_count;
        store.last_sample = Some(sample_id);

        Ok(SampledBatch {
            items,
            indices: SampleIndices {
                sample_id,
                slots,
                generations,
            },
            weights,
        })
    }

    /// Overwrite priorities of the most recently sampled items.
    ///
    /// Items pushed since the sample are consolidated first; any sampled slot
    /// they overwrote keeps its new priority.
    pub fn update_priority(
        &self,
        indices: &SampleIndices,
        priorities: &[f32],
    ) -> Result<(), ReplayError> {
        if indices.len() != priorities.len() {
            return Err(ReplayError::LengthMismatch {
                indices: indices.len(),
                priorities: priorities.len(),
            });
        }
        let mut store = self.store.lock();
        if store.last_sample != Some(indices.sample_id) {
            return Err(ReplayError::StaleIndices {
                expected: store.last_sample,
                got: indices.sample_id,
            });
        }
        self.consolidate(&mut store);

        let mut skipped = 0;
        for ((&slot, &generation), &priority) in indices
            .slots
            .iter()
            .zip(&indices.generations)
            .zip(priorities)
        {
            if store.generations[slot] != generation {
                skipped += 1;
                continue;
            }
            store.tree.update(slot, self.scaled(priority));
        }
        if skipped > 0 {
            log::debug!("skipped {skipped} priority updates for evicted slots");
        }
        Ok(())
    }

    /// Scaled priority currently stored for `slot`, for diagnostics.
    pub fn slot_priority(&self, slot: usize) -> f64 {
        let store = self.store.lock();
        store.tree.leaf(slot)
    }
}

/// Sum tree over leaf priorities: O(log N) update and proportional lookup.
///
/// Internal nodes occupy `[0, capacity - 1)`, leaves `[capacity - 1, 2 * capacity - 1)`.
#[derive(Debug, Clone)]
pub struct SumTree {
    nodes: Vec<f64>,
    capacity: usize,
}

impl SumTree {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            nodes: vec![0.0; 2 * capacity - 1],
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn update(&mut self, index: usize, priority: f64) {
        let mut node = self.capacity - 1 + index;
        let change = priority - self.nodes[node];
        self.nodes[node] = priority;
        while node > 0 {
            node = (node - 1) / 2;
            self.nodes[node] += change;
        }
    }

    pub fn leaf(&self, index: usize) -> f64 {
        self.nodes[self.capacity - 1 + index]
    }

    pub fn total(&self) -> f64 {
        self.nodes[0]
    }

    /// Leaf whose cumulative range contains `value`.
    pub fn find(&self, value: f64) -> usize {
        let mut value = value.max(0.0);
        let mut node = 0;
        while node < self.capacity - 1 {
            let left = 2 * node + 1;
            if value < self.nodes[left] {
                node = left;
            } else {
                value -= self.nodes[left];
                node = left + 1;
            }
        }
        node - (self.capacity - 1)
    }
}
