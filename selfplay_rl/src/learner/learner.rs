//! Learner component for gradient updates.
//!
//! The learner owns the online model and its target copy, samples
//! prioritized batches from the replay buffer and feeds the new priorities
//! back. Every update `n` runs the same protocol:
//!
//! ```text
//! n % target_sync_freq == 0  ->  target <- online
//! n % actor_sync_freq  == 0  ->  push online weights to the actors
//! sample -> loss -> clip -> apply -> update_priority
//! ```
//!
//! It runs on the caller's thread; actors keep producing on theirs.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buffers::{FragmentReplay, ReplayError};
use crate::error::ConfigError;
use crate::metrics::{EpochStats, Stopwatch};
use crate::model::{clip_grad_norm, PolicyModel};

/// Receives fresh online weights from the learner.
///
/// The actor pool implements this to refresh its online servers.
pub trait WeightSink<M> {
    fn push_weights(&self, model: &M);
}

/// Learner configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnerConfig {
    pub batch_size: usize,
    pub lr: f32,
    /// Global gradient norm limit, non-positive disables clipping.
    pub grad_clip: f32,
    /// Updates between target network syncs.
    pub target_sync_freq: usize,
    /// Updates between weight pushes to the actors.
    pub actor_sync_freq: usize,
    /// Updates per epoch.
    pub epoch_len: usize,
    /// Buffer occupancy required before the first update.
    pub burn_in: usize,
    pub warmup_poll_ms: u64,
    /// Give up waiting for warm-up after this long, 0 waits forever.
    pub warmup_timeout_secs: u64,
}

impl Default for LearnerConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            lr: 6.25e-5,
            grad_clip: 5.0,
            target_sync_freq: 2500,
            actor_sync_freq: 10,
            epoch_len: 1000,
            burn_in: 1000,
            warmup_poll_ms: 100,
            warmup_timeout_secs: 0,
        }
    }
}

impl LearnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_lr(mut self, lr: f32) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_grad_clip(mut self, grad_clip: f32) -> Self {
        self.grad_clip = grad_clip;
        self
    }

    pub fn with_target_sync_freq(mut self, freq: usize) -> Self {
        self.target_sync_freq = freq;
        self
    }

    pub fn with_actor_sync_freq(mut self, freq: usize) -> Self {
        self.actor_sync_freq = freq;
        self
    }

    pub fn with_epoch_len(mut self, epoch_len: usize) -> Self {
        self.epoch_len = epoch_len;
        self
    }

    pub fn with_burn_in(mut self, burn_in: usize) -> Self {
        self.burn_in = burn_in;
        self
    }

    pub fn with_warmup_poll_ms(mut self, ms: u64) -> Self {
        self.warmup_poll_ms = ms;
        self
    }

    pub fn with_warmup_timeout_secs(mut self, secs: u64) -> Self {
        self.warmup_timeout_secs = secs;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("batch_size", self.batch_size)?;
        ConfigError::check_nonzero("target_sync_freq", self.target_sync_freq)?;
        ConfigError::check_nonzero("actor_sync_freq", self.actor_sync_freq)?;
        ConfigError::check_nonzero("epoch_len", self.epoch_len)?;
        ConfigError::check_nonzero("burn_in", self.burn_in)?;
        ConfigError::check_nonzero("warmup_poll_ms", self.warmup_poll_ms as usize)?;
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(ConfigError::OutOfRange {
                name: "lr",
                value: self.lr as f64,
                range: "(0, inf)",
            });
        }
        Ok(())
    }
}

/// Result of one gradient update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateStats {
    /// Index of the update, counting from 0.
    pub update: u64,
    pub loss: f32,
    /// Gradient norm before clipping.
    pub grad_norm: f32,
    pub target_synced: bool,
    pub weights_pushed: bool,
}

/// Aggregate of one epoch of updates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EpochSummary {
    /// Updates completed in this epoch.
    pub updates: usize,
    /// Total updates since construction.
    pub total_updates: u64,
    pub mean_loss: f32,
    pub mean_grad_norm: f32,
    pub elapsed_secs: f32,
    pub updates_per_second: f32,
}

/// Rate with a guard against tiny or zero elapsed time.
fn safe_rate(count: u64, elapsed_secs: f32) -> f32 {
    const MIN_ELAPSED: f32 = 1e-6;
    const MAX_RATE: f32 = 1e9;

    if elapsed_secs < MIN_ELAPSED {
        0.0
    } else {
        (count as f32 / elapsed_secs).clamp(0.0, MAX_RATE)
    }
}

/// Prioritized double-network learner.
pub struct Learner<M: PolicyModel> {
    config: LearnerConfig,
    online: M,
    target: M,
    replay: Arc<FragmentReplay>,
    updates: u64,
    shutdown: Arc<AtomicBool>,
    stats: EpochStats,
    stopwatch: Stopwatch,
}

impl<M: PolicyModel> Learner<M> {
    pub fn new(
        config: LearnerConfig,
        model: M,
        replay: Arc<FragmentReplay>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            target: model.clone(),
            online: model,
            config,
            replay,
            updates: 0,
            shutdown: Arc::new(AtomicBool::new(false)),
            stats: EpochStats::new(),
            stopwatch: Stopwatch::new(),
        })
    }

    /// Share an externally owned shutdown flag.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &LearnerConfig {
        &self.config
    }

    pub fn model(&self) -> &M {
        &self.online
    }

    pub fn target(&self) -> &M {
        &self.target
    }

    pub fn replay(&self) -> &Arc<FragmentReplay> {
        &self.replay
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }

    /// Per-section timings of the updates run so far.
    pub fn timings(&self) -> &Stopwatch {
        &self.stopwatch
    }

    /// Sleep-poll until the buffer holds `burn_in` fragments.
    ///
    /// Returns false if shutdown was requested or the timeout expired first.
    pub fn wait_for_warmup(&self) -> bool {
        let poll = Duration::from_millis(self.config.warmup_poll_ms);
        let report_every = Duration::from_secs(5);
        let timeout = (self.config.warmup_timeout_secs > 0)
            .then(|| Duration::from_secs(self.config.warmup_timeout_secs));
        let start = Instant::now();
        let mut last_report = start;

        loop {
            let size = self.replay.size();
            if size >= self.config.burn_in {
                log::info!(
                    "warm-up done: {} fragments after {:.1}s",
                    size,
                    start.elapsed().as_secs_f32()
                );
                return true;
            }
            if self.is_shutdown() {
                log::info!("warm-up interrupted by shutdown at {size}/{}", self.config.burn_in);
                return false;
            }
            if let Some(timeout) = timeout {
                if start.elapsed() >= timeout {
                    log::warn!(
                        "warm-up timed out after {:?} at {size}/{}",
                        timeout,
                        self.config.burn_in
                    );
                    return false;
                }
            }
            if last_report.elapsed() >= report_every {
                log::info!("warming up replay buffer: {size}/{}", self.config.burn_in);
                last_report = Instant::now();
            }
            std::thread::sleep(poll);
        }
    }

    /// Run one update.
    ///
    /// A stale priority update is a broken contract between sample and
    /// update; it is logged and returned as an error.
    pub fn train_step<S: WeightSink<M> + ?Sized>(
        &mut self,
        sink: &S,
    ) -> Result<UpdateStats, ReplayError> {
        let n = self.updates;
        let mut stats = UpdateStats {
            update: n,
            ..Default::default()
        };
        self.stopwatch.reset();

        if n % self.config.target_sync_freq as u64 == 0 {
            self.target = self.online.clone();
            stats.target_synced = true;
        }
        if n % self.config.actor_sync_freq as u64 == 0 {
            sink.push_weights(&self.online);
            stats.weights_pushed = true;
        }
        self.stopwatch.time("sync");

        let batch = self.replay.sample(self.config.batch_size)?;
        self.stopwatch.time("sample");

        let mut output = self.online.loss(&self.target, &batch.items, &batch.weights);
        stats.loss = output.loss;
        stats.grad_norm = clip_grad_norm(&mut output.gradients, self.config.grad_clip);
        self.online.apply_gradients(&output.gradients, self.config.lr);
        self.stopwatch.time("train");
        if !stats.loss.is_finite() || !stats.grad_norm.is_finite() {
            log::warn!(
                "update {}: non-finite loss {} (grad norm {})",
                n,
                stats.loss,
                stats.grad_norm
            );
        }

        if let Err(e) = self.replay.update_priority(&batch.indices, &output.priorities) {
            log::error!("priority update {} rejected: {}", n, e);
            return Err(e);
        }
        self.stopwatch.time("update priority");

        self.stats.feed("loss", stats.loss as f64);
        self.stats.feed("grad_norm", stats.grad_norm as f64);
        for (key, value) in &output.aux {
            self.stats.feed(key, *value as f64);
        }
        self.updates += 1;
        Ok(stats)
    }

    /// Run `epoch_len` updates, stopping early on shutdown.
    pub fn train_epoch<S: WeightSink<M> + ?Sized>(
        &mut self,
        sink: &S,
    ) -> Result<EpochSummary, ReplayError> {
        self.stats.reset();
        self.stopwatch.clear();
        let start = Instant::now();
        let mut done = 0;
        for _ in 0..self.config.epoch_len {
            if self.is_shutdown() {
                break;
            }
            self.train_step(sink)?;
            done += 1;
        }
        let elapsed = start.elapsed().as_secs_f32();
        log::debug!("update timings:\n{}", self.stopwatch.summary());
        log::debug!("epoch stats: {}", self.stats.summary());

        Ok(EpochSummary {
            updates: done,
            total_updates: self.updates,
            mean_loss: self.stats.mean("loss") as f32,
            mean_grad_norm: self.stats.mean("grad_norm") as f32,
            elapsed_secs: elapsed,
            updates_per_second: safe_rate(done as u64, elapsed),
        })
    }

    /// Running mean of a loss diagnostic over the current epoch.
    pub fn epoch_mean(&self, key: &str) -> f64 {
        self.stats.mean(key)
    }
}
