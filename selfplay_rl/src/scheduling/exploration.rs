//! Per-thread exploration rates.
//!
//! Each game-loop thread gets one epsilon, shared by every learned seat it
//! drives, so the actor pool covers a spread of exploration/exploitation
//! trade-offs at once.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Ordered epsilons, one per actor thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplorationSchedule {
    rates: Vec<f32>,
}

impl ExplorationSchedule {
    /// `n` rates geometrically spaced from `max` (thread 0) down to `min`.
    ///
    /// A single thread gets `max`. `min` must be positive for the ratio
    /// between neighbours to be defined.
    pub fn geometric(min: f32, max: f32, n: usize) -> Result<Self, ConfigError> {
        ConfigError::check_nonzero("exploration threads", n)?;
        ConfigError::check_range("explore_min", min as f64, f64::MIN_POSITIVE, 1.0, "(0, 1]")?;
        ConfigError::check_range("explore_max", max as f64, min as f64, 1.0, "[explore_min, 1]")?;

        if n == 1 {
            return Ok(Self { rates: vec![max] });
        }
        let ratio = (min as f64) / (max as f64);
        let rates = (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                let rate = max as f64 * ratio.powf(t);
                (rate as f32).clamp(min, max)
            })
            .collect();
        Ok(Self { rates })
    }

    /// Ape-X style rates `base^(1 + i/(n-1) * alpha)`.
    ///
    /// Rates below `1e-6` are rounded to zero so the last threads act greedily.
    pub fn ape_x(base: f32, alpha: f32, n: usize) -> Result<Self, ConfigError> {
        ConfigError::check_nonzero("exploration threads", n)?;
        ConfigError::check_range("explore_base", base as f64, 0.0, 1.0, "[0, 1]")?;
        if n == 1 {
            return Ok(Self { rates: vec![base] });
        }
        let rates = (0..n)
            .map(|i| {
                let exponent = 1.0 + (i as f32 / (n - 1) as f32) * alpha;
                let rate = base.powf(exponent);
                if rate < 1e-6 {
                    0.0
                } else {
                    rate
                }
            })
            .collect();
        Ok(Self { rates })
    }

    /// Same rate for every thread, e.g. greedy evaluation.
    pub fn constant(rate: f32, n: usize) -> Self {
        Self {
            rates: vec![rate; n],
        }
    }

    pub fn len(&self) -> usize {
        self.rates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rates.is_empty()
    }

    /// Rate for thread `t`. Threads past the end wrap around.
    pub fn rate(&self, thread: usize) -> f32 {
        if self.rates.is_empty() {
            return 0.0;
        }
        self.rates[thread % self.rates.len()]
    }

    pub fn rates(&self) -> &[f32] {
        &self.rates
    }
}
