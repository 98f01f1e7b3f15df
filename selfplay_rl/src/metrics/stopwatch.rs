//! Section timing and running means for the training loop.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Accumulates wall time per named section of a repeated loop.
///
/// Each [`Stopwatch::time`] call charges the time since the previous call
/// (or since [`Stopwatch::reset`]) to the given section.
#[derive(Debug, Clone)]
pub struct Stopwatch {
    last: Instant,
    sections: BTreeMap<&'static str, (Duration, u64)>,
}

impl Stopwatch {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
            sections: BTreeMap::new(),
        }
    }

    /// Restart the clock without charging any section.
    pub fn reset(&mut self) {
        self.last = Instant::now();
    }

    pub fn time(&mut self, section: &'static str) {
        let now = Instant::now();
        let entry = self.sections.entry(section).or_default();
        entry.0 += now - self.last;
        entry.1 += 1;
        self.last = now;
    }

    pub fn total(&self, section: &str) -> Duration {
        self.sections.get(section).map(|e| e.0).unwrap_or_default()
    }

    /// Mean milliseconds per charge, 0 for unknown sections.
    pub fn mean_ms(&self, section: &str) -> f64 {
        match self.sections.get(section) {
            Some(&(total, n)) if n > 0 => total.as_secs_f64() * 1e3 / n as f64,
            _ => 0.0,
        }
    }

    /// One line per section with its share of the total time.
    pub fn summary(&self) -> String {
        let all: f64 = self.sections.values().map(|e| e.0.as_secs_f64()).sum();
        let mut out = String::new();
        for (name, &(total, _)) in &self.sections {
            let share = if all > 0.0 {
                total.as_secs_f64() / all * 100.0
            } else {
                0.0
            };
            let _ = writeln!(
                out,
                "{name}: {:.3} ms/call, {:.1}%",
                self.mean_ms(name),
                share
            );
        }
        out
    }

    /// Number of charges to `section`.
    pub fn calls(&self, section: &str) -> u64 {
        self.sections.get(section).map(|e| e.1).unwrap_or(0)
    }

    pub fn clear(&mut self) {
        self.sections.clear();
        self.reset();
    }
}

impl Default for Stopwatch {
    fn default() -> Self {
        Self::new()
    }
}

/// Named running means, reset every epoch.
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    values: BTreeMap<String, (f64, u64)>,
}

impl EpochStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-finite values are kept, so a diverged run shows up as a NaN or
    /// infinite mean.
    pub fn feed(&mut self, key: &str, value: f64) {
        let entry = self.values.entry(key.to_string()).or_default();
        entry.0 += value;
        entry.1 += 1;
    }

    /// Mean of every value fed under `key`, 0 if none.
    pub fn mean(&self, key: &str) -> f64 {
        match self.values.get(key) {
            Some(&(sum, n)) if n > 0 => sum / n as f64,
            _ => 0.0,
        }
    }

    pub fn count(&self, key: &str) -> u64 {
        self.values.get(key).map(|e| e.1).unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        self.values
            .keys()
            .map(|k| format!("{k}: {:.5}", self.mean(k)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    pub fn reset(&mut self) {
        self.values.clear();
    }
}
