//! Top-k model checkpointing.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::error::ConfigError;
use crate::model::StateDict;

/// Configuration for [`TopKSaver`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopKSaverConfig {
    /// Directory holding the slot files and named snapshots.
    pub dir: PathBuf,
    /// Number of best models to keep.
    pub k: usize,
}

impl Default for TopKSaverConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./checkpoints"),
            k: 5,
        }
    }
}

impl TopKSaverConfig {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check_nonzero("k", self.k)
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed checkpoint {path}: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError + '_ {
    move |source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Write `state` to `path` as JSON.
pub fn save_state_dict(path: &Path, state: &StateDict) -> Result<(), CheckpointError> {
    let text = serde_json::to_string(state).map_err(|source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    })?;
    fs::write(path, text).map_err(io_error(path))
}

/// Read a state dict written by [`save_state_dict`].
pub fn load_state_dict(path: &Path) -> Result<StateDict, CheckpointError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&text).map_err(|source| CheckpointError::Format {
        path: path.to_path_buf(),
        source,
    })
}

/// Keeps the `k` best-scoring models on disk.
///
/// Slot `i` lives at `model{i}.json`. A new score that beats the worst
/// retained one overwrites that slot; ties keep the older model.
pub struct TopKSaver {
    config: TopKSaverConfig,
    scores: Vec<Option<f32>>,
}

impl TopKSaver {
    /// Create the saver, creating its directory if needed.
    pub fn new(config: TopKSaverConfig) -> Result<Self, CheckpointError> {
        config.validate()?;
        fs::create_dir_all(&config.dir).map_err(io_error(&config.dir))?;
        Ok(Self {
            scores: vec![None; config.k],
            config,
        })
    }

    pub fn config(&self) -> &TopKSaverConfig {
        &self.config
    }

    pub fn slot_path(&self, slot: usize) -> PathBuf {
        self.config.dir.join(format!("model{slot}.json"))
    }

    /// Save `state` if `score` makes the top k; also write `{force_name}.json`
    /// unconditionally when a name is given.
    ///
    /// Returns whether the model entered the top k. A NaN or infinite score
    /// never does; only the forced file is written for it.
    pub fn save(
        &mut self,
        state: &StateDict,
        score: f32,
        force_name: Option<&str>,
    ) -> Result<bool, CheckpointError> {
        if let Some(name) = force_name {
            let path = self.config.dir.join(format!("{name}.json"));
            save_state_dict(&path, state)?;
            log::info!("saved {}", path.display());
        }

        if !score.is_finite() {
            log::warn!("score {score} is not finite, skipping top-{} save", self.config.k);
            return Ok(false);
        }
        let slot = self.worst_slot();
        if let Some(worst) = self.scores[slot] {
            if score <= worst {
                return Ok(false);
            }
        }
        let path = self.slot_path(slot);
        save_state_dict(&path, state)?;
        self.scores[slot] = Some(score);
        log::info!("saved {} (score {:.3})", path.display(), score);
        Ok(true)
    }

    /// Retained scores, best first.
    pub fn retained(&self) -> Vec<f32> {
        let mut scores: Vec<f32> = self.scores.iter().flatten().copied().collect();
        scores.sort_by(|a, b| b.total_cmp(a));
        scores
    }

    /// Best retained score and the file holding it.
    pub fn best(&self) -> Option<(f32, PathBuf)> {
        self.scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (s, i)))
            .max_by(|a, b| a.0.total_cmp(&b.0))
            .map(|(score, i)| (score, self.slot_path(i)))
    }

    /// First empty slot, else the lowest-scoring one.
    fn worst_slot(&self) -> usize {
        if let Some(empty) = self.scores.iter().position(Option::is_none) {
            return empty;
        }
        self.scores
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (s, i)))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map_or(0, |(_, i)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn state(value: f32) -> StateDict {
        let mut s = StateDict::new();
        s.insert("w".into(), vec![value, -value]);
        s
    }

    #[test]
    fn test_config_builder() {
        let config = TopKSaverConfig::new("./ckpt").with_k(3);
        assert_eq!(config.dir, PathBuf::from("./ckpt"));
        assert_eq!(config.k, 3);
        assert_eq!(
            TopKSaverConfig::new("x").with_k(0).validate(),
            Err(ConfigError::Zero("k"))
        );
    }

    #[test]
    fn test_dir_creation() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("nested/run");
        let _saver = TopKSaver::new(TopKSaverConfig::new(&nested)).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn test_keeps_k_best_scores() {
        let dir = tempdir().unwrap();
        let mut saver = TopKSaver::new(TopKSaverConfig::new(dir.path()).with_k(2)).unwrap();
        let saved: Vec<bool> = [3.0, 7.0, 5.0, 9.0, 1.0]
            .iter()
            .map(|&s| saver.save(&state(s), s, None).unwrap())
            .collect();
        assert_eq!(saved, vec![true, true, true, true, false]);
        assert_eq!(saver.retained(), vec![9.0, 7.0]);
    }

    #[test]
    fn test_tie_with_worst_is_not_saved() {
        let dir = tempdir().unwrap();
        let mut saver = TopKSaver::new(TopKSaverConfig::new(dir.path()).with_k(1)).unwrap();
        assert!(saver.save(&state(1.0), 4.0, None).unwrap());
        assert!(!saver.save(&state(2.0), 4.0, None).unwrap());
        let on_disk = load_state_dict(&saver.slot_path(0)).unwrap();
        assert_eq!(on_disk, state(1.0));
    }

    #[test]
    fn test_non_finite_scores_never_retained() {
        let dir = tempdir().unwrap();
        let mut saver = TopKSaver::new(TopKSaverConfig::new(dir.path()).with_k(2)).unwrap();
        assert!(!saver.save(&state(0.0), f32::NAN, None).unwrap());
        assert!(!saver.save(&state(0.0), f32::INFINITY, Some("model_epoch3")).unwrap());
        assert!(saver.retained().is_empty());
        assert!(!saver.slot_path(0).exists());
        assert!(dir.path().join("model_epoch3.json").exists());

        for s in [3.0, 7.0, 5.0] {
            saver.save(&state(s), s, None).unwrap();
        }
        assert!(!saver.save(&state(1.0), f32::NAN, None).unwrap());
        assert_eq!(saver.retained(), vec![7.0, 5.0]);
        assert_eq!(saver.best().unwrap().0, 7.0);
    }

    #[test]
    fn test_slot_files_hold_retained_models() {
        let dir = tempdir().unwrap();
        let mut saver = TopKSaver::new(TopKSaverConfig::new(dir.path()).with_k(2)).unwrap();
        for s in [3.0, 7.0, 5.0] {
            saver.save(&state(s), s, None).unwrap();
        }
        let mut stored: Vec<f32> = (0..2)
            .map(|i| load_state_dict(&saver.slot_path(i)).unwrap()["w"][0])
            .collect();
        stored.sort_by(|a, b| b.total_cmp(a));
        assert_eq!(stored, vec![7.0, 5.0]);
        let (best, path) = saver.best().unwrap();
        assert_eq!(best, 7.0);
        assert_eq!(load_state_dict(&path).unwrap(), state(7.0));
    }

    #[test]
    fn test_forced_save_writes_named_file() {
        let dir = tempdir().unwrap();
        let mut saver = TopKSaver::new(TopKSaverConfig::new(dir.path()).with_k(1)).unwrap();
        saver.save(&state(5.0), 5.0, None).unwrap();
        let kept = saver.save(&state(1.0), 1.0, Some("model_epoch10")).unwrap();
        assert!(!kept);
        let named = dir.path().join("model_epoch10.json");
        assert_eq!(load_state_dict(&named).unwrap(), state(1.0));
    }

    #[test]
    fn test_load_missing_or_malformed() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("absent.json");
        assert!(matches!(load_state_dict(&missing), Err(CheckpointError::Io { .. })));

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "not json").unwrap();
        assert!(matches!(load_state_dict(&bad), Err(CheckpointError::Format { .. })));
    }
}
