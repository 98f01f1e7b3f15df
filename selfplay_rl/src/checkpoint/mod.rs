//! Model checkpointing.
//!
//! State dicts are stored as JSON maps from parameter name to flat values.
//! [`TopKSaver`] keeps the `k` best-scoring models in fixed slot files
//! (`model0.json` .. `model{k-1}.json`) and can additionally write a named
//! snapshot on demand.
//!
//! ## Example
//!
//! ```rust,ignore
//! use selfplay_rl::checkpoint::{TopKSaver, TopKSaverConfig};
//!
//! let mut saver = TopKSaver::new(TopKSaverConfig::new("./exps/run1").with_k(5))?;
//!
//! // After each evaluation:
//! let kept = saver.save(&model.state_dict(), mean_score, None)?;
//!
//! // Every few epochs, also keep a named copy:
//! saver.save(&model.state_dict(), mean_score, Some("model_epoch20"))?;
//! ```

pub mod top_k;

pub use top_k::{load_state_dict, save_state_dict, CheckpointError, TopKSaver, TopKSaverConfig};
