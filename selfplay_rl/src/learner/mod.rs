//! The learner side of the actor/learner split.
//!
//! - [`Learner`]: samples prioritized batches and applies clipped updates
//! - [`WeightSink`]: where fresh online weights are pushed

pub mod learner;


pub use learner::{EpochSummary, Learner, LearnerConfig, UpdateStats, WeightSink};
