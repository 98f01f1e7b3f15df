//! Experience storage between actors and the learner.
//!
//! - `PriorityReplayBuffer`: lock-free push from many actors, prioritized
//!   sampling and priority feedback for one learner.

pub mod priority_replay;

pub use priority_replay::{
    FragmentReplay, PriorityReplayBuffer, ReplayConfig, ReplayError, SampleIndices,
    SampledBatch, SumTree,
};
