//! Self-play actors and the threads that drive them.
//!
//! - [`Actor`]: capability set shared by learned and rule-based actors
//! - [`LearnedActor`]: epsilon-greedy seat backed by an inference server
//! - [`RuleBot`]: fixed policy, no server
//! - [`ActorPool`]: servers plus the thread × game × seat training grid
//! - [`GameThreadLoop`] / [`ThreadLoopContext`]: turn-order game driving

pub mod actor;
pub mod actor_pool;
pub mod learned;
pub mod rule_bot;
pub mod thread_loop;


pub use actor::{Actor, ActorId, StatCounters};
pub use actor_pool::{ActorPool, ActorPoolConfig, GridEntry, PartnerWeights, PoolError, ServerPair};
pub use learned::{LearnedActor, DEFAULT_FRAGMENT_LEN};
pub use rule_bot::{RuleBot, RuleBotKind};
pub use thread_loop::{
    EpisodeRecord, GameThreadLoop, LoopMode, LoopOutcome, LoopProgress, ThreadLoopContext,
};
