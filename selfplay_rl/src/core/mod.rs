//! Core data types shared by actors, servers and the learner.

pub mod fragment;
pub mod snapshot;

pub use fragment::Fragment;
pub(crate) use fragment::FragmentBuilder;
pub use snapshot::{ModelSnapshot, SnapshotSlot, VersionCounter};
