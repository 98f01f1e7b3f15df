//! Versioned, immutable model snapshots and the slot servers read them from.
//!
//! The learner owns the only mutable model. Whenever weights are broadcast,
//! a fresh [`ModelSnapshot`] is built and swapped into each server's
//! [`SnapshotSlot`]. Readers clone the `Arc` once per batch, so a batch that
//! started on an old snapshot finishes on it even if a swap lands mid-way.
//!
//! ```text
//! Learner ──replace()──> SnapshotSlot ──load()──> dispatch batch N   (old Arc)
//!                                      ──load()──> dispatch batch N+1 (new Arc)
//! ```

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Atomic version counter shared by everything that publishes snapshots.
#[derive(Debug, Default)]
pub struct VersionCounter {
    version: AtomicU64,
}

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment and return the new version.
    pub fn increment(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn current(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

/// Immutable parameter set tagged with the version it was published at.
#[derive(Debug)]
pub struct ModelSnapshot<M> {
    model: M,
    version: u64,
}

impl<M> ModelSnapshot<M> {
    pub fn new(model: M, version: u64) -> Self {
        Self { model, version }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// How many versions behind `current` this snapshot is.
    pub fn lag(&self, current: u64) -> u64 {
        current.saturating_sub(self.version)
    }
}

/// Holds the snapshot currently served, replaced wholesale on broadcast.
pub struct SnapshotSlot<M> {
    current: RwLock<Arc<ModelSnapshot<M>>>,
    swaps: AtomicUsize,
}

impl<M> SnapshotSlot<M> {
    pub fn new(initial: ModelSnapshot<M>) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
            swaps: AtomicUsize::new(0),
        }
    }

    /// Snapshot to run the next batch against.
    pub fn load(&self) -> Arc<ModelSnapshot<M>> {
        Arc::clone(&self.current.read())
    }

    /// Install `snapshot` and return the one it replaced.
    pub fn replace(&self, snapshot: Arc<ModelSnapshot<M>>) -> Arc<ModelSnapshot<M>> {
        let previous = std::mem::replace(&mut *self.current.write(), snapshot);
        self.swaps.fetch_add(1, Ordering::Relaxed);
        previous
    }

    pub fn version(&self) -> u64 {
        self.current.read().version()
    }

    /// Number of replacements since construction.
    pub fn swaps(&self) -> usize {
        self.swaps.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_version_counter_increment() {
        let counter = VersionCounter::new();
        assert_eq!(counter.current(), 0);
        assert_eq!(counter.increment(), 1);
        assert_eq!(counter.increment(), 2);
        assert_eq!(counter.current(), 2);
    }

    #[test]
    fn test_snapshot_lag() {
        let snap = ModelSnapshot::new((), 5);
        assert_eq!(snap.lag(5), 0);
        assert_eq!(snap.lag(8), 3);
        assert_eq!(snap.lag(2), 0);
    }

    #[test]
    fn test_loaded_snapshot_survives_replace() {
        let slot = SnapshotSlot::new(ModelSnapshot::new(vec![1.0f32], 1));
        let in_flight = slot.load();

        let previous = slot.replace(Arc::new(ModelSnapshot::new(vec![2.0], 2)));
        assert_eq!(previous.version(), 1);

        // The reader that loaded before the swap still sees its weights.
        assert_eq!(in_flight.model(), &vec![1.0]);
        assert_eq!(slot.load().model(), &vec![2.0]);
        assert_eq!(slot.version(), 2);
        assert_eq!(slot.swaps(), 1);
    }

    #[test]
    fn test_concurrent_readers_see_monotonic_versions() {
        let slot = Arc::new(SnapshotSlot::new(ModelSnapshot::new(0u64, 0)));
        let writer = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                for v in 1..=200u64 {
                    slot.replace(Arc::new(ModelSnapshot::new(v, v)));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let slot = Arc::clone(&slot);
                thread::spawn(move || {
                    let mut last = 0;
                    for _ in 0..500 {
                        let snap = slot.load();
                        assert!(snap.version() >= last);
                        assert_eq!(*snap.model(), snap.version());
                        last = snap.version();
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(slot.version(), 200);
    }
}
