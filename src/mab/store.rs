//! Per-(bucket, action) statistics table.
//!
//! The store is pure in-memory state: no I/O, no eviction. Each bucket owns
//! a fixed array of `ACTION_SLOTS` arms behind its own `RwLock`, so an
//! update only serializes against other calls on the same bucket and
//! concurrent selects on a bucket proceed in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::types::{Action, ArmStatistic, Bucket, ACTION_SLOTS};

/// All arms of one bucket, indexed by `Action::index()`.
pub type ArmTable = [ArmStatistic; ACTION_SLOTS];

/// Process-local table of learned arm statistics.
pub struct DecisionRecordStore {
    buckets: RwLock<HashMap<Bucket, Arc<RwLock<ArmTable>>>>,
    max_buckets: usize,
}

impl DecisionRecordStore {
    /// Create a store that tracks at most `max_buckets` buckets.
    pub fn new(max_buckets: usize) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            max_buckets,
        }
    }

    /// Ensure the bucket is tracked.
    ///
    /// Returns false if the bucket is new and the store is already full.
    pub fn admit(&self, bucket: Bucket) -> bool {
        self.entry(bucket).is_some()
    }

    /// Read one arm. Untracked arms read as zero pulls.
    pub fn get(&self, bucket: Bucket, action: Action) -> ArmStatistic {
        self.entry(bucket)
            .map(|arms| arms.read()[action.index()])
            .unwrap_or_default()
    }

    /// Fold one reward into an arm.
    ///
    /// Returns false if the bucket could not be admitted.
    pub fn update(&self, bucket: Bucket, action: Action, reward: f64) -> bool {
        match self.entry(bucket) {
            Some(arms) => {
                arms.write()[action.index()].record(reward);
                true
            }
            None => false,
        }
    }

    /// Run `f` against a consistent view of a tracked bucket's arms.
    pub fn with_arms<R>(&self, bucket: Bucket, f: impl FnOnce(&ArmTable) -> R) -> Option<R> {
        let arms = self.buckets.read().get(&bucket).cloned()?;
        let guard = arms.read();
        Some(f(&guard))
    }

    /// Number of tracked buckets.
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Capacity in buckets.
    pub fn max_buckets(&self) -> usize {
        self.max_buckets
    }

    fn entry(&self, bucket: Bucket) -> Option<Arc<RwLock<ArmTable>>> {
        if let Some(arms) = self.buckets.read().get(&bucket) {
            return Some(arms.clone());
        }

        let mut buckets = self.buckets.write();
        // Another thread may have inserted between the two locks.
        if let Some(arms) = buckets.get(&bucket) {
            return Some(arms.clone());
        }
        if buckets.len() >= self.max_buckets {
            return None;
        }
        let arms = Arc::new(RwLock::new([ArmStatistic::default(); ACTION_SLOTS]));
        buckets.insert(bucket, arms.clone());
        Some(arms)
    }
}

impl std::fmt::Debug for DecisionRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionRecordStore")
            .field("buckets", &self.bucket_count())
            .field("max_buckets", &self.max_buckets)
            .finish()
    }
}
