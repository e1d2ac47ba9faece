//! Decisions awaiting their completion report.
//!
//! Each `decide` parks a [`DecisionContext`] under its call id; the matching
//! `report` removes it. A host that never reports would grow this table
//! forever, so it is bounded: when full, the oldest context is evicted, and
//! an optional TTL expires contexts by age. Evicted contexts never touch the
//! store, exactly like contexts that are never reported.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, TunerError};
use crate::mab::{Action, Bucket, CallId};

/// Ephemeral state linking a decision to its report.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecisionContext {
    pub bucket: Bucket,
    pub action: Action,
    pub dispatched_at: Instant,
}

struct Slot {
    generation: u64,
    context: DecisionContext,
}

struct PendingInner {
    entries: HashMap<CallId, Slot>,
    /// Insertion order; entries already taken are skipped lazily.
    order: VecDeque<(CallId, u64)>,
    next_generation: u64,
}

/// Bounded call-id -> context table.
pub struct PendingTable {
    inner: Mutex<PendingInner>,
    capacity: usize,
    ttl: Option<Duration>,
}

impl PendingTable {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            inner: Mutex::new(PendingInner {
                entries: HashMap::with_capacity(capacity.min(1024)),
                order: VecDeque::new(),
                next_generation: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Park a context. Returns the number of contexts evicted to make room.
    ///
    /// A call id that is still pending is a contract violation.
    pub fn insert(&self, call_id: CallId, context: DecisionContext) -> Result<usize> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&call_id) {
            return Err(TunerError::DuplicateCallId(call_id));
        }

        let mut evicted = 0;
        let now = context.dispatched_at;
        while let Some(&(oldest, generation)) = inner.order.front() {
            let live = inner
                .entries
                .get(&oldest)
                .filter(|slot| slot.generation == generation);
            let Some(slot) = live else {
                inner.order.pop_front();
                continue;
            };
            let expired = self
                .ttl
                .is_some_and(|ttl| now.saturating_duration_since(slot.context.dispatched_at) > ttl);
            if !expired && inner.entries.len() < self.capacity {
                break;
            }
            inner.order.pop_front();
            inner.entries.remove(&oldest);
            evicted += 1;
        }

        let generation = inner.next_generation;
        inner.next_generation += 1;
        inner.entries.insert(
            call_id,
            Slot {
                generation,
                context,
            },
        );
        inner.order.push_back((call_id, generation));

        // Taken entries leave stale order records behind; compact occasionally.
        if inner.order.len() > self.capacity * 2 {
            let PendingInner { entries, order, .. } = &mut *inner;
            order.retain(|(id, generation)| {
                entries
                    .get(id)
                    .is_some_and(|slot| slot.generation == *generation)
            });
        }

        Ok(evicted)
    }

    /// Remove and return the context for `call_id`, if still pending and not expired.
    pub fn take(&self, call_id: CallId) -> Option<DecisionContext> {
        let slot = self.inner.lock().entries.remove(&call_id)?;
        match self.ttl {
            Some(ttl) if slot.context.dispatched_at.elapsed() > ttl => None,
            _ => Some(slot.context),
        }
    }

    /// Dispatch time of a pending call, without consuming it.
    pub fn peek_dispatched_at(&self, call_id: CallId) -> Option<Instant> {
        self.inner
            .lock()
            .entries
            .get(&call_id)
            .map(|slot| slot.context.dispatched_at)
    }

    pub fn contains(&self, call_id: CallId) -> bool {
        self.inner.lock().entries.contains_key(&call_id)
    }

    /// Number of pending contexts.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every pending context.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mab::{CollType, Topology};

    fn context() -> DecisionContext {
        DecisionContext {
            bucket: Bucket::new(CollType::AllReduce, 1 << 20, Topology::default()),
            action: Action::AUTO,
            dispatched_at: Instant::now(),
        }
    }

    #[test]
    fn test_insert_and_take() {
        let table = PendingTable::new(8, None);
        assert_eq!(table.insert(CallId(1), context()).unwrap(), 0);
        assert_eq!(table.len(), 1);
        assert!(table.take(CallId(1)).is_some());
        assert!(table.take(CallId(1)).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_duplicate_in_flight_id_rejected() {
        let table = PendingTable::new(8, None);
        table.insert(CallId(1), context()).unwrap();
        let err = table.insert(CallId(1), context()).unwrap_err();
        assert!(err.is_contract_violation());
        // Once consumed, the id may be reused.
        table.take(CallId(1));
        assert!(table.insert(CallId(1), context()).is_ok());
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let table = PendingTable::new(2, None);
        table.insert(CallId(1), context()).unwrap();
        table.insert(CallId(2), context()).unwrap();
        assert_eq!(table.insert(CallId(3), context()).unwrap(), 1);
        assert_eq!(table.len(), 2);
        assert!(table.take(CallId(1)).is_none());
        assert!(table.take(CallId(2)).is_some());
        assert!(table.take(CallId(3)).is_some());
    }

    #[test]
    fn test_taken_entries_do_not_count_toward_eviction() {
        let table = PendingTable::new(2, None);
        for i in 0..100 {
            table.insert(CallId(i), context()).unwrap();
            assert!(table.take(CallId(i)).is_some());
        }
        table.insert(CallId(1000), context()).unwrap();
        assert_eq!(table.insert(CallId(1001), context()).unwrap(), 0);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ttl_expires_on_take() {
        let table = PendingTable::new(8, Some(Duration::from_millis(1)));
        let mut old = context();
        old.dispatched_at = Instant::now() - Duration::from_millis(50);
        table.insert(CallId(1), old).unwrap();
        assert!(table.take(CallId(1)).is_none());
    }

    #[test]
    fn test_ttl_expires_on_insert() {
        let table = PendingTable::new(8, Some(Duration::from_millis(10)));
        let mut old = context();
        old.dispatched_at = Instant::now() - Duration::from_millis(100);
        table.insert(CallId(1), old).unwrap();
        assert_eq!(table.insert(CallId(2), context()).unwrap(), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_insert_and_take() {
        let table = std::sync::Arc::new(PendingTable::new(1 << 16, None));
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let table = table.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        let id = CallId(t * 1_000_000 + i);
                        table.insert(id, context()).unwrap();
                        assert!(table.take(id).is_some());
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(table.is_empty());
    }
}
