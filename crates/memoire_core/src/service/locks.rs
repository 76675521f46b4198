//! Per-context mutual exclusion for membership mutations.
//!
//! # Invariants
//! - A guard holds every context id it was asked for, or none of them:
//!   acquisition waits until the whole set is free, so two multi-context
//!   operations can never hold one id each and wait on the other.
//! - Dropping a guard releases its ids and wakes all waiters.
//! - Operations on disjoint context sets never contend.

use crate::model::memory::ContextId;
use std::collections::{BTreeSet, HashSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

#[derive(Default)]
pub struct ContextLockTable {
    held: Mutex<HashSet<ContextId>>,
    released: Condvar,
}

/// Exclusive hold over a set of contexts.
pub struct ContextLockGuard<'a> {
    table: &'a ContextLockTable,
    ids: BTreeSet<ContextId>,
}

impl ContextLockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until every id in `ids` is free, then holds all of them.
    pub fn acquire(&self, ids: impl IntoIterator<Item = ContextId>) -> ContextLockGuard<'_> {
        let ids: BTreeSet<ContextId> = ids.into_iter().collect();
        let mut held = self.held();
        while ids.iter().any(|id| held.contains(id)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.extend(ids.iter().copied());
        ContextLockGuard { table: self, ids }
    }

    /// Locks the context set returned by `resolve`, re-resolving after the
    /// locks are held until the set is stable.
    ///
    /// Used when the contexts to lock are read from the store and may change
    /// between the read and the acquisition.
    pub fn lock_until_stable<E>(
        &self,
        mut resolve: impl FnMut() -> Result<BTreeSet<ContextId>, E>,
    ) -> Result<(ContextLockGuard<'_>, BTreeSet<ContextId>), E> {
        let mut wanted = resolve()?;
        loop {
            let guard = self.acquire(wanted.iter().copied());
            let current = resolve()?;
            if current.is_subset(&guard.ids) {
                return Ok((guard, current));
            }
            drop(guard);
            wanted = wanted.union(&current).copied().collect();
        }
    }

    #[cfg(test)]
    fn held_count(&self) -> usize {
        self.held().len()
    }

    // The set only records ownership; it stays consistent if a holder panicked.
    fn held(&self) -> MutexGuard<'_, HashSet<ContextId>> {
        self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ContextLockGuard<'_> {
    pub fn ids(&self) -> &BTreeSet<ContextId> {
        &self.ids
    }
}

impl Drop for ContextLockGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.table.held();
        for id in &self.ids {
            held.remove(id);
        }
        drop(held);
        self.table.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::ContextLockTable;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use uuid::Uuid;

    #[test]
    fn guard_releases_on_drop() {
        let table = ContextLockTable::new();
        let ids = [Uuid::new_v4(), Uuid::new_v4()];
        {
            let guard = table.acquire(ids);
            assert_eq!(guard.ids().len(), 2);
            assert_eq!(table.held_count(), 2);
        }
        assert_eq!(table.held_count(), 0);
    }

    #[test]
    fn overlapping_sets_serialize() {
        let table = Arc::new(ContextLockTable::new());
        let shared = Uuid::new_v4();
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    let _guard = table.acquire([shared, Uuid::new_v4()]);
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    thread::yield_now();
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn lock_until_stable_widens_to_late_arrivals() {
        let table = ContextLockTable::new();
        let first = Uuid::new_v4();
        let late = Uuid::new_v4();
        let mut calls = 0;

        let (guard, resolved) = table
            .lock_until_stable(|| -> Result<BTreeSet<Uuid>, ()> {
                calls += 1;
                Ok(if calls == 1 {
                    BTreeSet::from([first])
                } else {
                    BTreeSet::from([first, late])
                })
            })
            .unwrap();
        assert_eq!(resolved, BTreeSet::from([first, late]));
        assert!(guard.ids().contains(&late));
    }
}
