//! Per-bundle locking discipline.
//!
//! Two lock kinds: the install lock (a sentinel per location that
//! serializes concurrent installs of the same location) and the reentrant
//! per-bundle lock, tracked as `(owner thread, count)` in a table guarded
//! by one mutex and condition variable. Multi-bundle acquisition is
//! all-or-none: either every candidate is locked atomically or the caller
//! waits and the candidate set is recomputed.
//!
//! Lock ordering: install lock, then the installed-bundles map, then the
//! uninstalled-bundles list, then bundle locks. Callers of this coordinator
//! must never hold the installed/uninstalled map mutexes while blocking
//! here; candidate closures invoked inside `acquire_many` may take them.

use crate::BundleId;
use std::collections::{HashMap, HashSet};
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct LockState {
    owner: ThreadId,
    count: u32,
}

#[derive(Default)]
pub struct LockCoordinator {
    install: Mutex<HashSet<String>>,
    install_cv: Condvar,
    bundle: Mutex<HashMap<BundleId, LockState>>,
    bundle_cv: Condvar,
}

impl LockCoordinator {
    pub fn new() -> Self {
        Self {
            install: Mutex::new(HashSet::new()),
            install_cv: Condvar::new(),
            bundle: Mutex::new(HashMap::new()),
            bundle_cv: Condvar::new(),
        }
    }

    /// Block until no install for this location is in flight, then claim it.
    pub fn acquire_install_lock(&self, location: &str) {
        let mut guard = self.install.lock().expect("install lock poisoned");
        while guard.contains(location) {
            guard = self.install_cv.wait(guard).expect("install lock poisoned");
        }
        guard.insert(location.to_owned());
    }

    pub fn release_install_lock(&self, location: &str) {
        let mut guard = self.install.lock().expect("install lock poisoned");
        guard.remove(location);
        self.install_cv.notify_all();
    }

    /// Whether the current thread could lock the bundle without waiting.
    pub fn is_lockable(&self, id: BundleId) -> bool {
        let guard = self.bundle.lock().expect("bundle lock table poisoned");
        lockable(&guard, id)
    }

    /// Acquire the reentrant lock for one bundle, waiting if another thread
    /// holds it.
    pub fn acquire_bundle_lock(&self, id: BundleId) {
        let mut guard = self.bundle.lock().expect("bundle lock table poisoned");
        while !lockable(&guard, id) {
            guard = self.bundle_cv.wait(guard).expect("bundle lock table poisoned");
        }
        lock_one(&mut guard, id);
    }

    pub fn release_bundle_lock(&self, id: BundleId) {
        let mut guard = self.bundle.lock().expect("bundle lock table poisoned");
        unlock_one(&mut guard, id);
        self.bundle_cv.notify_all();
    }

    /// Atomically lock every bundle the candidate closure names. The
    /// closure runs on each retry because the candidate set (a dependency
    /// closure, or "all unresolved bundles") can change while waiting.
    pub fn acquire_many(&self, mut candidates: impl FnMut() -> Vec<BundleId>) -> Vec<BundleId> {
        let mut guard = self.bundle.lock().expect("bundle lock table poisoned");
        loop {
            let ids = candidates();
            if ids.is_empty() {
                return ids;
            }
            if ids.iter().all(|&id| lockable(&guard, id)) {
                for &id in &ids {
                    lock_one(&mut guard, id);
                }
                return ids;
            }
            guard = self.bundle_cv.wait(guard).expect("bundle lock table poisoned");
        }
    }

    /// Release a set acquired with [`acquire_many`](Self::acquire_many).
    pub fn release_many(&self, ids: &[BundleId]) {
        let mut guard = self.bundle.lock().expect("bundle lock table poisoned");
        for &id in ids {
            unlock_one(&mut guard, id);
        }
        self.bundle_cv.notify_all();
    }

    /// Drop lock bookkeeping for a bundle that no longer exists.
    pub fn forget(&self, id: BundleId) {
        let mut guard = self.bundle.lock().expect("bundle lock table poisoned");
        guard.remove(&id);
        self.bundle_cv.notify_all();
    }
}

fn lockable(table: &HashMap<BundleId, LockState>, id: BundleId) -> bool {
    match table.get(&id) {
        None => true,
        Some(state) => state.count == 0 || state.owner == thread::current().id(),
    }
}

fn lock_one(table: &mut HashMap<BundleId, LockState>, id: BundleId) {
    let me = thread::current().id();
    let state = table.entry(id).or_insert(LockState {
        owner: me,
        count: 0,
    });
    debug_assert!(state.count == 0 || state.owner == me);
    state.owner = me;
    state.count += 1;
}

fn unlock_one(table: &mut HashMap<BundleId, LockState>, id: BundleId) {
    if let Some(state) = table.get_mut(&id) {
        debug_assert!(state.count > 0, "bundle {id} is not locked");
        state.count = state.count.saturating_sub(1);
        if state.count == 0 {
            table.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn bundle_lock_is_reentrant() {
        let locks = LockCoordinator::new();
        locks.acquire_bundle_lock(1);
        locks.acquire_bundle_lock(1);
        assert!(locks.is_lockable(1));
        locks.release_bundle_lock(1);
        locks.release_bundle_lock(1);
        assert!(locks.is_lockable(1));
    }

    #[test]
    fn bundle_lock_excludes_other_threads() {
        let locks = Arc::new(LockCoordinator::new());
        locks.acquire_bundle_lock(1);

        let other = Arc::clone(&locks);
        let observed = std::thread::spawn(move || other.is_lockable(1))
            .join()
            .unwrap();
        assert!(!observed);
        locks.release_bundle_lock(1);
    }

    #[test]
    fn waiter_proceeds_after_release() {
        let locks = Arc::new(LockCoordinator::new());
        locks.acquire_bundle_lock(1);

        let other = Arc::clone(&locks);
        let acquired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&acquired);
        let handle = std::thread::spawn(move || {
            other.acquire_bundle_lock(1);
            flag.store(true, Ordering::SeqCst);
            other.release_bundle_lock(1);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::SeqCst));
        locks.release_bundle_lock(1);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
    }

    #[test]
    fn install_lock_serializes_same_location() {
        let locks = Arc::new(LockCoordinator::new());
        locks.acquire_install_lock("file:/a");

        let other = Arc::clone(&locks);
        let entered = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&entered);
        let handle = std::thread::spawn(move || {
            other.acquire_install_lock("file:/a");
            flag.store(true, Ordering::SeqCst);
            other.release_install_lock("file:/a");
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        locks.release_install_lock("file:/a");
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn install_lock_distinct_locations_independent() {
        let locks = LockCoordinator::new();
        locks.acquire_install_lock("file:/a");
        // Must not block.
        locks.acquire_install_lock("file:/b");
        locks.release_install_lock("file:/a");
        locks.release_install_lock("file:/b");
    }

    #[test]
    fn acquire_many_is_all_or_none() {
        let locks = Arc::new(LockCoordinator::new());
        locks.acquire_bundle_lock(2);

        let other = Arc::clone(&locks);
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        let handle = std::thread::spawn(move || {
            let ids = other.acquire_many(|| {
                counter.fetch_add(1, Ordering::SeqCst);
                vec![1, 2, 3]
            });
            // While the set was unlockable, bundle 1 must never have been
            // locked alone; by the time we get here we own all three.
            assert_eq!(ids, vec![1, 2, 3]);
            other.release_many(&ids);
        });

        std::thread::sleep(Duration::from_millis(50));
        // The waiter re-evaluated at least once and holds nothing yet.
        assert!(attempts.load(Ordering::SeqCst) >= 1);
        assert!(locks.is_lockable(1));
        assert!(locks.is_lockable(3));

        locks.release_bundle_lock(2);
        handle.join().unwrap();
        assert!(locks.is_lockable(1));
        assert!(locks.is_lockable(2));
        assert!(locks.is_lockable(3));
    }

    #[test]
    fn acquire_many_empty_returns_immediately() {
        let locks = LockCoordinator::new();
        assert!(locks.acquire_many(Vec::new).is_empty());
    }

    #[test]
    fn forget_clears_state() {
        let locks = LockCoordinator::new();
        locks.acquire_bundle_lock(5);
        locks.forget(5);
        assert!(locks.is_lockable(5));
    }
}
