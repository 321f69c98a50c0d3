//! Per-project lifecycle locks.
//!
//! At most one lifecycle operation (start/stop/restart/delete) may be
//! in flight per project; concurrent operations on different projects
//! must proceed independently. A `DashMap` keyed by project id holding
//! one `tokio::sync::Mutex` per project gives us that without a single
//! global lock serializing unrelated projects.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Registry of per-project lifecycle locks.
#[derive(Default)]
pub struct ProjectLocks {
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl ProjectLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the mutex for a project, creating one if this is the first
    /// time it has been locked.
    fn entry(&self, project_id: Uuid) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(project_id)
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Attempt to acquire the lock for a project without waiting.
    ///
    /// Returns `None` if another lifecycle operation already holds the
    /// lock; the caller should surface this as `ALREADY_IN_PROGRESS`.
    pub fn try_acquire(&self, project_id: Uuid) -> Option<OwnedMutexGuard<()>> {
        self.entry(project_id).try_lock_owned().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_try_acquire_fails_while_first_held() {
        let locks = ProjectLocks::new();
        let id = Uuid::new_v4();

        let guard1 = locks.try_acquire(id);
        assert!(guard1.is_some());

        let guard2 = locks.try_acquire(id);
        assert!(guard2.is_none());

        drop(guard1);
        let guard3 = locks.try_acquire(id);
        assert!(guard3.is_some());
    }

    #[tokio::test]
    async fn different_projects_lock_independently() {
        let locks = ProjectLocks::new();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        let guard_a = locks.try_acquire(a);
        let guard_b = locks.try_acquire(b);

        assert!(guard_a.is_some());
        assert!(guard_b.is_some());
    }
}
