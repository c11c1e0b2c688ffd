//! Per-task async locks.
//!
//! Transitions for one task id run one at a time, in acquisition order
//! (tokio's mutex is fair). Different task ids never share a lock. Entries
//! are removed when the last holder releases, so the map only ever contains
//! tasks with a transition in flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::types::TaskId;

#[derive(Default)]
pub(crate) struct TaskLocks {
    locks: Mutex<HashMap<TaskId, Arc<AsyncMutex<()>>>>,
}

impl TaskLocks {
    pub(crate) async fn acquire(&self, id: TaskId) -> TaskGuard<'_> {
        let lock = {
            let mut locks = self.table();
            locks.entry(id).or_default().clone()
        };
        TaskGuard {
            registry: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    #[cfg(test)]
    pub(crate) fn in_flight(&self) -> usize {
        self.table().len()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, Arc<AsyncMutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub(crate) struct TaskGuard<'a> {
    registry: &'a TaskLocks,
    id: TaskId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for TaskGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self.registry.table();
        if let Some(guard) = self.guard.take() {
            // One reference in the map, one in our guard: nobody is waiting.
            if Arc::strong_count(OwnedMutexGuard::mutex(&guard)) <= 2 {
                locks.remove(&self.id);
            }
            drop(guard);
        }
    }
}
