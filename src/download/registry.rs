// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Live-task registry.
//!
//! The authoritative in-memory mirror of every task that is not yet
//! terminal, guarded by a single lock and owned by the engine instance
//! (never process-global, so isolated engines can coexist under test).
//!
//! Admission through the registry is what enforces the single-flight
//! invariant: at most one orchestrator worker per `unique_id`, regardless
//! of how many concurrency slots are free.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::download::types::Task;
use crate::locks::{resilient_read, resilient_write};

/// Mirror of live (non-terminal) tasks, keyed by unique id.
#[derive(Default)]
pub struct TaskRegistry {
    live: RwLock<HashMap<String, Task>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a task into the live set. Returns `false` when a task with the
    /// same unique id is already live; the caller must not start a second
    /// worker for it.
    pub fn admit(&self, task: Task) -> bool {
        let mut live = resilient_write(&self.live);
        if live.contains_key(&task.unique_id) {
            return false;
        }
        live.insert(task.unique_id.clone(), task);
        true
    }

    /// Evict a task, returning its last live snapshot.
    pub fn remove(&self, unique_id: &str) -> Option<Task> {
        resilient_write(&self.live).remove(unique_id)
    }

    pub fn contains(&self, unique_id: &str) -> bool {
        resilient_read(&self.live).contains_key(unique_id)
    }

    /// Clone out the live copy of one task.
    pub fn get(&self, unique_id: &str) -> Option<Task> {
        resilient_read(&self.live).get(unique_id).cloned()
    }

    /// Replace the live copy of `task`, if it is still live.
    pub fn update(&self, task: &Task) {
        let mut live = resilient_write(&self.live);
        if let Some(entry) = live.get_mut(&task.unique_id) {
            *entry = task.clone();
        }
    }

    /// Mutate the live copy of one task in place. Returns `None` when the
    /// task is not live.
    pub fn with_task_mut<R>(&self, unique_id: &str, f: impl FnOnce(&mut Task) -> R) -> Option<R> {
        resilient_write(&self.live).get_mut(unique_id).map(f)
    }

    /// Drop every live entry the predicate rejects, returning how many went.
    pub fn retain(&self, keep: impl Fn(&Task) -> bool) -> usize {
        let mut live = resilient_write(&self.live);
        let before = live.len();
        live.retain(|_, task| keep(task));
        before - live.len()
    }

    /// Copy of the live set, ordered by row id (unsaved rows last).
    pub fn snapshot(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = resilient_read(&self.live).values().cloned().collect();
        tasks.sort_by_key(|t| t.id.unwrap_or(i64::MAX));
        tasks
    }

    pub fn len(&self) -> usize {
        resilient_read(&self.live).len()
    }

    pub fn is_empty(&self) -> bool {
        resilient_read(&self.live).is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::TaskState;

    fn task(unique_id: &str, id: i64) -> Task {
        let mut task = Task::new(unique_id, 1, 2, 3, "clip.mp4", 100);
        task.id = Some(id);
        task
    }

    #[test]
    fn admit_rejects_duplicates() {
        let registry = TaskRegistry::new();
        assert!(registry.admit(task("uid-a", 1)));
        assert!(!registry.admit(task("uid-a", 1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_returns_last_snapshot() {
        let registry = TaskRegistry::new();
        registry.admit(task("uid-a", 1));
        registry.with_task_mut("uid-a", |t| t.set_state(TaskState::Downloading));

        let evicted = registry.remove("uid-a").expect("was live");
        assert_eq!(evicted.state, TaskState::Downloading);
        assert!(registry.is_empty());
        assert!(registry.remove("uid-a").is_none());
    }

    #[test]
    fn update_only_touches_live_entries() {
        let registry = TaskRegistry::new();
        registry.admit(task("uid-a", 1));

        let mut gone = task("uid-gone", 2);
        gone.downloaded_bytes = 99;
        registry.update(&gone);
        assert!(!registry.contains("uid-gone"));

        let mut live = registry.get("uid-a").expect("live");
        live.downloaded_bytes = 42;
        registry.update(&live);
        assert_eq!(registry.get("uid-a").expect("live").downloaded_bytes, 42);
    }

    #[test]
    fn snapshot_orders_by_row_id() {
        let registry = TaskRegistry::new();
        registry.admit(task("uid-b", 20));
        registry.admit(task("uid-a", 10));
        let mut unsaved = Task::new("uid-c", 1, 2, 3, "x.bin", 1);
        unsaved.id = None;
        registry.admit(unsaved);

        let ids: Vec<Option<i64>> = registry.snapshot().iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![Some(10), Some(20), None]);
    }

    #[test]
    fn retain_drops_rejected_entries() {
        let registry = TaskRegistry::new();
        registry.admit(task("uid-a", 1));
        registry.admit(task("uid-b", 2));

        let dropped = registry.retain(|t| t.unique_id == "uid-a");
        assert_eq!(dropped, 1);
        assert!(registry.contains("uid-a"));
        assert!(!registry.contains("uid-b"));
    }
}
