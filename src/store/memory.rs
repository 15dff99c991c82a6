// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process task store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::download::types::{Task, TaskState};
use crate::locks::{resilient_read, resilient_write};
use crate::store::TaskStore;

/// HashMap-backed [`TaskStore`]. Row ids are assigned from a monotonic
/// counter, like an autoincrement column would.
#[derive(Default)]
pub struct MemoryTaskStore {
    rows: RwLock<HashMap<String, Task>>,
    next_id: AtomicI64,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of rows currently stored, whatever their state.
    pub fn len(&self) -> usize {
        resilient_read(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        resilient_read(&self.rows).is_empty()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn get_by_unique_id(&self, unique_id: &str) -> Result<Option<Task>> {
        Ok(resilient_read(&self.rows).get(unique_id).cloned())
    }

    async fn save(&self, task: &mut Task) -> Result<()> {
        let mut rows = resilient_write(&self.rows);
        if rows.contains_key(&task.unique_id) {
            bail!("task row already exists for unique id {}", task.unique_id);
        }
        task.id = Some(self.next_id.fetch_add(1, Ordering::SeqCst));
        rows.insert(task.unique_id.clone(), task.clone());
        Ok(())
    }

    async fn update(&self, task: &Task) -> Result<()> {
        let mut rows = resilient_write(&self.rows);
        match rows.get_mut(&task.unique_id) {
            Some(row) => {
                *row = task.clone();
                Ok(())
            }
            None => bail!("no task row for unique id {}", task.unique_id),
        }
    }

    async fn list_by_states(&self, states: &[TaskState]) -> Result<Vec<Task>> {
        let mut tasks: Vec<Task> = resilient_read(&self.rows)
            .values()
            .filter(|t| states.contains(&t.state))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.id.unwrap_or(i64::MAX));
        Ok(tasks)
    }

    async fn remove_by_unique_id(&self, unique_id: &str) -> Result<bool> {
        Ok(resilient_write(&self.rows).remove(unique_id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(unique_id: &str) -> Task {
        Task::new(unique_id, 1, 2, 3, "clip.mp4", 100)
    }

    #[tokio::test]
    async fn save_assigns_sequential_ids() {
        let store = MemoryTaskStore::new();
        let mut a = task("uid-a");
        let mut b = task("uid-b");
        store.save(&mut a).await.expect("save a");
        store.save(&mut b).await.expect("save b");
        assert_eq!(a.id, Some(1));
        assert_eq!(b.id, Some(2));
    }

    #[tokio::test]
    async fn save_rejects_duplicate_unique_id() {
        let store = MemoryTaskStore::new();
        let mut a = task("uid-a");
        store.save(&mut a).await.expect("save");
        let mut dup = task("uid-a");
        assert!(store.save(&mut dup).await.is_err());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_requires_existing_row() {
        let store = MemoryTaskStore::new();
        let mut a = task("uid-a");
        store.save(&mut a).await.expect("save");

        a.set_state(TaskState::Downloading);
        store.update(&a).await.expect("update");
        let read = store.get_by_unique_id("uid-a").await.expect("get").expect("row");
        assert_eq!(read.state, TaskState::Downloading);

        let ghost = task("uid-ghost");
        assert!(store.update(&ghost).await.is_err());
    }

    #[tokio::test]
    async fn list_by_states_filters_and_orders() {
        let store = MemoryTaskStore::new();
        for (uid, state) in [
            ("uid-a", TaskState::Complete),
            ("uid-b", TaskState::Failed),
            ("uid-c", TaskState::Created),
            ("uid-d", TaskState::Downloading),
        ] {
            let mut t = task(uid);
            store.save(&mut t).await.expect("save");
            t.set_state(state);
            store.update(&t).await.expect("update");
        }

        let incomplete = store
            .list_by_states(TaskState::incomplete_states())
            .await
            .expect("list");
        let uids: Vec<&str> = incomplete.iter().map(|t| t.unique_id.as_str()).collect();
        assert_eq!(uids, vec!["uid-b", "uid-c", "uid-d"]);
    }

    #[tokio::test]
    async fn remove_reports_presence() {
        let store = MemoryTaskStore::new();
        let mut a = task("uid-a");
        store.save(&mut a).await.expect("save");
        assert!(store.remove_by_unique_id("uid-a").await.expect("remove"));
        assert!(!store.remove_by_unique_id("uid-a").await.expect("remove"));
    }
}
