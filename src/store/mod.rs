// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Persistence boundary for task rows.
//!
//! The engine consumes this contract; it does not implement durability.
//! Hosts back it with whatever they run (SQLite, Postgres, ...); the
//! in-process [`MemoryTaskStore`] exists for tests and for embedders that
//! do not need durability across restarts.

mod memory;

pub use memory::MemoryTaskStore;

use anyhow::Result;
use async_trait::async_trait;

use crate::download::types::{Task, TaskState};

/// CRUD the engine needs from the task store.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Look up a row by its remote-assigned unique id.
    async fn get_by_unique_id(&self, unique_id: &str) -> Result<Option<Task>>;

    /// Insert a new row, assigning `task.id`.
    async fn save(&self, task: &mut Task) -> Result<()>;

    /// Update an existing row, matched by unique id. Errors when the row
    /// does not exist.
    async fn update(&self, task: &Task) -> Result<()>;

    /// All rows whose state is one of `states`, in row-id order.
    async fn list_by_states(&self, states: &[TaskState]) -> Result<Vec<Task>>;

    /// Delete a row. Returns whether anything was removed.
    async fn remove_by_unique_id(&self, unique_id: &str) -> Result<bool>;
}
