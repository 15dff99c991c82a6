// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Task rows and the download state machine.
//!
//! A [`Task`] is one retrievable remote media item. The row is persisted by
//! the external task store; the live copy in the registry additionally
//! carries the throughput estimator state, which is sampled here.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Fallback extension when the remote description carries none.
const DEFAULT_EXTENSION: &str = "bin";

/// Longest extension carried into a final filename.
const MAX_EXTENSION_LEN: usize = 8;

/// Lifecycle state of a task.
///
/// `Created -> Downloading -> Complete` is the happy path. `Failed` cycles
/// back to `Created` through the recovery pass while retry budget remains.
/// `Paused` is modeled and recovered but nothing transitions into it
/// automatically; it is reserved for a future manual pause surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskState {
    Created,
    Downloading,
    Paused,
    Complete,
    Failed,
}

impl TaskState {
    /// Stable name, as persisted and queried by the task store.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Created => "Created",
            TaskState::Downloading => "Downloading",
            TaskState::Paused => "Paused",
            TaskState::Complete => "Complete",
            TaskState::Failed => "Failed",
        }
    }

    /// The states the recovery pass queries for.
    pub fn incomplete_states() -> &'static [TaskState] {
        &[
            TaskState::Created,
            TaskState::Downloading,
            TaskState::Paused,
            TaskState::Failed,
        ]
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One remote media item to retrieve and persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned row id; `None` until the first save.
    pub id: Option<i64>,

    /// Remote-assigned identifier, stable across restarts. The only key
    /// usable for de-duplication and lookup.
    pub unique_id: String,

    /// Retrieval handle for the current session. Refreshed by the recovery
    /// pass, since it may rotate between restarts.
    pub external_file_id: i64,

    /// Opaque reference to the originating remote message.
    pub message_ref: i64,

    /// Opaque reference to the originating remote conversation.
    pub chat_ref: i64,

    /// Untrusted remote display name. Used for logging and for extracting a
    /// sanitized extension, never as a filename.
    pub description: String,

    /// Deterministic on-disk name, `"<row id>.<ext>"`. Empty until the row
    /// id exists and [`Task::assign_filename`] ran.
    pub final_filename: String,

    /// Remote-declared size; zero or negative when unknown.
    pub total_size_bytes: i64,

    /// Bytes confirmed so far. Never decreases until terminal.
    pub downloaded_bytes: i64,

    /// Latest decayed speed estimate. Read through [`Task::speed_bps`],
    /// which applies staleness.
    pub bytes_per_second: i64,

    /// When the estimator last recomputed.
    pub last_sample_at: DateTime<Utc>,

    /// Progress samples seen since the last recomputation.
    pub sample_counter: u32,

    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,

    /// Recovery re-admissions consumed so far.
    pub retry_count: u32,

    /// Human-readable cause of the most recent failure.
    pub last_error: Option<String>,
}

impl Task {
    /// Create a task for a newly observed remote item.
    pub fn new(
        unique_id: impl Into<String>,
        external_file_id: i64,
        message_ref: i64,
        chat_ref: i64,
        description: impl Into<String>,
        total_size_bytes: i64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: None,
            unique_id: unique_id.into(),
            external_file_id,
            message_ref,
            chat_ref,
            description: description.into(),
            final_filename: String::new(),
            total_size_bytes,
            downloaded_bytes: 0,
            bytes_per_second: 0,
            last_sample_at: now,
            sample_counter: 0,
            state: TaskState::Created,
            created_at: now,
            completed_at: None,
            updated_at: now,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Derive the final filename from the persisted row id.
    ///
    /// The name stem is the id alone; only a sanitized extension is taken
    /// from the remote description, so no untrusted characters ever reach
    /// the filesystem.
    pub fn assign_filename(&mut self) -> Result<()> {
        let id = self.id.context("cannot assign filename before the row id exists")?;
        self.final_filename = format!("{}.{}", id, sanitized_extension(&self.description));
        Ok(())
    }

    /// Progress in percent, clamped to `[0, 100]`. An unknown or
    /// non-positive total never divides and reports zero.
    pub fn progress_percent(&self) -> f32 {
        if self.total_size_bytes <= 0 {
            return 0.0;
        }
        let percent = self.downloaded_bytes as f32 / self.total_size_bytes as f32 * 100.0;
        percent.clamp(0.0, 100.0)
    }

    /// Record one progress sample from the retrieval transport.
    ///
    /// Samples can arrive many times per second; only every
    /// `sample_every`-th one recomputes the speed estimate, the rest just
    /// advance the counter. See [`Task::record_progress_sample_at`].
    pub fn record_progress_sample(&mut self, downloaded_bytes: i64, sample_every: u32) {
        self.record_progress_sample_at(downloaded_bytes, sample_every, Utc::now());
    }

    /// Clock-injected form of [`Task::record_progress_sample`].
    pub fn record_progress_sample_at(
        &mut self,
        downloaded_bytes: i64,
        sample_every: u32,
        now: DateTime<Utc>,
    ) {
        if self.sample_counter + 1 < sample_every.max(1) {
            self.sample_counter += 1;
            return;
        }
        self.sample_counter = 0;

        let delta_bytes = downloaded_bytes - self.downloaded_bytes;
        let delta_millis = (now - self.last_sample_at).num_milliseconds();
        if delta_millis > 0 && delta_bytes >= 0 {
            self.bytes_per_second = (delta_bytes as f64 / delta_millis as f64 * 1000.0) as i64;
        }
        self.last_sample_at = now;

        // Duplicate or out-of-order callbacks must never walk the byte
        // count backwards.
        if downloaded_bytes > self.downloaded_bytes {
            self.downloaded_bytes = downloaded_bytes;
        }
        self.updated_at = now;
    }

    /// Current speed estimate. A task that stopped emitting progress for
    /// longer than `stale_after` reports zero, whatever was last computed.
    pub fn speed_bps(&self, stale_after: Duration) -> i64 {
        self.speed_bps_at(stale_after, Utc::now())
    }

    /// Clock-injected form of [`Task::speed_bps`].
    pub fn speed_bps_at(&self, stale_after: Duration, now: DateTime<Utc>) -> i64 {
        let age = now - self.last_sample_at;
        if age > chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::seconds(2)) {
            return 0;
        }
        self.bytes_per_second
    }

    /// Move to `state`, stamping `updated_at` (and `completed_at` on
    /// completion).
    pub fn set_state(&mut self, state: TaskState) {
        self.state = state;
        self.updated_at = Utc::now();
        if state == TaskState::Complete {
            self.completed_at = Some(self.updated_at);
        }
    }

    /// Whether the task has left the live set for good: `Complete`, or
    /// `Failed` with the retry budget spent.
    pub fn is_terminal(&self, max_retries: u32) -> bool {
        match self.state {
            TaskState::Complete => true,
            TaskState::Failed => self.retry_count >= max_retries,
            _ => false,
        }
    }

    /// Whether the recovery pass may re-admit this task.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.state == TaskState::Failed && self.retry_count < max_retries
    }
}

/// Extract a filesystem-safe extension from an untrusted description:
/// alphanumeric only, lowercased, bounded length, `bin` when absent.
fn sanitized_extension(description: &str) -> String {
    let ext = match description.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < description.len() => &description[idx + 1..],
        _ => return DEFAULT_EXTENSION.to_string(),
    };
    let cleaned: String = ext
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_lowercase())
        .take(MAX_EXTENSION_LEN)
        .collect();
    if cleaned.is_empty() {
        DEFAULT_EXTENSION.to_string()
    } else {
        cleaned
    }
}
