// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download orchestration.
//!
//! One spawned worker drives one task from admission to a terminal state:
//!
//! 1. acquire a concurrency slot (bounded; no slot means walk away silently)
//! 2. re-read the row and persist the `Downloading` transition
//! 3. hand the remote reference to the retrieval service and wait, bounded
//!    by the download timeout, for its single terminal answer
//! 4. on success, move the staged bytes into final storage (gated on the
//!    storage monitor) and verify the artifact before committing `Complete`
//! 5. on any failure, persist `Failed` with its cause
//! 6. always: evict the task from the live registry and give the slot back
//!
//! Workers never share task state; per-task transitions are ordered because
//! exactly one worker owns a unique id at a time (the registry enforces
//! that). A failure in one worker is recorded on its task and never
//! propagates to the others.

use std::collections::HashSet;
use std::fs;
use std::sync::{Arc, Weak};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::download::limiter::DownloadLimiter;
use crate::download::registry::TaskRegistry;
use crate::download::types::{Task, TaskState};
use crate::error::DownloadError;
use crate::events::EventNotifier;
use crate::retrieval::{FetchOutcome, RetrievalService};
use crate::storage::StorageMonitor;
use crate::store::TaskStore;

/// Orchestrates the lifecycle of every admitted download.
pub struct DownloadManager {
    config: EngineConfig,
    store: Arc<dyn TaskStore>,
    retrieval: Arc<dyn RetrievalService>,
    registry: Arc<TaskRegistry>,
    limiter: Arc<DownloadLimiter>,
    storage: Arc<StorageMonitor>,
    notifier: Arc<EventNotifier>,
    /// Handle to ourselves for spawning workers.
    self_ref: Weak<DownloadManager>,
}

impl DownloadManager {
    pub(crate) fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        retrieval: Arc<dyn RetrievalService>,
        registry: Arc<TaskRegistry>,
        limiter: Arc<DownloadLimiter>,
        storage: Arc<StorageMonitor>,
        notifier: Arc<EventNotifier>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            config,
            store,
            retrieval,
            registry,
            limiter,
            storage,
            notifier,
            self_ref: self_ref.clone(),
        })
    }

    /// Intake for a newly observed remote item: de-duplicate against the
    /// store, persist to obtain the row id, assign the deterministic
    /// filename, then enqueue. Returns `false` when the item was already
    /// known or already live.
    pub async fn submit_new(&self, mut task: Task) -> Result<bool> {
        if self
            .store
            .get_by_unique_id(&task.unique_id)
            .await?
            .is_some()
        {
            debug!(unique_id = %task.unique_id, "item already known; ignoring");
            return Ok(false);
        }

        self.store.save(&mut task).await?;
        task.assign_filename()?;
        self.store.update(&task).await?;
        info!(
            unique_id = %task.unique_id,
            file = %task.final_filename,
            "new download item registered"
        );

        Ok(self.enqueue(task))
    }

    /// Admit a task into the live set and spawn its worker. Returns `false`
    /// when a worker for the same unique id is already running: the
    /// single-flight invariant, independent of free slots.
    pub fn enqueue(&self, task: Task) -> bool {
        let unique_id = task.unique_id.clone();
        if !self.registry.admit(task.clone()) {
            debug!(%unique_id, "duplicate admission rejected");
            return false;
        }

        let Some(manager) = self.self_ref.upgrade() else {
            // Engine torn down between admit and spawn.
            self.registry.remove(&unique_id);
            return false;
        };
        tokio::spawn(async move {
            manager.run_one(task).await;
        });
        true
    }

    /// Progress feed from the retrieval transport. Updates only the live
    /// mirror; rows are persisted at terminal transitions, not per sample.
    pub fn report_progress(&self, unique_id: &str, downloaded_bytes: i64) {
        let sample_every = self.config.progress_sample_every;
        let seen = self
            .registry
            .with_task_mut(unique_id, |task| {
                task.record_progress_sample(downloaded_bytes, sample_every)
            })
            .is_some();
        if !seen {
            debug!(%unique_id, "progress for a task that is not live; ignored");
        }
    }

    /// Drop live entries whose rows an operator removed from the store, so
    /// they cannot resurrect through recovery or progress feeds.
    pub async fn evict_deleted(&self) -> Result<usize> {
        let mut missing = HashSet::new();
        for task in self.registry.snapshot() {
            if self
                .store
                .get_by_unique_id(&task.unique_id)
                .await?
                .is_none()
            {
                missing.insert(task.unique_id);
            }
        }
        if missing.is_empty() {
            return Ok(0);
        }

        // Only confirmed-missing ids go; anything admitted meanwhile stays.
        let evicted = self.registry.retain(|t| !missing.contains(&t.unique_id));
        info!(evicted, "evicted live tasks with no backing row");
        Ok(evicted)
    }

    /// Retrievals currently holding a slot.
    pub fn active_downloads(&self) -> usize {
        self.limiter.active()
    }

    /// Configured concurrency ceiling.
    pub fn max_concurrent(&self) -> usize {
        self.limiter.max_slots()
    }

    /// Number of live (non-terminal) tasks.
    pub fn live_tasks(&self) -> usize {
        self.registry.len()
    }

    /// Snapshot of the live set.
    pub fn snapshot(&self) -> Vec<Task> {
        self.registry.snapshot()
    }

    /// One worker, one task, admission to terminal state.
    async fn run_one(self: Arc<Self>, task: Task) {
        let unique_id = task.unique_id.clone();

        let Some(permit) = self.limiter.acquire(self.config.admission_timeout).await else {
            // No slot in time. Abandon without any state change; the task
            // leaves the live set so the recovery pass can re-admit it.
            warn!(
                %unique_id,
                "no download slot within {:?}; deferring to recovery",
                self.config.admission_timeout
            );
            self.registry.remove(&unique_id);
            return;
        };

        info!(%unique_id, active = self.limiter.active(), "download started");

        match self.attempt(&unique_id).await {
            Ok(None) => {}
            Ok(Some(cause)) => self.fail_task(&unique_id, &cause).await,
            Err(err) => {
                // Store trouble: nothing durable can be recorded, so leave
                // the row alone for the next recovery pass.
                error!(%unique_id, "download attempt aborted: {err:#}");
            }
        }

        self.registry.remove(&unique_id);
        drop(permit);
        info!(%unique_id, active = self.limiter.active(), "download finished");
    }

    /// One bounded download attempt. `Ok(None)` means the task completed
    /// (or its row vanished and there was nothing to do); `Ok(Some(cause))`
    /// is a terminal per-attempt failure.
    async fn attempt(&self, unique_id: &str) -> Result<Option<DownloadError>> {
        // Re-read the row to pick up the latest state under optimistic
        // concurrency.
        let Some(mut row) = self.store.get_by_unique_id(unique_id).await? else {
            warn!(%unique_id, "task row vanished before download; skipping");
            return Ok(None);
        };

        if row.state != TaskState::Downloading {
            self.transition(&mut row, TaskState::Downloading).await?;
        }

        let outcome = match tokio::time::timeout(
            self.config.download_timeout,
            self.retrieval.fetch(&row),
        )
        .await
        {
            // The retrieval future is dropped on timeout; a late completion
            // has nothing to land on and is ignored by design.
            Err(_) => {
                return Ok(Some(DownloadError::RetrievalTimeout(
                    self.config.download_timeout,
                )))
            }
            Ok(Err(err)) => return Ok(Some(DownloadError::Retrieval(format!("{err:#}")))),
            Ok(Ok(outcome)) => outcome,
        };

        if let Some(cause) = self.commit_artifact(&row, &outcome) {
            return Ok(Some(cause));
        }

        // Re-read before the terminal write in case progress or an operator
        // touched the row while bytes were in flight.
        let mut row = self.store.get_by_unique_id(unique_id).await?.unwrap_or(row);
        if outcome.bytes_written > row.downloaded_bytes {
            row.downloaded_bytes = outcome.bytes_written;
        }
        self.transition(&mut row, TaskState::Complete).await?;
        info!(%unique_id, file = %row.final_filename, "download complete");
        Ok(None)
    }

    /// Move the staged bytes into final storage and verify the artifact.
    /// Returns the failure cause, or `None` when the artifact is in place.
    fn commit_artifact(&self, row: &Task, outcome: &FetchOutcome) -> Option<DownloadError> {
        // Gate on the monitor's flag; workers never probe the filesystem
        // themselves.
        if !self.storage.is_available() {
            return Some(DownloadError::StorageUnavailable);
        }

        let staging = &outcome.staging_path;
        if !staging.exists() {
            return Some(DownloadError::Retrieval(format!(
                "staging file missing: {}",
                staging.display()
            )));
        }

        let media_dir = self.storage.paths().media_dir();
        if let Err(err) = fs::create_dir_all(media_dir) {
            warn!("cannot create media directory: {err}");
            return Some(DownloadError::StorageUnavailable);
        }

        let target = media_dir.join(&row.final_filename);
        if target.exists() {
            // Replace semantics: a stale artifact from an earlier attempt
            // must not block the move.
            let _ = fs::remove_file(&target);
        }
        if let Err(err) = fs::rename(staging, &target) {
            warn!(
                from = %staging.display(),
                to = %target.display(),
                "final move failed: {err}"
            );
            return Some(DownloadError::PostMoveVerification(target));
        }

        // Never record Complete on faith alone.
        if !target.exists() {
            return Some(DownloadError::PostMoveVerification(target));
        }
        None
    }

    /// Persist `Failed` with its cause. A reference that no longer resolves
    /// spends the whole retry budget: recovery must not keep re-admitting a
    /// task whose remote item is gone.
    pub(crate) async fn fail_task(&self, unique_id: &str, cause: &DownloadError) {
        warn!(%unique_id, %cause, "download failed");

        let mut row = match self.store.get_by_unique_id(unique_id).await {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(err) => {
                error!(%unique_id, "cannot record failure: {err:#}");
                return;
            }
        };

        row.last_error = Some(cause.to_string());
        if matches!(cause, DownloadError::ReferenceUnresolvable(_)) {
            row.retry_count = self.config.max_retries;
        }
        if let Err(err) = self.transition(&mut row, TaskState::Failed).await {
            error!(%unique_id, "cannot persist failure: {err:#}");
        }
    }

    /// Persist a state change, mirror it into the live set, then publish.
    /// Store first: observers must never see a state the store could lose.
    pub(crate) async fn transition(&self, row: &mut Task, next: TaskState) -> Result<()> {
        let old = row.state;
        row.set_state(next);
        self.store.update(row).await?;
        self.registry.update(row);
        self.notifier.publish_state_change(row, old, next);
        Ok(())
    }
}
