// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Crash and failure recovery.
//!
//! After a restart (or a quiet period) the store may hold tasks that never
//! reached a terminal state: admitted but interrupted, failed with budget
//! left, or created and never picked up. The recovery pass reconciles those
//! rows against the live registry and re-admits the ones worth retrying.
//!
//! The pass only runs while the retrieval transport is ready and no
//! retrieval is currently active, so it never competes with live work. One
//! row's trouble (a deleted remote message, a store hiccup) is contained to
//! that row; the batch always continues.

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::download::manager::DownloadManager;
use crate::download::registry::TaskRegistry;
use crate::download::types::{Task, TaskState};
use crate::error::DownloadError;
use crate::retrieval::RetrievalService;
use crate::store::TaskStore;

/// Re-admits orphaned and retryable tasks on startup and on a fixed cadence.
pub struct RecoveryManager {
    config: EngineConfig,
    manager: Arc<DownloadManager>,
    store: Arc<dyn TaskStore>,
    retrieval: Arc<dyn RetrievalService>,
    registry: Arc<TaskRegistry>,
}

impl RecoveryManager {
    pub(crate) fn new(
        config: EngineConfig,
        manager: Arc<DownloadManager>,
        store: Arc<dyn TaskStore>,
        retrieval: Arc<dyn RetrievalService>,
        registry: Arc<TaskRegistry>,
    ) -> Self {
        Self {
            config,
            manager,
            store,
            retrieval,
            registry,
        }
    }

    /// One reconciliation pass. Returns how many tasks were re-admitted.
    /// `Engine::start` runs this once at startup; hosts may force a pass.
    pub async fn run_once(&self) -> Result<usize> {
        if !self.retrieval.is_ready() {
            debug!("retrieval transport not ready; skipping recovery pass");
            return Ok(0);
        }
        if self.manager.active_downloads() > 0 {
            debug!(
                active = self.manager.active_downloads(),
                "downloads active; skipping recovery pass"
            );
            return Ok(0);
        }

        let rows = self
            .store
            .list_by_states(TaskState::incomplete_states())
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        debug!(count = rows.len(), "found incomplete tasks");

        let mut admitted = 0;
        for row in rows {
            let unique_id = row.unique_id.clone();
            match self.recover_one(row).await {
                Ok(true) => admitted += 1,
                Ok(false) => {}
                // One task's trouble never aborts the batch.
                Err(err) => warn!(%unique_id, "recovery failed for task: {err:#}"),
            }
        }

        if admitted > 0 {
            info!(admitted, "re-admitted incomplete downloads");
        }
        Ok(admitted)
    }

    /// Reconcile a single row. `Ok(true)` means it was handed back to the
    /// orchestrator.
    async fn recover_one(&self, mut row: Task) -> Result<bool> {
        let unique_id = row.unique_id.clone();

        // A live task already has a worker; double admission would violate
        // the single-flight invariant.
        if self.registry.contains(&unique_id) {
            return Ok(false);
        }

        if row.state == TaskState::Failed {
            if !row.can_retry(self.config.max_retries) {
                debug!(
                    %unique_id,
                    retries = row.retry_count,
                    "retry budget exhausted; leaving failed"
                );
                return Ok(false);
            }
            // The budget is spent here, at re-admission, so one visible
            // Failed -> Created cycle costs exactly one unit.
            row.retry_count += 1;
            row.last_error = Some("retrying download".to_string());
            self.manager.transition(&mut row, TaskState::Created).await?;
            info!(%unique_id, attempt = row.retry_count, "retrying failed download");
        }

        // The retrieval handle may have rotated since the row was written;
        // resolve it fresh. A reference that no longer resolves is a new
        // failure, not a retry.
        match self
            .retrieval
            .resolve_reference(row.message_ref, row.chat_ref)
            .await
        {
            Ok(file_id) => {
                row.external_file_id = file_id;
                self.store.update(&row).await?;
                debug!(%unique_id, "re-admitting download");
                Ok(self.manager.enqueue(row))
            }
            Err(err) => {
                self.manager
                    .fail_task(
                        &unique_id,
                        &DownloadError::ReferenceUnresolvable(format!("{err:#}")),
                    )
                    .await;
                Ok(false)
            }
        }
    }

    /// Spawn the fixed-cadence recovery loop.
    pub(crate) fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.recovery_interval) => {
                        if let Err(err) = self.run_once().await {
                            error!("recovery pass failed: {err:#}");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("recovery loop stopped");
        })
    }
}
