// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine assembly and lifecycle.
//!
//! [`Engine::new`] wires the component graph (registry, limiter, storage
//! monitor, notifier, orchestrator, recovery) around the two collaborators
//! the host supplies (task store and retrieval service), and prepares the
//! storage tree. [`Engine::start`] runs the startup recovery pass and
//! spawns the monitor and recovery loops; [`Engine::shutdown`] stops them.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::download::limiter::DownloadLimiter;
use crate::download::manager::DownloadManager;
use crate::download::registry::TaskRegistry;
use crate::events::EventNotifier;
use crate::recovery::RecoveryManager;
use crate::retrieval::RetrievalService;
use crate::storage::{StorageMonitor, StorageStatus};
use crate::store::TaskStore;

/// Read-only observability snapshot: the four gauges the engine exposes.
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub active_downloads: usize,
    pub max_concurrent: usize,
    pub live_tasks: usize,
    pub storage: StorageStatus,
}

/// The assembled download engine.
pub struct Engine {
    manager: Arc<DownloadManager>,
    storage: Arc<StorageMonitor>,
    recovery: Arc<RecoveryManager>,
    notifier: Arc<EventNotifier>,
    shutdown_tx: watch::Sender<bool>,
    loops: Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    /// Build the component graph and prepare the storage tree. Fails when
    /// the storage root cannot even be created; that is a configuration
    /// error, unlike the runtime flaps the monitor tolerates.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn TaskStore>,
        retrieval: Arc<dyn RetrievalService>,
    ) -> Result<Self> {
        let notifier = Arc::new(EventNotifier::new());

        let storage = Arc::new(StorageMonitor::new(&config, Arc::clone(&notifier)));
        storage.prepare().context("storage root unusable")?;

        let registry = Arc::new(TaskRegistry::new());
        let limiter = Arc::new(DownloadLimiter::new(config.max_concurrent));

        let manager = DownloadManager::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&retrieval),
            Arc::clone(&registry),
            limiter,
            Arc::clone(&storage),
            Arc::clone(&notifier),
        );

        let recovery = Arc::new(RecoveryManager::new(
            config,
            Arc::clone(&manager),
            store,
            retrieval,
            registry,
        ));

        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            manager,
            storage,
            recovery,
            notifier,
            shutdown_tx,
            loops: Mutex::new(Vec::new()),
        })
    }

    /// Run the startup recovery pass, then spawn the storage-monitor and
    /// recovery loops.
    pub async fn start(&self) {
        match self.recovery.run_once().await {
            Ok(admitted) if admitted > 0 => {
                info!(admitted, "startup recovery re-admitted downloads")
            }
            Ok(_) => {}
            Err(err) => warn!("startup recovery failed: {err:#}"),
        }

        let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
        loops.push(Arc::clone(&self.storage).spawn(self.shutdown_tx.subscribe()));
        loops.push(Arc::clone(&self.recovery).spawn(self.shutdown_tx.subscribe()));
        info!("engine started");
    }

    /// Stop the background loops. In-flight download workers run to their
    /// bounded ends on their own; there is no mid-flight cancellation.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut loops = self.loops.lock().unwrap_or_else(|e| e.into_inner());
            loops.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("engine stopped");
    }

    /// The orchestrator: intake, enqueue, progress feed, live snapshots.
    pub fn manager(&self) -> &Arc<DownloadManager> {
        &self.manager
    }

    /// The storage monitor: availability flag, paths, forced checks.
    pub fn storage(&self) -> &Arc<StorageMonitor> {
        &self.storage
    }

    /// The recovery manager, for forcing a reconciliation pass.
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// The event notifier, for (un)subscribing listeners.
    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    /// The four observability gauges, read without any contended lock.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            active_downloads: self.manager.active_downloads(),
            max_concurrent: self.manager.max_concurrent(),
            live_tasks: self.manager.live_tasks(),
            storage: self.storage.status(),
        }
    }
}
