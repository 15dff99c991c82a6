// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Storage target monitoring.
//!
//! The download tree may live on a USB disk or a network mount that
//! disappears without notice. The monitor periodically proves the tree is
//! really there (exists, is a directory, takes a marker file) and exposes
//! a single flag every file-producing operation consults before committing
//! bytes. Workers never probe on their own; under load that would turn one
//! dead mount into a stampede of filesystem checks.
//!
//! While the target is unavailable the probe interval shrinks so recovery
//! is noticed quickly. The interval is a plain state variable read by one
//! long-lived loop each cycle; the loop itself is never torn down. Flips
//! publish a storage event; routine probes do not.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::events::EventNotifier;
use crate::locks::{resilient_read, resilient_write};

const MARKER_CONTENT: &[u8] = b"mediahaul-probe";

/// The directory layout under the storage root.
#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
    media: PathBuf,
    staging: PathBuf,
}

impl StoragePaths {
    pub fn new(root: PathBuf) -> Self {
        let media = root.join("media");
        let staging = root.join("staging");
        Self { root, media, staging }
    }

    /// The configured storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Where completed artifacts live.
    pub fn media_dir(&self) -> &Path {
        &self.media
    }

    /// Where retrieval implementations should stage bytes, so the final
    /// move is a same-filesystem rename.
    pub fn staging_dir(&self) -> &Path {
        &self.staging
    }
}

/// Snapshot of backing-store health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageStatus {
    pub available: bool,
    pub root_path: PathBuf,
    pub last_checked_at: DateTime<Utc>,
}

/// Availability gate for all file-producing work.
pub struct StorageMonitor {
    paths: StoragePaths,
    available: AtomicBool,
    last_checked_at: RwLock<DateTime<Utc>>,
    /// Interval the probe loop sleeps between cycles. Written on flips,
    /// read fresh every cycle.
    current_interval: RwLock<Duration>,
    interval: Duration,
    fast_interval: Duration,
    notifier: Arc<EventNotifier>,
}

impl StorageMonitor {
    pub fn new(config: &EngineConfig, notifier: Arc<EventNotifier>) -> Self {
        Self {
            paths: StoragePaths::new(config.storage_root.clone()),
            available: AtomicBool::new(true),
            last_checked_at: RwLock::new(Utc::now()),
            current_interval: RwLock::new(config.monitor_interval),
            interval: config.monitor_interval,
            fast_interval: config.monitor_fast_interval,
            notifier,
        }
    }

    /// Build the directory tree and prove it is writable. Called once at
    /// engine construction; a storage root that cannot even be created is a
    /// configuration error, not a runtime flap.
    pub fn prepare(&self) -> Result<()> {
        self.create_tree()
            .with_context(|| format!("cannot create storage tree at {}", self.paths.root.display()))?;
        if !self.probe() {
            bail!("storage root {} is not writable", self.paths.root.display());
        }
        self.available.store(true, Ordering::SeqCst);
        *resilient_write(&self.last_checked_at) = Utc::now();
        tracing::info!(root = %self.paths.root.display(), "storage tree ready");
        Ok(())
    }

    /// Current availability, as decided by the most recent probe.
    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> StorageStatus {
        StorageStatus {
            available: self.is_available(),
            root_path: self.paths.root.clone(),
            last_checked_at: *resilient_read(&self.last_checked_at),
        }
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Interval the probe loop is currently using.
    pub fn current_interval(&self) -> Duration {
        *resilient_read(&self.current_interval)
    }

    /// Run one probe cycle and handle availability flips. Normally driven
    /// by the spawned loop; exposed so tests (and hosts) can force a cycle.
    pub fn check_once(&self) {
        let was_available = self.available.load(Ordering::SeqCst);
        let now_ok = self.probe();
        *resilient_write(&self.last_checked_at) = Utc::now();

        if was_available && !now_ok {
            self.available.store(false, Ordering::SeqCst);
            *resilient_write(&self.current_interval) = self.fast_interval;
            tracing::warn!(
                root = %self.paths.root.display(),
                "storage target unavailable; probing every {:?}",
                self.fast_interval
            );
            self.notifier.publish_storage_change(&self.status());
        } else if !was_available && now_ok {
            // Rebuild whatever the medium lost before announcing recovery.
            if let Err(err) = self.create_tree() {
                tracing::error!("storage answered probe but tree rebuild failed: {err:#}");
                return;
            }
            self.available.store(true, Ordering::SeqCst);
            *resilient_write(&self.current_interval) = self.interval;
            tracing::info!(root = %self.paths.root.display(), "storage target recovered");
            self.notifier.publish_storage_change(&self.status());
        }
    }

    /// Spawn the long-lived probe loop. It re-reads the interval every
    /// cycle, so flips take effect without tearing the loop down.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let interval = self.current_interval();
                tokio::select! {
                    _ = tokio::time::sleep(interval) => self.check_once(),
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("storage monitor stopped");
        })
    }

    fn create_tree(&self) -> Result<()> {
        for dir in [&self.paths.root, &self.paths.media, &self.paths.staging] {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }

    /// One availability probe: the root must exist, be a directory, and
    /// take, return and give up a marker file. Subdirectories are not part
    /// of the probe: a freshly re-attached medium may have lost them, and
    /// the recovery flip rebuilds them.
    fn probe(&self) -> bool {
        if !self.paths.root.is_dir() {
            return false;
        }

        let marker = self
            .paths
            .root
            .join(format!(".probe_{}", Utc::now().timestamp_millis()));
        let round_trip = (|| -> std::io::Result<bool> {
            fs::write(&marker, MARKER_CONTENT)?;
            let content = fs::read(&marker)?;
            fs::remove_file(&marker)?;
            Ok(content == MARKER_CONTENT)
        })();

        match round_trip {
            Ok(ok) => ok,
            Err(err) => {
                tracing::debug!(
                    root = %self.paths.root.display(),
                    "storage probe failed: {err}"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::types::{Task, TaskState};
    use crate::events::EngineListener;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    struct FlipCounter {
        flips: AtomicUsize,
        last_available: AtomicBool,
    }

    impl EngineListener for FlipCounter {
        fn on_state_changed(&self, _task: &Task, _old: TaskState, _new: TaskState) {}

        fn on_storage_changed(&self, status: &StorageStatus) {
            self.flips.fetch_add(1, Ordering::SeqCst);
            self.last_available.store(status.available, Ordering::SeqCst);
        }
    }

    fn monitor_at(root: &Path) -> (Arc<StorageMonitor>, Arc<FlipCounter>) {
        let mut config = EngineConfig::default();
        config.storage_root = root.to_path_buf();
        config.monitor_interval = Duration::from_secs(30);
        config.monitor_fast_interval = Duration::from_secs(5);

        let notifier = Arc::new(EventNotifier::new());
        let listener = Arc::new(FlipCounter {
            flips: AtomicUsize::new(0),
            last_available: AtomicBool::new(true),
        });
        notifier.subscribe(listener.clone());

        (Arc::new(StorageMonitor::new(&config, notifier)), listener)
    }

    #[test]
    fn prepare_builds_the_tree() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("downloads");
        let (monitor, _) = monitor_at(&root);

        monitor.prepare().expect("prepare");
        assert!(root.join("media").is_dir());
        assert!(root.join("staging").is_dir());
        assert!(monitor.is_available());
    }

    #[test]
    fn healthy_probe_does_not_publish() {
        let dir = TempDir::new().expect("tempdir");
        let (monitor, listener) = monitor_at(&dir.path().join("downloads"));
        monitor.prepare().expect("prepare");

        monitor.check_once();
        monitor.check_once();
        assert_eq!(listener.flips.load(Ordering::SeqCst), 0);
        assert_eq!(monitor.current_interval(), Duration::from_secs(30));
    }

    #[test]
    fn failure_flips_once_and_shrinks_interval() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("downloads");
        let (monitor, listener) = monitor_at(&root);
        monitor.prepare().expect("prepare");

        // Simulate the medium vanishing.
        fs::remove_dir_all(&root).expect("remove root");

        monitor.check_once();
        assert!(!monitor.is_available());
        assert_eq!(monitor.current_interval(), Duration::from_secs(5));
        assert_eq!(listener.flips.load(Ordering::SeqCst), 1);
        assert!(!listener.last_available.load(Ordering::SeqCst));

        // Still down: no second event, interval stays fast.
        monitor.check_once();
        assert_eq!(listener.flips.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.current_interval(), Duration::from_secs(5));
    }

    #[test]
    fn recovery_flips_back_and_rebuilds_subdirs() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("downloads");
        let (monitor, listener) = monitor_at(&root);
        monitor.prepare().expect("prepare");

        fs::remove_dir_all(&root).expect("remove root");
        monitor.check_once();
        assert!(!monitor.is_available());

        // Medium comes back, but bare: only the root reappears. The
        // recovery flip rebuilds the subdirectories.
        fs::create_dir_all(&root).expect("recreate root");
        monitor.check_once();

        assert!(monitor.is_available());
        assert_eq!(monitor.current_interval(), Duration::from_secs(30));
        assert_eq!(listener.flips.load(Ordering::SeqCst), 2);
        assert!(listener.last_available.load(Ordering::SeqCst));
        assert!(root.join("media").is_dir());
        assert!(root.join("staging").is_dir());
    }

    #[test]
    fn status_carries_root_and_timestamp() {
        let dir = TempDir::new().expect("tempdir");
        let root = dir.path().join("downloads");
        let (monitor, _) = monitor_at(&root);
        monitor.prepare().expect("prepare");

        let status = monitor.status();
        assert!(status.available);
        assert_eq!(status.root_path, root);
    }
}
