// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Engine configuration.
//!
//! Every tunable the engine consumes lives here with its default. A config
//! can be loaded from a JSON file, and a handful of deployment-environment
//! overrides (`DOWNLOAD_DIR`, `MAX_CONCURRENT_DOWNLOADS`) are applied on top
//! so containerized hosts can steer the engine without a file.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_storage_root() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_max_concurrent() -> usize {
    16
}

fn default_download_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_max_retries() -> u32 {
    3
}

fn default_progress_sample_every() -> u32 {
    5
}

fn default_speed_stale_after() -> Duration {
    Duration::from_secs(2)
}

fn default_monitor_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_monitor_fast_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_recovery_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

/// Tunables for the download engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the download tree. May live on removable or network media;
    /// the storage monitor owns detecting when it goes away.
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,

    /// Maximum simultaneous in-flight retrievals, system-wide.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Upper bound on waiting for a concurrency slot. A worker that does
    /// not get one abandons the task silently.
    #[serde(default = "default_download_timeout")]
    pub admission_timeout: Duration,

    /// Upper bound on waiting for the retrieval service's completion
    /// signal for one task.
    #[serde(default = "default_download_timeout")]
    pub download_timeout: Duration,

    /// Retry budget per task. Once spent, `Failed` is terminal.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Recompute the speed estimate only every Nth progress sample.
    #[serde(default = "default_progress_sample_every")]
    pub progress_sample_every: u32,

    /// Report a speed of zero once no sample arrived for this long.
    #[serde(default = "default_speed_stale_after")]
    pub speed_stale_after: Duration,

    /// Storage probe cadence while the target is healthy.
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval: Duration,

    /// Storage probe cadence while the target is unavailable, so recovery
    /// is noticed quickly.
    #[serde(default = "default_monitor_fast_interval")]
    pub monitor_fast_interval: Duration,

    /// Cadence of the recovery pass that re-admits incomplete tasks.
    #[serde(default = "default_recovery_interval")]
    pub recovery_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            storage_root: default_storage_root(),
            max_concurrent: default_max_concurrent(),
            admission_timeout: default_download_timeout(),
            download_timeout: default_download_timeout(),
            max_retries: default_max_retries(),
            progress_sample_every: default_progress_sample_every(),
            speed_stale_after: default_speed_stale_after(),
            monitor_interval: default_monitor_interval(),
            monitor_fast_interval: default_monitor_fast_interval(),
            recovery_interval: default_recovery_interval(),
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise, then apply
    /// environment overrides.
    pub fn load_or_default(path: &Path) -> Self {
        let config = if path.exists() {
            match Self::load(path) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!("ignoring unreadable config: {err:#}");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.apply_env()
    }

    /// Write the config as pretty JSON, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, content)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply deployment-environment overrides on top of this config.
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|key| env::var(key).ok())
    }

    fn apply_env_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(dir) = var("DOWNLOAD_DIR").filter(|d| !d.is_empty()) {
            self.storage_root = PathBuf::from(dir);
        }
        if let Some(raw) = var("MAX_CONCURRENT_DOWNLOADS") {
            match raw.parse::<usize>() {
                Ok(n) if n > 0 => self.max_concurrent = n,
                _ => tracing::warn!("ignoring invalid MAX_CONCURRENT_DOWNLOADS: {raw}"),
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_engine_contract() {
        let config = EngineConfig::default();
        assert_eq!(config.storage_root, PathBuf::from("downloads"));
        assert_eq!(config.max_concurrent, 16);
        assert_eq!(config.download_timeout, Duration::from_secs(1200));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.progress_sample_every, 5);
        assert_eq!(config.speed_stale_after, Duration::from_secs(2));
        assert_eq!(config.monitor_interval, Duration::from_secs(30));
        assert_eq!(config.monitor_fast_interval, Duration::from_secs(5));
        assert_eq!(config.recovery_interval, Duration::from_secs(300));
    }

    #[test]
    fn env_overrides_storage_root_and_concurrency() {
        let config = EngineConfig::default().apply_env_from(|key| match key {
            "DOWNLOAD_DIR" => Some("/mnt/usb/downloads".to_string()),
            "MAX_CONCURRENT_DOWNLOADS" => Some("4".to_string()),
            _ => None,
        });
        assert_eq!(config.storage_root, PathBuf::from("/mnt/usb/downloads"));
        assert_eq!(config.max_concurrent, 4);
    }

    #[test]
    fn invalid_env_values_are_ignored() {
        let config = EngineConfig::default().apply_env_from(|key| match key {
            "DOWNLOAD_DIR" => Some(String::new()),
            "MAX_CONCURRENT_DOWNLOADS" => Some("zero".to_string()),
            _ => None,
        });
        assert_eq!(config.storage_root, PathBuf::from("downloads"));
        assert_eq!(config.max_concurrent, 16);
    }

    #[test]
    fn file_round_trip_preserves_overrides() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("engine.json");

        let mut config = EngineConfig::default();
        config.max_concurrent = 2;
        config.monitor_interval = Duration::from_secs(7);
        config.save(&path).expect("save config");

        let loaded = EngineConfig::load(&path).expect("load config");
        assert_eq!(loaded.max_concurrent, 2);
        assert_eq!(loaded.monitor_interval, Duration::from_secs(7));
        // Untouched fields fall back to defaults.
        assert_eq!(loaded.max_retries, 3);
    }

    #[test]
    fn partial_file_takes_defaults_for_missing_fields() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("engine.json");
        fs::write(&path, r#"{"max_concurrent": 3}"#).expect("write config");

        let loaded = EngineConfig::load(&path).expect("load config");
        assert_eq!(loaded.max_concurrent, 3);
        assert_eq!(loaded.storage_root, PathBuf::from("downloads"));
    }
}
