// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! mediahaul - download orchestration and recovery engine
//!
//! Downloads remote media objects identified by external references,
//! persists their lifecycle state, and exposes progress to observers, while
//! tolerating an unreliable backing store (removable or network-attached
//! media) and an unreliable retrieval channel. The protocol work itself is
//! delegated to a host-supplied [`retrieval::RetrievalService`]; row
//! durability to a host-supplied [`store::TaskStore`].
//!
//! # Core Modules
//!
//! - [`engine`] - component wiring, lifecycle, observability snapshot
//! - [`download`] - task state machine, registry, admission, orchestration
//! - [`storage`] - availability monitoring of the download tree
//! - [`recovery`] - startup and periodic re-admission of incomplete work
//! - [`events`] - in-process state-change fan-out
//! - [`store`] - persistence contract (+ in-memory implementation)
//! - [`retrieval`] - remote retrieval contract
//! - [`config`] - engine tunables
//! - [`error`] - failure taxonomy
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use mediahaul::{Engine, EngineConfig, MemoryTaskStore, Task};
//! # use mediahaul::retrieval::{FetchOutcome, RetrievalService};
//! # struct MyRetrieval;
//! # #[async_trait::async_trait]
//! # impl RetrievalService for MyRetrieval {
//! #     fn is_ready(&self) -> bool { true }
//! #     async fn fetch(&self, _t: &Task) -> anyhow::Result<FetchOutcome> { unimplemented!() }
//! #     async fn resolve_reference(&self, _m: i64, _c: i64) -> anyhow::Result<i64> { unimplemented!() }
//! # }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryTaskStore::new()),
//!     Arc::new(MyRetrieval),
//! )?;
//! engine.start().await;
//!
//! let task = Task::new("AgADBAAD", 42, 1001, 2002, "clip.mp4", 1_000_000);
//! engine.manager().submit_new(task).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod locks;
pub mod recovery;
pub mod retrieval;
pub mod storage;
pub mod store;

pub use config::EngineConfig;
pub use download::{DownloadLimiter, DownloadManager, DownloadPermit, Task, TaskRegistry, TaskState};
pub use engine::{Engine, EngineSnapshot};
pub use error::DownloadError;
pub use events::{EngineListener, EventNotifier};
pub use recovery::RecoveryManager;
pub use retrieval::{FetchOutcome, RetrievalService};
pub use storage::{StorageMonitor, StoragePaths, StorageStatus};
pub use store::{MemoryTaskStore, TaskStore};
