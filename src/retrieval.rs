// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Remote retrieval boundary.
//!
//! The wire protocol is somebody else's problem: the engine hands a task's
//! remote reference to this service and waits, bounded, for exactly one
//! terminal answer. Implementations stage bytes wherever they like (ideally
//! under the storage tree's staging directory so the final move stays on
//! one filesystem) and report the landing path back.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;

use crate::download::types::Task;

/// Result of one successful fetch.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// Total bytes written to the staging location.
    pub bytes_written: i64,
    /// Where the retrieved bytes landed, pending the move to final storage.
    pub staging_path: PathBuf,
}

/// External service that performs the actual protocol work.
#[async_trait]
pub trait RetrievalService: Send + Sync {
    /// Whether the transport is connected and able to serve requests. The
    /// recovery pass will not re-admit work while this is false.
    fn is_ready(&self) -> bool;

    /// Fetch the bytes behind `task`'s remote reference. Resolves exactly
    /// once. The orchestrator bounds the wait and drops this future on
    /// timeout, so implementations must tolerate being cancelled; a late
    /// completion after cancellation is ignored by design.
    async fn fetch(&self, task: &Task) -> Result<FetchOutcome>;

    /// Re-resolve `(message_ref, chat_ref)` to a fresh retrievable file id.
    /// Errors mean the remote item is gone or inaccessible.
    async fn resolve_reference(&self, message_ref: i64, chat_ref: i64) -> Result<i64>;
}
