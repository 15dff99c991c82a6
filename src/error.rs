// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Failure taxonomy for download attempts.
//!
//! Every way a single attempt can terminally fail is one variant here; the
//! rendered message becomes the task's `last_error` and travels with the
//! state-change event. Admission timeouts are deliberately absent: a worker
//! that never got a slot abandons the task without any state change, and the
//! recovery pass re-admits the row later.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Terminal cause of a failed download attempt.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The retrieval service reported a failure for this attempt.
    #[error("retrieval failed: {0}")]
    Retrieval(String),

    /// No completion signal arrived within the download timeout.
    #[error("no completion signal within {0:?}")]
    RetrievalTimeout(Duration),

    /// The storage target was unavailable when the final move was due.
    #[error("storage target unavailable")]
    StorageUnavailable,

    /// The final artifact could not be verified after the move. A task must
    /// never record `Complete` without the file actually being there.
    #[error("artifact missing after move: {}", .0.display())]
    PostMoveVerification(PathBuf),

    /// The remote reference no longer resolves (item deleted or
    /// inaccessible). Not retried automatically.
    #[error("reference no longer resolvable: {0}")]
    ReferenceUnresolvable(String),
}
