// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Admission control for in-flight retrievals.
//!
//! At most `max_slots` retrievals run at once, system-wide. Acquisition is
//! bounded; a worker that times out gets `None` and must walk away without
//! touching task state. The returned [`DownloadPermit`] releases its slot
//! and decrements the active gauge on `Drop`, so release happens exactly
//! once on every exit path.
//!
//! Gauges are plain atomics: observers read them without ever contending on
//! the semaphore.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounded admission gate shared by all orchestrator workers.
pub struct DownloadLimiter {
    slots: Arc<Semaphore>,
    active: Arc<AtomicUsize>,
    max_slots: usize,
}

/// One admitted retrieval. Hold it for the duration of the attempt.
pub struct DownloadPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for DownloadPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

impl DownloadLimiter {
    pub fn new(max_slots: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(max_slots)),
            active: Arc::new(AtomicUsize::new(0)),
            max_slots,
        }
    }

    /// Wait up to `timeout` for a free slot.
    pub async fn acquire(&self, timeout: Duration) -> Option<DownloadPermit> {
        match tokio::time::timeout(timeout, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.active.fetch_add(1, Ordering::SeqCst);
                Some(DownloadPermit {
                    _permit: permit,
                    active: Arc::clone(&self.active),
                })
            }
            // Closed semaphore or elapsed timeout both mean no admission.
            Ok(Err(_)) | Err(_) => None,
        }
    }

    /// Retrievals currently holding a slot.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Configured ceiling.
    pub fn max_slots(&self) -> usize {
        self.max_slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_and_drop_track_the_gauge() {
        let limiter = DownloadLimiter::new(2);
        assert_eq!(limiter.active(), 0);
        assert_eq!(limiter.max_slots(), 2);

        let a = limiter.acquire(Duration::from_millis(50)).await.expect("slot");
        let b = limiter.acquire(Duration::from_millis(50)).await.expect("slot");
        assert_eq!(limiter.active(), 2);

        drop(a);
        assert_eq!(limiter.active(), 1);
        drop(b);
        assert_eq!(limiter.active(), 0);
    }

    #[tokio::test]
    async fn exhausted_limiter_times_out() {
        let limiter = DownloadLimiter::new(1);
        let held = limiter.acquire(Duration::from_millis(50)).await.expect("slot");

        let denied = limiter.acquire(Duration::from_millis(50)).await;
        assert!(denied.is_none());
        assert_eq!(limiter.active(), 1);

        drop(held);
        let granted = limiter.acquire(Duration::from_millis(50)).await;
        assert!(granted.is_some());
    }

    #[tokio::test]
    async fn released_slot_wakes_a_waiter() {
        let limiter = Arc::new(DownloadLimiter::new(1));
        let held = limiter.acquire(Duration::from_millis(50)).await.expect("slot");

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire(Duration::from_secs(5)).await.is_some() })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);

        assert!(waiter.await.expect("join"));
    }
}
