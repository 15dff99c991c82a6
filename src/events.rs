// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-process event fan-out.
//!
//! Components publish task state transitions and storage availability flips
//! through one [`EventNotifier`]. Publishes run synchronously at the
//! transition point against a snapshot of the listener list, so listeners
//! can (un)subscribe concurrently with a publish. A listener that panics is
//! caught and logged; it never breaks the orchestrator or starves the
//! listeners behind it.
//!
//! Every state event carries the full updated task plus the old/new state
//! pair, so redelivery is idempotent: the snapshot alone is enough to
//! resynchronize a consumer.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use crate::download::types::{Task, TaskState};
use crate::locks::{resilient_read, resilient_write};
use crate::storage::StorageStatus;

/// Subscriber to engine events.
///
/// The storage hook is defaulted so state-only subscribers stay small.
pub trait EngineListener: Send + Sync {
    /// A task transition was persisted. Fired once per transition.
    fn on_state_changed(&self, task: &Task, old: TaskState, new: TaskState);

    /// The storage target flipped between available and unavailable.
    /// Fired only on flips, never on routine probes.
    fn on_storage_changed(&self, _status: &StorageStatus) {}
}

/// Listener registry with snapshot-iterate publishing.
#[derive(Default)]
pub struct EventNotifier {
    listeners: RwLock<Vec<Arc<dyn EngineListener>>>,
}

impl EventNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. The same `Arc` may be handed to
    /// [`EventNotifier::unsubscribe`] later.
    pub fn subscribe(&self, listener: Arc<dyn EngineListener>) {
        resilient_write(&self.listeners).push(listener);
    }

    /// Remove a listener by `Arc` identity.
    pub fn unsubscribe(&self, listener: &Arc<dyn EngineListener>) {
        resilient_write(&self.listeners).retain(|l| !Arc::ptr_eq(l, listener));
    }

    pub fn listener_count(&self) -> usize {
        resilient_read(&self.listeners).len()
    }

    /// Publish a task transition to all current listeners.
    pub fn publish_state_change(&self, task: &Task, old: TaskState, new: TaskState) {
        for listener in self.snapshot() {
            let outcome =
                catch_unwind(AssertUnwindSafe(|| listener.on_state_changed(task, old, new)));
            if outcome.is_err() {
                tracing::warn!(
                    unique_id = %task.unique_id,
                    %old,
                    %new,
                    "state-change listener panicked; skipping it"
                );
            }
        }
    }

    /// Publish a storage availability flip to all current listeners.
    pub fn publish_storage_change(&self, status: &StorageStatus) {
        for listener in self.snapshot() {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener.on_storage_changed(status)));
            if outcome.is_err() {
                tracing::warn!(
                    available = status.available,
                    "storage-change listener panicked; skipping it"
                );
            }
        }
    }

    fn snapshot(&self) -> Vec<Arc<dyn EngineListener>> {
        resilient_read(&self.listeners).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
    }

    impl EngineListener for Counting {
        fn on_state_changed(&self, _task: &Task, _old: TaskState, _new: TaskState) {
            self.calls.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl EngineListener for Panicking {
        fn on_state_changed(&self, _task: &Task, _old: TaskState, _new: TaskState) {
            panic!("listener bug");
        }
    }

    fn sample_task() -> Task {
        Task::new("uid-events", 1, 2, 3, "clip.mp4", 100)
    }

    #[test]
    fn subscribe_publish_unsubscribe() {
        let notifier = EventNotifier::new();
        let listener = Arc::new(Counting { calls: AtomicUsize::new(0) });
        let handle: Arc<dyn EngineListener> = listener.clone();

        notifier.subscribe(handle.clone());
        assert_eq!(notifier.listener_count(), 1);

        let task = sample_task();
        notifier.publish_state_change(&task, TaskState::Created, TaskState::Downloading);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);

        notifier.unsubscribe(&handle);
        assert_eq!(notifier.listener_count(), 0);
        notifier.publish_state_change(&task, TaskState::Downloading, TaskState::Failed);
        assert_eq!(listener.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_listener_does_not_starve_the_rest() {
        let notifier = EventNotifier::new();
        let survivor = Arc::new(Counting { calls: AtomicUsize::new(0) });

        notifier.subscribe(Arc::new(Panicking));
        notifier.subscribe(survivor.clone());

        let task = sample_task();
        notifier.publish_state_change(&task, TaskState::Created, TaskState::Failed);
        assert_eq!(survivor.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn storage_hook_defaults_to_noop() {
        let notifier = EventNotifier::new();
        notifier.subscribe(Arc::new(Counting { calls: AtomicUsize::new(0) }));

        let status = StorageStatus {
            available: false,
            root_path: "downloads".into(),
            last_checked_at: chrono::Utc::now(),
        };
        // Must not panic even though the listener never implemented it.
        notifier.publish_storage_change(&status);
    }
}
