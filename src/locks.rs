// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Poison-recovering lock helpers.
//!
//! A thread that panics while holding a lock poisons it. The engine treats
//! poisoning as recoverable: the guard is taken anyway and the event is
//! logged, since a possibly-stale registry entry is preferable to wedging
//! every worker that shares the lock.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Acquire a read lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    match lock.read() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "mediahaul::locks",
                "RwLock poisoned during read acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

/// Acquire a write lock, recovering the guard if the lock is poisoned.
#[inline]
pub fn resilient_write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    match lock.write() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!(
                target: "mediahaul::locks",
                "RwLock poisoned during write acquisition; recovering. \
                 A thread panicked while holding this lock."
            );
            poisoned.into_inner()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn read_and_write_on_healthy_lock() {
        let lock = RwLock::new(1);
        assert_eq!(*resilient_read(&lock), 1);
        *resilient_write(&lock) = 2;
        assert_eq!(*resilient_read(&lock), 2);
    }

    #[test]
    fn recovers_from_poisoned_lock() {
        let lock = Arc::new(RwLock::new(41));

        let poisoner = Arc::clone(&lock);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(lock.is_poisoned());
        *resilient_write(&lock) += 1;
        assert_eq!(*resilient_read(&lock), 42);
    }
}
