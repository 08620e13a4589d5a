//! Per-key async locking.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-key async mutex. Serializes lifecycle changes for a single unit while
/// leaving other units free to proceed.
#[derive(Debug, Clone, Default)]
pub struct KeyLocker {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyLocker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, key: impl Into<String>) -> KeyLockGuard {
        let key = key.into();
        let lock =
            self.locks.entry(key.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone();
        let guard = lock.lock_owned().await;
        KeyLockGuard { key, locks: Arc::clone(&self.locks), guard: Some(guard) }
    }

    /// Number of keys currently locked or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct KeyLockGuard {
    key: String,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyLockGuard {
    fn drop(&mut self) {
        self.guard.take();
        // the map holds one reference; any other means a waiter still needs it
        self.locks.remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
