use crate::{HostPathError, HostPathResult};
use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

/// Per-key mutual exclusion for mutating volume operations.
///
/// Keys only live in the set while an operation holds them. Acquire never
/// blocks: contention is reported back so the caller can ask for a retry.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, HashSet<String>> {
        // the set stays consistent even if a holder panicked
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn try_acquire(&self, key: &str) -> bool {
        self.inner().insert(key.to_string())
    }

    pub fn release(&self, key: &str) {
        self.inner().remove(key);
    }

    pub fn is_locked(&self, key: &str) -> bool {
        self.inner().contains(key)
    }

    /// Acquires `key` and releases it again when the guard drops.
    pub fn try_lock(&self, key: &str) -> Option<VolumeLockGuard<'_>> {
        if !self.try_acquire(key) {
            return None;
        }
        Some(VolumeLockGuard {
            locks: self,
            key: key.to_string(),
        })
    }

    pub fn lock_or_abort(&self, key: &str) -> HostPathResult<VolumeLockGuard<'_>> {
        self.try_lock(key).ok_or_else(|| {
            debug!("volume lock busy: key={}", key);
            HostPathError::AlreadyInProgress(format!(
                "an operation with the given volume id {} already exists",
                key
            ))
        })
    }
}

pub struct VolumeLockGuard<'a> {
    locks: &'a VolumeLocks,
    key: String,
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.release(&self.key);
    }
}
