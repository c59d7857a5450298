//! Per-path exclusive lock table.
//!
//! Enforces at-most-one open handle per path and serializes
//! create/open/remove against handles still in flight. Waiting is a
//! bounded poll rather than a condition variable: the retry ceiling
//! yields a deterministic EPERM path.

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use crate::error::FsError;

/// Interval between lock polls.
const WAIT_INTERVAL: Duration = Duration::from_millis(200);

/// Number of retries before giving up (~5 seconds in total).
const WAIT_RETRIES: u32 = 25;

/// Process-local path lock table.
#[derive(Debug, Default)]
pub struct LockTable {
    locks: Mutex<HashSet<String>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock at `path`.
    pub fn lock(&self, path: &str) {
        self.locks
            .lock()
            .expect("lock table mutex poisoned")
            .insert(path.to_string());
    }

    /// Release the lock at `path`.
    pub fn unlock(&self, path: &str) {
        self.locks
            .lock()
            .expect("lock table mutex poisoned")
            .remove(path);
    }

    /// Whether `path` is currently locked.
    pub fn is_locked(&self, path: &str) -> bool {
        self.locks
            .lock()
            .expect("lock table mutex poisoned")
            .contains(path)
    }

    /// Wait for `path` to become free.
    ///
    /// Polls every 200 ms for up to 25 retries; a path still locked
    /// after that surfaces as [`FsError::Busy`] (EPERM).
    pub fn wait(&self, path: &str) -> Result<(), FsError> {
        for i in 0.. {
            if !self.is_locked(path) {
                break;
            }
            if i > WAIT_RETRIES {
                return Err(FsError::Busy);
            }
            std::thread::sleep(WAIT_INTERVAL);
        }
        Ok(())
    }
}
