//! Shared/exclusive locking for read-mostly paths.
//!
//! Inventory reads vastly outnumber writes, so the read path takes a
//! shared lock that many readers hold at once while writers get exclusive
//! access. This service is in-process: cross-process exclusion for
//! mutations goes through [`crate::lock::LockService`]; the read/write
//! variant exists to keep in-process readers from tearing a write in
//! flight.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::timeout;

/// Errors from shared/exclusive acquisition.
#[derive(Error, Debug)]
pub enum RwLockError {
    /// The wait time elapsed.
    #[error("Read/write lock acquisition timed out for key '{key}'")]
    Timeout {
        /// The contested key.
        key: String,
    },
}

/// Guard for a shared (read) hold.
pub struct ReadGuard {
    _guard: tokio::sync::OwnedRwLockReadGuard<()>,
}

/// Guard for an exclusive (write) hold.
pub struct WriteGuard {
    _guard: tokio::sync::OwnedRwLockWriteGuard<()>,
}

/// Named read/write locks, created on first use.
#[derive(Clone, Default)]
pub struct RwLockService {
    locks: Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>,
}

impl RwLockService {
    /// Create an empty service.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, key: &str) -> Arc<RwLock<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    /// Acquire shared access; many readers may hold simultaneously.
    ///
    /// # Errors
    ///
    /// [`RwLockError::Timeout`] when `wait` elapses.
    pub async fn acquire_read(&self, key: &str, wait: Duration) -> Result<ReadGuard, RwLockError> {
        let lock = self.lock_for(key);
        match timeout(wait, lock.read_owned()).await {
            Ok(guard) => Ok(ReadGuard { _guard: guard }),
            Err(_) => Err(RwLockError::Timeout {
                key: key.to_string(),
            }),
        }
    }

    /// Acquire exclusive access.
    ///
    /// # Errors
    ///
    /// [`RwLockError::Timeout`] when `wait` elapses.
    pub async fn acquire_write(
        &self,
        key: &str,
        wait: Duration,
    ) -> Result<WriteGuard, RwLockError> {
        let lock = self.lock_for(key);
        match timeout(wait, lock.write_owned()).await {
            Ok(guard) => Ok(WriteGuard { _guard: guard }),
            Err(_) => Err(RwLockError::Timeout {
                key: key.to_string(),
            }),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)] // Test code can use unwrap
mod tests {
    use super::*;

    #[tokio::test]
    async fn many_readers_hold_together() {
        let service = RwLockService::new();
        let wait = Duration::from_millis(100);

        let first = service.acquire_read("stock:p1", wait).await.unwrap();
        let second = service.acquire_read("stock:p1", wait).await.unwrap();
        drop(first);
        drop(second);
    }

    #[tokio::test]
    async fn writer_excludes_readers() {
        let service = RwLockService::new();
        let wait = Duration::from_millis(80);

        let writer = service.acquire_write("stock:p1", wait).await.unwrap();
        let blocked = service.acquire_read("stock:p1", wait).await;
        assert!(matches!(blocked, Err(RwLockError::Timeout { .. })));

        drop(writer);
        let reader = service.acquire_read("stock:p1", wait).await;
        assert!(reader.is_ok());
    }

    #[tokio::test]
    async fn distinct_keys_do_not_contend() {
        let service = RwLockService::new();
        let wait = Duration::from_millis(80);

        let _writer = service.acquire_write("stock:p1", wait).await.unwrap();
        let other = service.acquire_write("stock:p2", wait).await;
        assert!(other.is_ok());
    }
}
