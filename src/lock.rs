//! Per-object reader/writer locking.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::error::{OcflError, Result};

/// Maps object IDs to reader/writer locks. Lock acquisition waits up to the configured
/// timeout and then fails with `OcflError::LockAcquisition`; the guarded operation must not
/// proceed without the lock.
///
/// This implementation only coordinates threads within a single process. Multi-process
/// repositories require external coordination.
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Executes the closure while holding the object's write lock. Writers exclude both
    /// readers and other writers.
    pub fn do_in_write_lock<T>(
        &self,
        object_id: &str,
        f: impl FnOnce() -> Result<T>,
    ) -> Result<T> {
        let lock = self.object_lock(object_id);

        let result = match lock.try_write_for(self.timeout) {
            Some(_guard) => f(),
            None => Err(OcflError::LockAcquisition(object_id.to_string())),
        };
        result
    }

    /// Executes the closure while holding the object's read lock. Multiple readers may hold
    /// the lock concurrently.
    pub fn do_in_read_lock<T>(&self, object_id: &str, f: impl FnOnce() -> Result<T>) -> Result<T> {
        let lock = self.object_lock(object_id);

        let result = match lock.try_read_for(self.timeout) {
            Some(_guard) => f(),
            None => Err(OcflError::LockAcquisition(object_id.to_string())),
        };
        result
    }

    fn object_lock(&self, object_id: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock();
        locks
            .entry(object_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::LockManager;
    use crate::error::OcflError;

    #[test]
    fn write_lock_excludes_other_writers() {
        let manager = Arc::new(LockManager::new(Duration::from_millis(50)));

        manager
            .do_in_write_lock("o1", || {
                let inner = manager.clone();
                let handle = std::thread::spawn(move || {
                    inner.do_in_write_lock("o1", || Ok(())).is_err()
                });
                assert!(handle.join().unwrap());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn multiple_readers_may_hold_concurrently() {
        let manager = Arc::new(LockManager::new(Duration::from_millis(50)));

        manager
            .do_in_read_lock("o1", || {
                let inner = manager.clone();
                let handle =
                    std::thread::spawn(move || inner.do_in_read_lock("o1", || Ok(7)).unwrap());
                assert_eq!(7, handle.join().unwrap());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn writers_exclude_readers() {
        let manager = Arc::new(LockManager::new(Duration::from_millis(50)));

        manager
            .do_in_write_lock("o1", || {
                let inner = manager.clone();
                let handle = std::thread::spawn(move || {
                    matches!(
                        inner.do_in_read_lock("o1", || Ok(())),
                        Err(OcflError::LockAcquisition(_))
                    )
                });
                assert!(handle.join().unwrap());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn locks_are_per_object() {
        let manager = Arc::new(LockManager::new(Duration::from_millis(50)));

        manager
            .do_in_write_lock("o1", || {
                let inner = manager.clone();
                let handle =
                    std::thread::spawn(move || inner.do_in_write_lock("o2", || Ok(())).is_ok());
                assert!(handle.join().unwrap());
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn lock_released_after_failure() {
        let manager = LockManager::new(Duration::from_millis(50));

        let result: Result<(), OcflError> = manager.do_in_write_lock("o1", || {
            Err(OcflError::IllegalState("boom".to_string()))
        });
        assert!(result.is_err());

        assert!(manager.do_in_write_lock("o1", || Ok(())).is_ok());
    }
}
