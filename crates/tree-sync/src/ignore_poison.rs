//! Extension traits to ignore lock poisoning.
//!
//! Every lock in this crate guards plain bookkeeping (queues, maps of trackers, LRU entries)
//! that stays consistent even if a holder panicked mid-update, so callers use
//! `.lock_ignore_poison()` / `.read_ignore_poison()` instead of propagating `PoisonError`.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub trait IgnorePoison<T> {
    /// Locks the mutex, ignoring poison.
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T>;
}

impl<T> IgnorePoison<T> for Mutex<T> {
    fn lock_ignore_poison(&self) -> MutexGuard<'_, T> {
        self.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub trait IgnorePoisonRw<T> {
    fn read_ignore_poison(&self) -> RwLockReadGuard<'_, T>;
    fn write_ignore_poison(&self) -> RwLockWriteGuard<'_, T>;
}

impl<T> IgnorePoisonRw<T> for RwLock<T> {
    fn read_ignore_poison(&self) -> RwLockReadGuard<'_, T> {
        self.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_ignore_poison(&self) -> RwLockWriteGuard<'_, T> {
        self.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn poisoned_mutex_is_still_usable() {
        let shared = Arc::new(Mutex::new(1));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.lock().unwrap();
            panic!("poison it");
        })
        .join();

        assert!(shared.is_poisoned());
        *shared.lock_ignore_poison() += 1;
        assert_eq!(*shared.lock_ignore_poison(), 2);
    }

    #[test]
    fn poisoned_rwlock_is_still_usable() {
        let shared = Arc::new(RwLock::new(vec![1]));
        let clone = Arc::clone(&shared);
        let _ = std::thread::spawn(move || {
            let _guard = clone.write().unwrap();
            panic!("poison it");
        })
        .join();

        shared.write_ignore_poison().push(2);
        assert_eq!(*shared.read_ignore_poison(), vec![1, 2]);
    }
}
