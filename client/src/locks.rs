//! Async locks keyed by value.
//!
//! One `tokio` mutex per key, created on first use. An entry is removed when
//! the last guard for it drops and no other task is waiting on it, so the map
//! only holds keys that are in use.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Entries<K> = HashMap<K, Arc<Mutex<()>>>;
type LockMap<K> = Arc<StdMutex<Entries<K>>>;

fn entries<K>(locks: &StdMutex<Entries<K>>) -> MutexGuard<'_, Entries<K>> {
    locks.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Set of async mutexes, one per key
#[derive(Clone)]
pub struct KeyedLocks<K: Eq + Hash> {
    locks: LockMap<K>,
}

/// Exclusive hold on one key; dropping it releases the lock
pub struct KeyedGuard<K: Eq + Hash> {
    key: K,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockMap<K>,
}

impl<K: Eq + Hash + Clone> KeyedLocks<K> {
    /// Create an empty set
    pub fn new() -> Self {
        Self {
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: K) -> KeyedGuard<K> {
        let lock = entries(&self.locks)
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        KeyedGuard {
            key,
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Number of keys currently held or waited on
    pub fn len(&self) -> usize {
        entries(&self.locks).len()
    }

    /// Whether no key is held or waited on
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K: Eq + Hash + Clone> Default for KeyedLocks<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash> KeyedGuard<K> {
    /// Key this guard holds
    pub fn key(&self) -> &K {
        &self.key
    }
}

impl<K: Eq + Hash> Drop for KeyedGuard<K> {
    fn drop(&mut self) {
        let mut locks = entries(&self.locks);
        drop(self.guard.take());
        // the map's own reference is the only one left
        if locks
            .get(&self.key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_release() {
        let locks = KeyedLocks::new();
        let guard = locks.lock(7u64).await;
        assert_eq!(*guard.key(), 7);
        assert_eq!(locks.len(), 1);

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_entry_kept_while_waited_on() {
        let locks = KeyedLocks::new();
        let guard = locks.lock("loan").await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock("loan").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        assert_eq!(locks.len(), 1);

        waiter.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyedLocks::new();
        let _first = locks.lock(1u64).await;
        let second = tokio::time::timeout(Duration::from_millis(50), locks.lock(2u64)).await;

        assert!(second.is_ok());
        assert_eq!(locks.len(), 2);
    }
}
