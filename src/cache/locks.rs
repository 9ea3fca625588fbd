//! Per-key exclusive access.
//!
//! Each key gets a lock token on demand. The token is dropped from the map as
//! soon as nobody holds or waits on it, so the map only grows with the number
//! of keys in use at once.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::cache::entry::ResourceKey;

#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: DashMap<ResourceKey, Arc<Mutex<()>>>,
}

/// Exclusive access to one key. Released on drop.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    key: ResourceKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &ResourceKey) -> KeyGuard<'_> {
        let token = self.token(key);
        let guard = token.lock_owned().await;
        KeyGuard {
            locks: self,
            key: key.clone(),
            guard: Some(guard),
        }
    }

    /// Take exclusive access only if nobody else holds it.
    pub fn try_lock(&self, key: &ResourceKey) -> Option<KeyGuard<'_>> {
        let token = self.token(key);
        match token.try_lock_owned() {
            Ok(guard) => Some(KeyGuard {
                locks: self,
                key: key.clone(),
                guard: Some(guard),
            }),
            Err(_) => {
                self.release(key);
                None
            }
        }
    }

    /// Whether some caller currently holds or awaits `key`.
    pub fn is_locked(&self, key: &ResourceKey) -> bool {
        self.locks.contains_key(key)
    }

    /// Number of live lock tokens.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn token(&self, key: &ResourceKey) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // Clones are taken under the shard lock, so a count of one means no
    // holder and no waiter can exist.
    fn release(&self, key: &ResourceKey) {
        self.locks
            .remove_if(key, |_, token| Arc::strong_count(token) == 1);
    }
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> ResourceKey {
        ResourceKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_tokens_removed_when_uncontended() {
        let locks = KeyLocks::new();
        {
            let _guard = locks.lock(&key("a")).await;
            assert!(locks.is_locked(&key("a")));
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let locks = KeyLocks::new();
        let guard = locks.lock(&key("a")).await;
        assert!(locks.try_lock(&key("a")).is_none());
        assert!(locks.try_lock(&key("b")).is_some());
        drop(guard);
        assert!(locks.try_lock(&key("a")).is_some());
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_failed_try_lock_keeps_holder_token() {
        let locks = KeyLocks::new();
        let guard = locks.lock(&key("a")).await;

        for _ in 0..3 {
            assert!(locks.try_lock(&key("a")).is_none());
        }
        assert_eq!(locks.len(), 1);
        assert!(locks.is_locked(&key("a")));

        drop(guard);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_waiter_keeps_token_alive() {
        let locks = Arc::new(KeyLocks::new());
        let first = locks.lock(&key("a")).await;

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key("a")).await;
            })
        };
        tokio::task::yield_now().await;

        drop(first);
        waiter.await.unwrap();
        assert!(locks.is_empty());
    }
}
