use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::CacheKey;

#[derive(Debug, Default)]
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    /// Holders and waiters currently referring to this slot.
    users: usize,
}

type LockTable = Mutex<HashMap<CacheKey, Slot>>;

/// A registry of per-key locks.
///
/// Loads for the same [`CacheKey`] are serialized: a second load only proceeds after the first
/// one released its [`KeyLockGuard`], and waiters are served in the order they started waiting.
/// Loads for distinct keys never wait on each other.
///
/// Entries are created lazily on the first acquisition of a key and removed again as soon as no
/// guard and no waiter refers to them, so the table only ever holds keys that are in use.
#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    table: Arc<LockTable>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other guard for `key` exists and returns one.
    ///
    /// This never fails. Dropping the returned future before it resolves gives up the place in
    /// the queue without affecting other waiters.
    pub async fn acquire(&self, key: &CacheKey) -> KeyLockGuard {
        let user = self.enter(key);
        let guard = Arc::clone(&user.lock).lock_owned().await;
        tracing::trace!("Acquired key lock for `{}`", key);

        KeyLockGuard {
            _guard: guard,
            user,
        }
    }

    /// The number of keys that currently have a holder or a waiter.
    pub fn len(&self) -> usize {
        self.table.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn enter(&self, key: &CacheKey) -> LockUser {
        let mut table = self.table.lock();
        let slot = table.entry(key.clone()).or_default();
        slot.users += 1;
        let lock = Arc::clone(&slot.lock);

        metric!(gauge("key_locks.active") = table.len() as u64);

        LockUser {
            table: Arc::clone(&self.table),
            key: key.clone(),
            lock,
        }
    }
}

/// Registration of one holder or waiter in the [`KeyLocks`] table.
///
/// Unregisters on drop, which also covers a waiter whose `acquire` future got dropped.
#[derive(Debug)]
struct LockUser {
    table: Arc<LockTable>,
    key: CacheKey,
    lock: Arc<AsyncMutex<()>>,
}

impl Drop for LockUser {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        let Some(slot) = table.get_mut(&self.key) else {
            return;
        };
        slot.users = slot.users.saturating_sub(1);
        if slot.users == 0 {
            table.remove(&self.key);
        }
        metric!(gauge("key_locks.active") = table.len() as u64);
    }
}

/// Exclusive access to one key, released on drop.
#[derive(Debug)]
pub struct KeyLockGuard {
    // Fields drop in declaration order: the lock is released before the slot is unregistered.
    _guard: OwnedMutexGuard<()>,
    user: LockUser,
}

impl KeyLockGuard {
    pub fn key(&self) -> &CacheKey {
        &self.user.key
    }
}
