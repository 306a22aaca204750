// Per-key mutual exclusion.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use async_lock::{Mutex as KeyMutex, MutexGuardArc};
use tokio_util::sync::CancellationToken;

use crate::error::{WaitError, WaitResult};
use crate::keyed::registry::KeyedRegistry;

/// A map of independently-acquirable mutual-exclusion locks, one per key.
///
/// Lock state for a key exists only while tasks hold or await that key's
/// lock. Acquisitions of distinct keys never contend beyond the brief map
/// lookup.
///
/// The lock is not recursive: a task that acquires a key it already holds
/// deadlocks.
pub struct LockMap<K, S = RandomState> {
    hasher: S,
    registry: KeyedRegistry<K, KeyMutex<()>, S>,
}

impl<K: Hash + Eq + Clone> LockMap<K> {
    /// Create an empty map using the default key hashing.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K, S> LockMap<K, S>
where
    K: Hash + Eq + Clone,
    S: BuildHasher + Clone,
{
    /// Create an empty map whose keys are hashed and compared via
    /// `hasher`.
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            registry: KeyedRegistry::with_hasher(hasher.clone()),
            hasher,
        }
    }

    /// The hasher supplied at construction.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    /// Number of keys with live lock state (holders or waiters).
    pub fn len(&self) -> usize {
        self.registry.len()
    }

    /// Whether no key has live lock state.
    pub fn is_empty(&self) -> bool {
        self.registry.is_empty()
    }

    /// Acquire the lock for `key`, suspending while another task holds it.
    ///
    /// Returns [`WaitError::Cancelled`] when `cancel` fires before the
    /// lock is granted; the key's entry is released before the error
    /// propagates, so a cancelled acquisition leaks nothing.
    pub async fn lock(&self, key: K, cancel: CancellationToken) -> WaitResult<KeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let mutex = checkout.primitive();
        let acquired = tokio::select! {
            biased;
            guard = mutex.lock_arc() => Some(guard),
            _ = cancel.cancelled() => None,
        };
        match acquired {
            Some(guard) => {
                checkout.disarm();
                Ok(KeyGuard {
                    map: self,
                    key,
                    guard: Some(guard),
                })
            }
            // Dropping the checkout returns the entry reference.
            None => Err(WaitError::Cancelled),
        }
    }

    /// Blocking flavour of [`lock`](LockMap::lock) for non-async callers.
    ///
    /// The signal is observed before the wait begins; once the thread
    /// blocks on the lock there is no further cancellation point.
    pub fn lock_blocking(&self, key: K, cancel: CancellationToken) -> WaitResult<KeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let guard = checkout.primitive().lock_arc_blocking();
        checkout.disarm();
        Ok(KeyGuard {
            map: self,
            key,
            guard: Some(guard),
        })
    }
}

impl<K: Hash + Eq + Clone> Default for LockMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> fmt::Debug for LockMap<K, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockMap")
            .field("entries", &self.registry.len())
            .finish()
    }
}

/// Scoped holder of one key's lock.
///
/// Dropping the guard (or calling [`release`](KeyGuard::release)) unlocks
/// the key and then drops its reference on the map entry, in that order.
/// The bookkeeping runs at most once.
#[must_use = "the key unlocks as soon as the guard is dropped"]
pub struct KeyGuard<'a, K: Hash + Eq, S: BuildHasher> {
    map: &'a LockMap<K, S>,
    key: K,
    guard: Option<MutexGuardArc<()>>,
}

impl<K: Hash + Eq, S: BuildHasher> KeyGuard<'_, K, S> {
    /// The key this guard holds locked.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Unlock the key ahead of drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        // Unlock the primitive before dropping the map entry reference so
        // a task already waiting on it still finds the entry alive.
        if self.guard.take().is_some() {
            self.map.registry.release(&self.key);
        }
    }
}

impl<K: Hash + Eq, S: BuildHasher> Drop for KeyGuard<'_, K, S> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: Hash + Eq + fmt::Debug, S: BuildHasher> fmt::Debug for KeyGuard<'_, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyGuard").field("key", &self.key).finish()
    }
}
