// Per-key reader/writer locks with upgradeable readers.

use std::collections::hash_map::RandomState;
use std::fmt;
use std::hash::{BuildHasher, Hash};

use async_lock::{
    RwLock as KeyRwLock, RwLockReadGuardArc, RwLockUpgradableReadGuardArc, RwLockWriteGuardArc,
};
use tokio_util::sync::CancellationToken;

use crate::error::{WaitError, WaitResult};
use crate::keyed::registry::KeyedRegistry;

/// A map of independently-acquirable reader/writer locks, one per key.
///
/// Each key admits many readers or one writer, plus at most one
/// upgradeable reader that coexists with plain readers and can exchange
/// its read lock for the write lock atomically.
///
/// Lock state for a key exists only while tasks hold or await that key's
/// lock. The lock is not recursive: a task that acquires a key it already
/// holds in a conflicting mode deadlocks.
pub struct RwLockMap<K, S = RandomState> {
    hasher: S,
    registry: KeyedRegistry<K, KeyRwLock<()>, S>,
}

impl<K: Hash + Eq + Clone> RwLockMap<K> {
    /// Create an empty map using the default key hashing.
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }
}

impl<K, S> RwLockMap<K, S>
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

    /// Acquire a read lock for `key`, suspending while a writer holds or
    /// awaits it.
    pub async fn read(
        &self,
        key: K,
        cancel: CancellationToken,
    ) -> WaitResult<ReadKeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let lock = checkout.primitive();
        let acquired = tokio::select! {
            biased;
            guard = lock.read_arc() => Some(guard),
            _ = cancel.cancelled() => None,
        };
        match acquired {
            Some(guard) => {
                checkout.disarm();
                Ok(ReadKeyGuard {
                    map: self,
                    key,
                    guard: Some(guard),
                })
            }
            None => Err(WaitError::Cancelled),
        }
    }

    /// Blocking flavour of [`read`](RwLockMap::read); the signal is
    /// observed before the wait begins.
    pub fn read_blocking(
        &self,
        key: K,
        cancel: CancellationToken,
    ) -> WaitResult<ReadKeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let guard = checkout.primitive().read_arc_blocking();
        checkout.disarm();
        Ok(ReadKeyGuard {
            map: self,
            key,
            guard: Some(guard),
        })
    }

    /// Acquire the write lock for `key`, suspending while any reader or
    /// writer holds it.
    pub async fn write(
        &self,
        key: K,
        cancel: CancellationToken,
    ) -> WaitResult<WriteKeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let lock = checkout.primitive();
        let acquired = tokio::select! {
            biased;
            guard = lock.write_arc() => Some(guard),
            _ = cancel.cancelled() => None,
        };
        match acquired {
            Some(guard) => {
                checkout.disarm();
                Ok(WriteKeyGuard {
                    map: self,
                    key,
                    guard: Some(guard),
                })
            }
            None => Err(WaitError::Cancelled),
        }
    }

    /// Blocking flavour of [`write`](RwLockMap::write); the signal is
    /// observed before the wait begins.
    pub fn write_blocking(
        &self,
        key: K,
        cancel: CancellationToken,
    ) -> WaitResult<WriteKeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let guard = checkout.primitive().write_arc_blocking();
        checkout.disarm();
        Ok(WriteKeyGuard {
            map: self,
            key,
            guard: Some(guard),
        })
    }

    /// Acquire an upgradeable read lock for `key`.
    ///
    /// The upgradeable reader coexists with plain readers but excludes
    /// writers and other upgradeable readers. The returned guard can
    /// [`upgrade`](UpgradableKeyGuard::upgrade) to the write lock without
    /// releasing the key in between.
    pub async fn upgradable_read(
        &self,
        key: K,
        cancel: CancellationToken,
    ) -> WaitResult<UpgradableKeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let lock = checkout.primitive();
        let acquired = tokio::select! {
            biased;
            guard = lock.upgradable_read_arc() => Some(guard),
            _ = cancel.cancelled() => None,
        };
        match acquired {
            Some(guard) => {
                checkout.disarm();
                Ok(UpgradableKeyGuard {
                    map: self,
                    key,
                    state: UpgradableState::Reading(guard),
                    holds_entry: true,
                })
            }
            None => Err(WaitError::Cancelled),
        }
    }

    /// Blocking flavour of
    /// [`upgradable_read`](RwLockMap::upgradable_read); the signal is
    /// observed before the wait begins.
    pub fn upgradable_read_blocking(
        &self,
        key: K,
        cancel: CancellationToken,
    ) -> WaitResult<UpgradableKeyGuard<'_, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let checkout = self.registry.checkout(&key);
        let guard = checkout.primitive().upgradable_read_arc_blocking();
        checkout.disarm();
        Ok(UpgradableKeyGuard {
            map: self,
            key,
            state: UpgradableState::Reading(guard),
            holds_entry: true,
        })
    }
}

impl<K: Hash + Eq + Clone> Default for RwLockMap<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, S> fmt::Debug for RwLockMap<K, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwLockMap")
            .field("entries", &self.registry.len())
            .finish()
    }
}

/// Scoped holder of one key's read lock.
#[must_use = "the read lock is released as soon as the guard is dropped"]
pub struct ReadKeyGuard<'a, K: Hash + Eq, S: BuildHasher> {
    map: &'a RwLockMap<K, S>,
    key: K,
    guard: Option<RwLockReadGuardArc<()>>,
}

impl<K: Hash + Eq, S: BuildHasher> ReadKeyGuard<'_, K, S> {
    /// The key this guard holds a read lock on.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the read lock ahead of drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.guard.take().is_some() {
            self.map.registry.release(&self.key);
        }
    }
}

impl<K: Hash + Eq, S: BuildHasher> Drop for ReadKeyGuard<'_, K, S> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: Hash + Eq + fmt::Debug, S: BuildHasher> fmt::Debug for ReadKeyGuard<'_, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadKeyGuard")
            .field("key", &self.key)
            .finish()
    }
}

/// Scoped holder of one key's write lock.
#[must_use = "the write lock is released as soon as the guard is dropped"]
pub struct WriteKeyGuard<'a, K: Hash + Eq, S: BuildHasher> {
    map: &'a RwLockMap<K, S>,
    key: K,
    guard: Option<RwLockWriteGuardArc<()>>,
}

impl<K: Hash + Eq, S: BuildHasher> WriteKeyGuard<'_, K, S> {
    /// The key this guard holds the write lock on.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Release the write lock ahead of drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.guard.take().is_some() {
            self.map.registry.release(&self.key);
        }
    }
}

impl<K: Hash + Eq, S: BuildHasher> Drop for WriteKeyGuard<'_, K, S> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: Hash + Eq + fmt::Debug, S: BuildHasher> fmt::Debug for WriteKeyGuard<'_, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteKeyGuard")
            .field("key", &self.key)
            .finish()
    }
}

/// What the upgradeable guard currently holds on its key.
enum UpgradableState {
    /// The upgradeable read lock.
    Reading(RwLockUpgradableReadGuardArc<()>),
    /// The write lock, after an upgrade.
    Upgraded(RwLockWriteGuardArc<()>),
    /// Nothing: transiently while an upgrade is in flight, and finally
    /// after release.
    Released,
}

/// Scoped holder of one key's upgradeable read lock.
///
/// The guard can be upgraded to the write lock and downgraded back any
/// number of times; the map entry reference is taken once at acquisition
/// and returned once, when this guard is released.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct UpgradableKeyGuard<'a, K: Hash + Eq, S: BuildHasher> {
    map: &'a RwLockMap<K, S>,
    key: K,
    state: UpgradableState,
    // Tracked separately from `state`: an upgrade abandoned mid-flight
    // (its future dropped) relinquishes the lock but still owes the map
    // entry reference.
    holds_entry: bool,
}

impl<'a, K: Hash + Eq, S: BuildHasher> UpgradableKeyGuard<'a, K, S> {
    /// The key this guard holds locked.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Whether the guard currently holds the write side of the lock.
    pub fn is_upgraded(&self) -> bool {
        matches!(self.state, UpgradableState::Upgraded(_))
    }

    /// Atomically exchange the upgradeable read lock for the write lock.
    ///
    /// Suspends until every plain reader has left. The signal is honoured
    /// before the exchange begins; once in flight the upgrade runs to
    /// completion, since abandoning it would forfeit the upgradeable slot.
    ///
    /// Dropping the returned guard downgrades back to the upgradeable
    /// read state.
    pub async fn upgrade(
        &mut self,
        cancel: CancellationToken,
    ) -> WaitResult<UpgradedKeyGuard<'_, 'a, K, S>> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let read = match std::mem::replace(&mut self.state, UpgradableState::Released) {
            UpgradableState::Reading(read) => read,
            // The nested guard's exclusive borrow rules out the upgraded
            // state here.
            UpgradableState::Upgraded(_) => {
                unreachable!("upgrade while the upgraded guard is live")
            }
            UpgradableState::Released => {
                panic!("upgrade on a guard whose lock was relinquished by an abandoned upgrade")
            }
        };
        let write = RwLockUpgradableReadGuardArc::upgrade(read).await;
        self.state = UpgradableState::Upgraded(write);
        Ok(UpgradedKeyGuard { owner: self })
    }

    /// Release the lock ahead of drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        // Drop whichever side of the lock is held before returning the
        // entry reference.
        self.state = UpgradableState::Released;
        if std::mem::replace(&mut self.holds_entry, false) {
            self.map.registry.release(&self.key);
        }
    }
}

impl<K: Hash + Eq, S: BuildHasher> Drop for UpgradableKeyGuard<'_, K, S> {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl<K: Hash + Eq + fmt::Debug, S: BuildHasher> fmt::Debug for UpgradableKeyGuard<'_, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradableKeyGuard")
            .field("key", &self.key)
            .field("upgraded", &self.is_upgraded())
            .finish()
    }
}

/// Scoped holder of the upgraded (write) state of an upgradeable guard.
///
/// Dropping it downgrades back to the upgradeable read lock; the map
/// entry stays checked out by the outer guard throughout.
#[must_use = "the write lock downgrades as soon as the guard is dropped"]
pub struct UpgradedKeyGuard<'g, 'a, K: Hash + Eq, S: BuildHasher> {
    owner: &'g mut UpgradableKeyGuard<'a, K, S>,
}

impl<K: Hash + Eq, S: BuildHasher> UpgradedKeyGuard<'_, '_, K, S> {
    /// The key this guard holds the write lock on.
    pub fn key(&self) -> &K {
        &self.owner.key
    }

    /// Downgrade back to the upgradeable read lock ahead of drop.
    pub fn downgrade(self) {
        drop(self);
    }
}

impl<K: Hash + Eq, S: BuildHasher> Drop for UpgradedKeyGuard<'_, '_, K, S> {
    fn drop(&mut self) {
        if let UpgradableState::Upgraded(write) =
            std::mem::replace(&mut self.owner.state, UpgradableState::Released)
        {
            self.owner.state =
                UpgradableState::Reading(RwLockWriteGuardArc::downgrade_to_upgradable(write));
        }
    }
}

impl<K: Hash + Eq + fmt::Debug, S: BuildHasher> fmt::Debug for UpgradedKeyGuard<'_, '_, K, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradedKeyGuard")
            .field("key", &self.owner.key)
            .finish()
    }
}
