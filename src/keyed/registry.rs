// Reference-counted map of per-key primitives.

use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

/// One live map entry: the per-key primitive plus the number of
/// outstanding checkouts (lock holders and waiters together).
struct Entry<P> {
    primitive: Arc<P>,
    refs: usize,
}

/// On-demand map of per-key primitives with reference counting.
///
/// An entry exists exactly while at least one checkout is outstanding; the
/// last release removes it. The map mutex guards only lookup, insertion,
/// removal and the reference counts. Acquiring the per-key primitive never
/// happens under it, so a suspension on one key cannot stall operations on
/// another.
pub(crate) struct KeyedRegistry<K, P, S> {
    entries: Mutex<HashMap<K, Entry<P>, S>>,
}

impl<K, P, S> KeyedRegistry<K, P, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    pub(crate) fn with_hasher(hasher: S) -> Self {
        Self {
            entries: Mutex::new(HashMap::with_hasher(hasher)),
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Fetch the primitive for `key`, creating it on first use, and count
    /// one more outstanding reference.
    ///
    /// The reference is dropped again when the returned [`Checkout`] is
    /// dropped, unless [`Checkout::disarm`] transfers that responsibility
    /// to a scoped guard (which then calls [`release`] itself). Holding
    /// the checkout across the suspension on the primitive keeps the entry
    /// alive even if the acquiring future is dropped mid-wait.
    ///
    /// [`release`]: KeyedRegistry::release
    pub(crate) fn checkout<'a>(&'a self, key: &'a K) -> Checkout<'a, K, P, S>
    where
        K: Clone,
        P: Default,
    {
        let mut entries = self.entries.lock();
        let primitive = match entries.get_mut(key) {
            Some(entry) => {
                entry.refs += 1;
                entry.primitive.clone()
            }
            None => {
                let primitive = Arc::new(P::default());
                entries.insert(
                    key.clone(),
                    Entry {
                        primitive: primitive.clone(),
                        refs: 1,
                    },
                );
                trace!(entries = entries.len(), "keyed entry created");
                primitive
            }
        };
        Checkout {
            registry: self,
            key,
            primitive,
            armed: true,
        }
    }

    /// Drop one outstanding reference for `key`, removing the entry when
    /// the last one goes away.
    pub(crate) fn release(&self, key: &K) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            debug_assert!(false, "release without a matching checkout");
            return;
        };
        entry.refs -= 1;
        if entry.refs == 0 {
            entries.remove(key);
            trace!(entries = entries.len(), "keyed entry removed");
        }
    }
}

/// One outstanding reference on a registry entry.
///
/// Dropping the checkout returns the reference, so an acquisition that is
/// cancelled — or whose future is simply dropped — cannot leak an entry.
/// A successful acquisition disarms the checkout and hands the reference
/// to its scoped guard instead.
pub(crate) struct Checkout<'a, K: Hash + Eq, P, S: BuildHasher> {
    registry: &'a KeyedRegistry<K, P, S>,
    key: &'a K,
    primitive: Arc<P>,
    armed: bool,
}

impl<K: Hash + Eq, P, S: BuildHasher> Checkout<'_, K, P, S> {
    /// The per-key primitive this checkout references.
    pub(crate) fn primitive(&self) -> Arc<P> {
        self.primitive.clone()
    }

    /// Keep the reference past this checkout's lifetime; the caller's
    /// guard becomes responsible for the matching release.
    pub(crate) fn disarm(mut self) {
        self.armed = false;
    }
}

impl<K: Hash + Eq, P, S: BuildHasher> Drop for Checkout<'_, K, P, S> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release(self.key);
        }
    }
}
