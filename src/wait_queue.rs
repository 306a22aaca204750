// FIFO wait queue for suspended callers.
//
// This module provides the waiter registry shared by the container
// primitives: a FIFO of single-shot suspension points that is always
// manipulated while the owning container's mutex is held, with waiter
// resumption deferred until after that mutex is released.

use std::collections::VecDeque;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{WaitError, WaitResult};

/// Identifier of a waiter entry, unique within one queue.
pub(crate) type WaiterId = u64;

/// A single suspended caller.
///
/// `payload` travels with the entry (the pending value of a suspended
/// producer); `tx` is the single-shot channel resolving the caller's
/// future. The entry keeps a handle on the caller's cancellation signal so
/// matching paths can observe a cancellation that has not yet been swept.
struct Waiter<V, P> {
    id: WaiterId,
    payload: P,
    cancel: CancellationToken,
    tx: oneshot::Sender<V>,
}

impl<V, P> Waiter<V, P> {
    /// An entry is live while its caller is still suspended on it: the
    /// signal has not fired and the receiving future has not been dropped.
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled() && !self.tx.is_closed()
    }
}

/// A FIFO registry of suspended callers awaiting a `V`.
///
/// The queue performs no locking of its own. Entries that are no longer
/// live are logically absent: the length predicates skip them and the
/// matching paths prune them, which resolves their callers as cancelled.
pub(crate) struct WaitQueue<V, P = ()> {
    entries: VecDeque<Waiter<V, P>>,
    next_id: WaiterId,
}

impl<V, P> WaitQueue<V, P> {
    pub(crate) fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            next_id: 0,
        }
    }

    /// Number of live entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.iter().filter(|w| w.is_live()).count()
    }

    /// Whether any live entry is present.
    pub(crate) fn is_empty(&self) -> bool {
        !self.entries.iter().any(|w| w.is_live())
    }

    /// Append a new waiter carrying `payload`, observing `cancel`.
    ///
    /// Returns the entry id (for cancellation-side removal) and the
    /// receiving half the caller suspends on.
    pub(crate) fn push(
        &mut self,
        payload: P,
        cancel: CancellationToken,
    ) -> (WaiterId, oneshot::Receiver<V>) {
        let id = self.next_id;
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Waiter {
            id,
            payload,
            cancel,
            tx,
        });
        (id, rx)
    }

    /// Remove the entry `id` if it is still queued.
    ///
    /// Returns false when a counterpart already claimed the entry, in which
    /// case the caller's resolution is in flight and cancellation must not
    /// be reported.
    pub(crate) fn remove(&mut self, id: WaiterId) -> bool {
        match self.entries.iter().position(|w| w.id == id) {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Pop the oldest live waiter.
    ///
    /// Dead entries encountered on the way are pruned; dropping their
    /// senders resolves the corresponding callers as cancelled.
    pub(crate) fn pop(&mut self) -> Option<(P, oneshot::Sender<V>)> {
        while let Some(waiter) = self.entries.pop_front() {
            if waiter.is_live() {
                return Some((waiter.payload, waiter.tx));
            }
        }
        None
    }

    /// Drain every live waiter, to be resolved with a clone of `value` when
    /// the returned handle is dropped. Dead entries are pruned.
    pub(crate) fn drain_complete(&mut self, value: &V) -> Broadcast<V>
    where
        V: Clone,
    {
        let resolved = self
            .entries
            .drain(..)
            .filter(Waiter::is_live)
            .map(|w| (w.tx, value.clone()))
            .collect();
        Broadcast {
            resolved,
            cancelled: Vec::new(),
        }
    }

    /// Drain every live waiter, to be resolved as cancelled when the
    /// returned handle is dropped. Dead entries are pruned.
    pub(crate) fn drain_cancel(&mut self) -> Broadcast<V> {
        let cancelled = self
            .entries
            .drain(..)
            .filter(Waiter::is_live)
            .map(|w| w.tx)
            .collect();
        Broadcast {
            resolved: Vec::new(),
            cancelled,
        }
    }
}

/// Deferred resumption of a drained set of waiters.
///
/// Broadcast operations remove every waiter while the container mutex is
/// held but must not resume them inside the critical section. The drained
/// waiters ride in this handle; dropping it (or calling
/// [`resume`](Broadcast::resume)) delivers the outcome to each waiter in
/// FIFO order.
#[must_use = "waiters are only resumed once the handle is dropped"]
pub struct Broadcast<V> {
    resolved: Vec<(oneshot::Sender<V>, V)>,
    cancelled: Vec<oneshot::Sender<V>>,
}

impl<V> Broadcast<V> {
    pub(crate) fn from_resolved(resolved: Vec<(oneshot::Sender<V>, V)>) -> Self {
        Self {
            resolved,
            cancelled: Vec::new(),
        }
    }

    /// Number of waiters this handle will resume.
    pub fn waiter_count(&self) -> usize {
        self.resolved.len() + self.cancelled.len()
    }

    /// Deliver the outcome to every drained waiter now.
    pub fn resume(self) {
        drop(self);
    }
}

impl<V> Drop for Broadcast<V> {
    fn drop(&mut self) {
        for (tx, value) in self.resolved.drain(..) {
            // A waiter that vanished between drain and resumption simply
            // drops the value.
            let _ = tx.send(value);
        }
        // Dropping the remaining senders resolves their callers as
        // cancelled.
        self.cancelled.clear();
    }
}

impl<V> std::fmt::Debug for Broadcast<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcast")
            .field("waiter_count", &self.waiter_count())
            .finish()
    }
}

/// Suspend on `rx` until a counterpart resolves the entry, honouring
/// `cancel`.
///
/// `unregister` re-enters the owning container's mutex and removes the
/// entry by id, reporting whether it was still queued. Losing the race to a
/// counterpart means the operation already succeeded, so the in-flight
/// resolution is awaited and returned even when the signal fired first.
pub(crate) async fn await_resolution<V>(
    mut rx: oneshot::Receiver<V>,
    cancel: CancellationToken,
    unregister: impl FnOnce() -> bool,
) -> WaitResult<V> {
    let raced = tokio::select! {
        biased;
        outcome = &mut rx => Some(outcome),
        _ = cancel.cancelled() => None,
    };
    match raced {
        Some(outcome) => outcome.map_err(|_| WaitError::Cancelled),
        None => {
            if unregister() {
                Err(WaitError::Cancelled)
            } else {
                rx.await.map_err(|_| WaitError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn waiters_resolve_in_fifo_order() {
        let mut queue: WaitQueue<u32> = WaitQueue::new();

        let (_, rx1) = queue.push((), token());
        let (_, rx2) = queue.push((), token());

        let ((), tx) = queue.pop().expect("first waiter");
        tx.send(1).unwrap();
        let ((), tx) = queue.pop().expect("second waiter");
        tx.send(2).unwrap();

        assert_eq!(rx1.await.unwrap(), 1);
        assert_eq!(rx2.await.unwrap(), 2);
        assert!(queue.pop().is_none());
    }

    #[tokio::test]
    async fn cancelled_entries_are_skipped_and_pruned() {
        let mut queue: WaitQueue<u32> = WaitQueue::new();

        let first = token();
        let (_, rx1) = queue.push((), first.clone());
        let (_, rx2) = queue.push((), token());

        first.cancel();
        assert_eq!(queue.len(), 1);

        // The cancelled entry is pruned; its caller resolves as cancelled.
        let ((), tx) = queue.pop().expect("live waiter");
        tx.send(7).unwrap();
        assert!(rx1.await.is_err());
        assert_eq!(rx2.await.unwrap(), 7);
    }

    #[test]
    fn remove_reports_whether_the_entry_was_queued() {
        let mut queue: WaitQueue<u32> = WaitQueue::new();

        let (id, _rx) = queue.push((), token());
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
    }

    #[tokio::test]
    async fn dropping_a_broadcast_resolves_every_waiter() {
        let mut queue: WaitQueue<&'static str> = WaitQueue::new();

        let (_, rx1) = queue.push((), token());
        let (_, rx2) = queue.push((), token());

        let broadcast = queue.drain_complete(&"X");
        assert_eq!(broadcast.waiter_count(), 2);
        assert!(queue.is_empty());

        broadcast.resume();
        assert_eq!(rx1.await.unwrap(), "X");
        assert_eq!(rx2.await.unwrap(), "X");
    }

    #[tokio::test]
    async fn cancel_broadcast_resolves_waiters_as_cancelled() {
        let mut queue: WaitQueue<u32> = WaitQueue::new();

        let (_, rx) = queue.push((), token());
        queue.drain_cancel().resume();
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn broadcasts_count_only_live_waiters() {
        let mut queue: WaitQueue<u32> = WaitQueue::new();

        let dead = token();
        let (_, rx_dead) = queue.push((), dead.clone());
        let (_, rx_live) = queue.push((), token());
        dead.cancel();

        let broadcast = queue.drain_cancel();
        assert_eq!(broadcast.waiter_count(), 1);
        broadcast.resume();

        // Pruned or drained, every caller still resolves as cancelled.
        assert!(rx_dead.await.is_err());
        assert!(rx_live.await.is_err());
    }

    #[tokio::test]
    async fn resolution_beats_a_simultaneous_cancellation() {
        let mut queue: WaitQueue<u32> = WaitQueue::new();
        let cancel = token();
        let (id, rx) = queue.push((), cancel.clone());

        let ((), tx) = queue.pop().unwrap();
        tx.send(42).unwrap();
        cancel.cancel();

        let result = await_resolution(rx, cancel, || queue.remove(id)).await;
        assert_eq!(result, Ok(42));
    }
}
