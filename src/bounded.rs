// Bounded FIFO container with producer backpressure.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{WaitError, WaitResult};
use crate::wait_queue::{await_resolution, Broadcast, WaitQueue};

/// A FIFO container with a fixed capacity.
///
/// Dequeuing suspends while the queue is empty; enqueuing suspends while
/// it is full, with the suspended producer's pending value travelling with
/// its wait-queue entry. A dequeue that frees a slot moves the
/// longest-waiting producer's value into that slot within the same
/// critical section, so values become observable in FIFO order across
/// direct appends and resumed producers alike.
///
/// A capacity of zero yields a pure rendezvous queue: nothing is ever
/// stored, and each enqueue completes only by meeting a dequeue.
pub struct BoundedQueue<T> {
    capacity: usize,
    state: Mutex<State<T>>,
}

struct State<T> {
    items: VecDeque<T>,
    consumers: WaitQueue<T>,
    producers: WaitQueue<(), T>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue storing at most `capacity` values.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: Mutex::new(State {
                items: VecDeque::new(),
                consumers: WaitQueue::new(),
                producers: WaitQueue::new(),
            }),
        }
    }

    /// Maximum number of stored values.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no value is stored.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Whether the stored values have reached the capacity.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock();
        state.items.len() >= self.capacity
    }

    /// Number of consumers currently suspended on this queue.
    pub fn waiting_consumers(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Number of producers currently suspended on this queue.
    pub fn waiting_producers(&self) -> usize {
        self.state.lock().producers.len()
    }

    /// Copy of the oldest stored value, without removing it.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().items.front().cloned()
    }

    /// Remove and return the oldest value, without suspending.
    ///
    /// Returns `None` when nothing is observable: no stored value and no
    /// waiting producer to rendezvous with.
    pub fn try_dequeue(&self) -> Option<T> {
        let (value, admitted) = {
            let mut state = self.state.lock();
            match state.items.pop_front() {
                Some(value) => {
                    let admitted = Self::admit_producer(&mut state);
                    (value, admitted)
                }
                // With a positive capacity a waiting producer implies a
                // full queue, so this is the zero-capacity rendezvous.
                None => match state.producers.pop() {
                    Some((pending, tx)) => (pending, Some(tx)),
                    None => return None,
                },
            }
        };
        if let Some(tx) = admitted {
            let _ = tx.send(());
        }
        Some(value)
    }

    /// Remove and return the oldest value, suspending while nothing is
    /// observable.
    ///
    /// Returns [`WaitError::Cancelled`] when `cancel` fires before a value
    /// was handed to this caller.
    pub async fn dequeue(&self, cancel: CancellationToken) -> WaitResult<T> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let (id, rx) = {
            let mut state = self.state.lock();
            match state.items.pop_front() {
                Some(value) => {
                    let admitted = Self::admit_producer(&mut state);
                    drop(state);
                    if let Some(tx) = admitted {
                        let _ = tx.send(());
                    }
                    return Ok(value);
                }
                None => {
                    if let Some((pending, tx)) = state.producers.pop() {
                        drop(state);
                        let _ = tx.send(());
                        return Ok(pending);
                    }
                    state.consumers.push((), cancel.clone())
                }
            }
        };
        await_resolution(rx, cancel, || self.state.lock().consumers.remove(id)).await
    }

    /// Append a value, without suspending.
    ///
    /// Hands the value to the longest-waiting consumer if one is present,
    /// otherwise stores it if a slot is free. Returns false when the queue
    /// is full.
    pub fn try_enqueue(&self, value: T) -> bool {
        let mut value = value;
        loop {
            let tx = {
                let mut state = self.state.lock();
                match state.consumers.pop() {
                    Some(((), tx)) => tx,
                    None => {
                        if state.items.len() < self.capacity {
                            state.items.push_back(value);
                            return true;
                        }
                        return false;
                    }
                }
            };
            match tx.send(value) {
                Ok(()) => return true,
                Err(returned) => value = returned,
            }
        }
    }

    /// Append a value, suspending while the queue is full.
    ///
    /// Completes immediately when a consumer is waiting (the value is
    /// handed over directly) or a slot is free. Returns
    /// [`WaitError::Cancelled`] when `cancel` fires first; the pending
    /// value is forfeited in that case.
    pub async fn enqueue(&self, value: T, cancel: CancellationToken) -> WaitResult<()> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let mut value = value;
        let (id, rx) = loop {
            let tx = {
                let mut state = self.state.lock();
                match state.consumers.pop() {
                    Some(((), tx)) => tx,
                    None => {
                        if state.items.len() < self.capacity {
                            state.items.push_back(value);
                            return Ok(());
                        }
                        break state.producers.push(value, cancel.clone());
                    }
                }
            };
            match tx.send(value) {
                Ok(()) => return Ok(()),
                Err(returned) => value = returned,
            }
        };
        await_resolution(rx, cancel, || self.state.lock().producers.remove(id)).await
    }

    /// Move the longest-waiting producer's pending value into a freed
    /// slot. Returns the completion to fire once the mutex is released.
    fn admit_producer(state: &mut State<T>) -> Option<oneshot::Sender<()>> {
        let (pending, tx) = state.producers.pop()?;
        state.items.push_back(pending);
        Some(tx)
    }

    /// Resolve every currently-waiting consumer with a clone of `value`.
    ///
    /// The waiters are resumed when the returned handle is dropped.
    pub fn complete_all_dequeue(&self, value: T) -> Broadcast<T>
    where
        T: Clone,
    {
        let broadcast = self.state.lock().consumers.drain_complete(&value);
        trace!(waiters = broadcast.waiter_count(), "completing all consumers");
        broadcast
    }

    /// Resolve every currently-waiting consumer as cancelled.
    pub fn cancel_all_dequeue(&self) -> Broadcast<T> {
        let broadcast = self.state.lock().consumers.drain_cancel();
        trace!(waiters = broadcast.waiter_count(), "cancelling all consumers");
        broadcast
    }

    /// Flush every waiting producer's pending value into storage and
    /// resolve those producers as completed.
    ///
    /// Storage may transiently exceed the capacity; subsequent enqueues
    /// suspend until dequeues drain it back under the limit.
    pub fn complete_all_enqueue(&self) -> Broadcast<()> {
        let mut resolved = Vec::new();
        {
            let mut state = self.state.lock();
            while let Some((pending, tx)) = state.producers.pop() {
                state.items.push_back(pending);
                resolved.push((tx, ()));
            }
        }
        trace!(waiters = resolved.len(), "flushing all producers");
        Broadcast::from_resolved(resolved)
    }

    /// Resolve every currently-waiting producer as cancelled, discarding
    /// their pending values.
    pub fn cancel_all_enqueue(&self) -> Broadcast<()> {
        let broadcast = self.state.lock().producers.drain_cancel();
        trace!(waiters = broadcast.waiter_count(), "cancelling all producers");
        broadcast
    }
}

impl<T> std::fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity)
            .field("len", &state.items.len())
            .field("waiting_consumers", &state.consumers.len())
            .field("waiting_producers", &state.producers.len())
            .finish()
    }
}
