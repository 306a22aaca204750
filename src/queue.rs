// Unbounded FIFO container with suspending dequeue.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{WaitError, WaitResult};
use crate::wait_queue::{await_resolution, Broadcast, WaitQueue};

/// An unbounded FIFO container whose dequeue suspends while it is empty.
///
/// Values enqueued while consumers are waiting are handed to the
/// longest-waiting consumer directly and never enter storage, so a stored
/// value and a waiting consumer cannot coexist.
pub struct Queue<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    items: VecDeque<T>,
    consumers: WaitQueue<T>,
}

impl<T> Queue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                consumers: WaitQueue::new(),
            }),
        }
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no value is stored.
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Number of consumers currently suspended on this queue.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Copy of the oldest value, without removing it.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().items.front().cloned()
    }

    /// Remove and return the oldest value, without suspending.
    pub fn try_dequeue(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Remove and return the oldest value, suspending while the queue is
    /// empty.
    ///
    /// Returns [`WaitError::Cancelled`] when `cancel` fires before a value
    /// was handed to this caller; a signal that fires after the handoff is
    /// ignored and the value is returned.
    pub async fn dequeue(&self, cancel: CancellationToken) -> WaitResult<T> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let (id, rx) = {
            let mut state = self.state.lock();
            if let Some(value) = state.items.pop_front() {
                return Ok(value);
            }
            state.consumers.push((), cancel.clone())
        };
        await_resolution(rx, cancel, || self.state.lock().consumers.remove(id)).await
    }

    /// Store a value, or hand it directly to the longest-waiting consumer.
    pub fn enqueue(&self, value: T) {
        let mut value = value;
        loop {
            let tx = {
                let mut state = self.state.lock();
                match state.consumers.pop() {
                    Some(((), tx)) => tx,
                    None => {
                        state.items.push_back(value);
                        return;
                    }
                }
            };
            // Handoff outside the critical section; a vanished consumer
            // returns the value for the next waiter or storage.
            match tx.send(value) {
                Ok(()) => return,
                Err(returned) => value = returned,
            }
        }
    }

    /// Resolve every currently-waiting consumer with a clone of `value`.
    ///
    /// Consumers arriving after this call suspend as usual. The waiters
    /// are resumed when the returned handle is dropped.
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
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Queue")
            .field("len", &state.items.len())
            .field("waiters", &state.consumers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> CancellationToken {
        CancellationToken::new()
    }

    #[tokio::test]
    async fn stored_values_dequeue_in_fifo_order() {
        let queue = Queue::new();
        for value in ["A", "B", "C"] {
            queue.enqueue(value);
        }

        assert_eq!(queue.dequeue(token()).await, Ok("A"));
        assert_eq!(queue.dequeue(token()).await, Ok("B"));
        assert_eq!(queue.dequeue(token()).await, Ok("C"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn waiting_consumers_are_served_in_arrival_order() {
        let queue = Queue::new();

        let mut first = Box::pin(queue.dequeue(token()));
        let mut second = Box::pin(queue.dequeue(token()));
        assert!(futures::future::poll_immediate(first.as_mut())
            .await
            .is_none());
        assert!(futures::future::poll_immediate(second.as_mut())
            .await
            .is_none());

        queue.enqueue("A");
        assert_eq!(first.await, Ok("A"));
        assert!(futures::future::poll_immediate(second.as_mut())
            .await
            .is_none());

        queue.enqueue("B");
        assert_eq!(second.await, Ok("B"));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn try_dequeue_preserves_order() {
        let queue = Queue::new();
        queue.enqueue(1);
        queue.enqueue(2);

        assert_eq!(queue.try_peek(), Some(1));
        assert_eq!(queue.try_dequeue(), Some(1));
        assert_eq!(queue.try_dequeue(), Some(2));
        assert_eq!(queue.try_dequeue(), None);
    }

    #[tokio::test]
    async fn abandoned_consumer_does_not_swallow_a_value() {
        let queue = Queue::new();

        // This consumer's future is dropped while it is still queued.
        {
            let mut abandoned = Box::pin(queue.dequeue(token()));
            assert!(futures::future::poll_immediate(abandoned.as_mut())
                .await
                .is_none());
        }
        let mut live = Box::pin(queue.dequeue(token()));
        assert!(futures::future::poll_immediate(live.as_mut())
            .await
            .is_none());

        queue.enqueue("A");
        assert_eq!(live.await, Ok("A"));
    }
}
