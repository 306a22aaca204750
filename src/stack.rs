// Unbounded LIFO container with suspending pop.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{WaitError, WaitResult};
use crate::wait_queue::{await_resolution, Broadcast, WaitQueue};

/// An unbounded LIFO container whose pop suspends while it is empty.
///
/// Values pushed while poppers are waiting are handed to the
/// longest-waiting popper directly and never enter storage, so a stored
/// value and a waiting popper cannot coexist. Stored values come back in
/// LIFO order; waiting poppers are served in FIFO order of arrival.
pub struct Stack<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    items: Vec<T>,
    poppers: WaitQueue<T>,
}

impl<T> Stack<T> {
    /// Create an empty stack.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: Vec::new(),
                poppers: WaitQueue::new(),
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

    /// Number of poppers currently suspended on this stack.
    pub fn waiter_count(&self) -> usize {
        self.state.lock().poppers.len()
    }

    /// Copy of the top value, without removing it.
    pub fn try_peek(&self) -> Option<T>
    where
        T: Clone,
    {
        self.state.lock().items.last().cloned()
    }

    /// Remove and return the top value, without suspending.
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop()
    }

    /// Remove and return the top value, suspending while the stack is
    /// empty.
    ///
    /// Returns [`WaitError::Cancelled`] when `cancel` fires before a value
    /// was handed to this caller; a signal that fires after the handoff is
    /// ignored and the value is returned.
    pub async fn pop(&self, cancel: CancellationToken) -> WaitResult<T> {
        if cancel.is_cancelled() {
            return Err(WaitError::Cancelled);
        }
        let (id, rx) = {
            let mut state = self.state.lock();
            if let Some(value) = state.items.pop() {
                return Ok(value);
            }
            state.poppers.push((), cancel.clone())
        };
        await_resolution(rx, cancel, || self.state.lock().poppers.remove(id)).await
    }

    /// Store a value, or hand it directly to the longest-waiting popper.
    pub fn push(&self, value: T) {
        let mut value = value;
        loop {
            let tx = {
                let mut state = self.state.lock();
                match state.poppers.pop() {
                    Some(((), tx)) => tx,
                    None => {
                        state.items.push(value);
                        return;
                    }
                }
            };
            // The handoff happens outside the critical section. A popper
            // that vanished in the meantime returns the value, and the
            // next waiter (or storage) takes it.
            match tx.send(value) {
                Ok(()) => return,
                Err(returned) => value = returned,
            }
        }
    }

    /// Resolve every currently-waiting popper with a clone of `value`.
    ///
    /// Poppers arriving after this call suspend as usual. The waiters are
    /// resumed when the returned handle is dropped.
    pub fn complete_all_pop(&self, value: T) -> Broadcast<T>
    where
        T: Clone,
    {
        let broadcast = self.state.lock().poppers.drain_complete(&value);
        trace!(waiters = broadcast.waiter_count(), "completing all poppers");
        broadcast
    }

    /// Resolve every currently-waiting popper as cancelled.
    pub fn cancel_all_pop(&self) -> Broadcast<T> {
        let broadcast = self.state.lock().poppers.drain_cancel();
        trace!(waiters = broadcast.waiter_count(), "cancelling all poppers");
        broadcast
    }
}

impl<T> Default for Stack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for Stack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Stack")
            .field("len", &state.items.len())
            .field("waiters", &state.poppers.len())
            .finish()
    }
}
