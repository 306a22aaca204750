// Error types for the coordination primitives.

use thiserror::Error;

/// Error returned by a suspending operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum WaitError {
    /// The operation's cancellation signal fired before a value (or the
    /// lock) was obtained.
    ///
    /// A signal that fires after the operation was already matched with a
    /// counterpart is ignored; the operation succeeds.
    #[error("operation cancelled before completion")]
    Cancelled,
}

/// Result alias for suspending operations.
pub type WaitResult<T> = Result<T, WaitError>;
