use crate::LockStoreError;

use thiserror::Error;

/// Errors that can occur when using a `LockManager`.
#[derive(Debug, Error)]
pub enum Error<E>
where
    E: LockStoreError,
{
    /// The key is already held by this manager. Release it before acquiring again.
    #[error("lock already held for key `{0}` by this manager; release it before re-acquiring")]
    AlreadyHeld(String),

    /// The key was never successfully locked by this manager.
    #[error("cannot release key `{0}`: it was never locked by this manager")]
    NotHeld(String),

    /// The underlying store failed.
    #[error("lock store error: {0}")]
    Store(#[source] E),
}

impl<E> Error<E>
where
    E: LockStoreError,
{
    /// Whether this error is caused by misuse of the manager API rather than
    /// by the store.
    #[must_use]
    pub const fn is_usage_error(&self) -> bool {
        matches!(self, Self::AlreadyHeld(_) | Self::NotHeld(_))
    }
}
