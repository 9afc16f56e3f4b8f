//! Single-attempt distributed locks on top of a shared key-value store.
//!
//! A [`LockManager`] writes lock values with an atomic set-if-absent, detects
//! logically expired locks left behind by other processes and takes them
//! over, and only ever deletes a key whose stored value is still the exact
//! value it wrote. Every manager remembers the locks it holds so they can be
//! released in bulk, and a [`LockScope`] lets the host release the locks of
//! every manager created during a unit of work at teardown.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod clock;
mod error;
mod manager;
mod namespace;
mod scope;
mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::Error;
pub use manager::{DEFAULT_TTL, LockManager, LockManagerConfig, MIN_TTL, STORE_TTL_MARGIN};
pub use namespace::{NAMESPACE_COUNT, Namespace};
pub use scope::{LockScope, ReleaseAll};
pub use value::{LockValue, ParseError, SEPARATOR};

use std::error::Error as StdError;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;

/// Marker trait for `LockStore` errors
pub trait LockStoreError: Debug + StdError + Send + Sync + 'static {}

/// Represents the current status of a lock, as seen by one manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    /// No value is stored under the key.
    Free,

    /// The lock is held by another owner, identified by the String.
    HeldByOther(String),

    /// The lock is held by the current manager.
    HeldBySelf,

    /// The stored value is past its logical expiry and may be taken over.
    Stale(String),
}

/// The storage capabilities the lock protocol needs from a key-value store.
///
/// `set_if_absent` and `compare_and_delete` must each be a single atomic
/// operation against the store. Mutual exclusion rests entirely on them.
#[async_trait]
pub trait LockStore: Send + Sync + 'static {
    /// The error type for store operations.
    type Error: LockStoreError;

    /// Writes `value` under `key` only if the key currently has no value.
    ///
    /// Returns `true` if the value was written.
    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error>;

    /// Reads the value currently stored under `key`.
    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error>;

    /// Sets the store-level expiry of `key`.
    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), Self::Error>;

    /// Deletes `key` only if its current value equals `expected`.
    ///
    /// Returns `true` if the key was deleted.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, Self::Error>;
}
