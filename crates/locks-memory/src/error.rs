use latchkey_locks::LockStoreError;
use thiserror::Error;

/// The in-memory store never fails; this only satisfies the `LockStore` contract.
#[derive(Clone, Debug, Error)]
#[error("memory lock store error")]
pub struct Error;

impl LockStoreError for Error {}
