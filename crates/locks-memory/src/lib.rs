//! In-memory (single process) lock store for tests and local development.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use latchkey_locks::LockStore;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

#[derive(Clone, Debug)]
struct Entry {
    value: String,
    deadline: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.deadline.is_none_or(|deadline| now < deadline)
    }
}

/// In-memory lock store.
///
/// Clones share the same map, so several managers built from clones of one
/// store contend exactly like processes sharing a real store.
#[derive(Clone, Debug, Default)]
pub struct MemoryLockStore {
    map: Arc<Mutex<HashMap<String, Entry>>>,
}

impl MemoryLockStore {
    /// Creates a new instance of `MemoryLockStore`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Unconditionally writes `value` under `key`, clearing any store TTL.
    ///
    /// Stands in for another process overwriting a lock.
    pub async fn put(&self, key: impl Into<String>, value: impl Into<String>) {
        self.map.lock().await.insert(
            key.into(),
            Entry {
                value: value.into(),
                deadline: None,
            },
        );
    }

    /// Remaining store-level TTL of `key`, if it exists and has one.
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.map
            .lock()
            .await
            .get(key)
            .filter(|entry| entry.is_live(now))
            .and_then(|entry| entry.deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    /// Keys currently stored, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .map
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.is_live(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort_unstable();
        keys
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    type Error = Error;

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        let now = Instant::now();
        let mut map = self.map.lock().await;

        if map.get(key).is_some_and(|entry| entry.is_live(now)) {
            return Ok(false);
        }

        map.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                deadline: None,
            },
        );

        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let now = Instant::now();
        let map = self.map.lock().await;

        Ok(map
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), Self::Error> {
        let now = Instant::now();
        let mut map = self.map.lock().await;

        match map.get_mut(key).filter(|entry| entry.is_live(now)) {
            // A deadline past what `Instant` can represent never arrives.
            Some(entry) => entry.deadline = now.checked_add(ttl),
            None => trace!(key, "set_expiry on missing key ignored"),
        }

        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, Self::Error> {
        let now = Instant::now();
        let mut map = self.map.lock().await;

        let matches = map
            .get(key)
            .is_some_and(|entry| entry.is_live(now) && entry.value == expected);

        if matches {
            map.remove(key);
        }

        Ok(matches)
    }
}
