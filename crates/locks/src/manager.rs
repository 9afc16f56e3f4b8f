use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::namespace::Namespace;
use crate::value::LockValue;
use crate::{LockStatus, LockStore};

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

/// Logical TTL used when the caller has no better estimate of the work.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Shortest logical TTL accepted. Shorter requests are raised to this.
pub const MIN_TTL: Duration = Duration::from_secs(5);

/// Added to the logical TTL to get the store-level TTL, so the store only
/// collects keys nobody has come back for.
pub const STORE_TTL_MARGIN: Duration = Duration::from_secs(600);

/// Configuration for the `LockManager`.
#[derive(Clone, Debug)]
pub struct LockManagerConfig<S> {
    /// The store holding lock keys. Shared by every process taking part.
    pub store: S,

    /// Prefix (and logical database) partitioning the store between applications.
    pub namespace: Namespace,

    /// Clock used for logical expiry. Defaults to the system clock if not set.
    pub clock: Option<Arc<dyn Clock>>,
}

/// Acquires and releases single-attempt locks in one namespace of a store.
///
/// Each manager tracks the exact values it wrote. Only those can be released,
/// and only while the store still holds them, so a late release never
/// deletes a lock someone else has since taken over.
pub struct LockManager<S>
where
    S: LockStore,
{
    store: S,
    namespace: Namespace,
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<String, String>>,
}

impl<S> LockManager<S>
where
    S: LockStore,
{
    /// Creates a new instance of `LockManager`.
    #[must_use]
    pub fn new(
        LockManagerConfig {
            store,
            namespace,
            clock,
        }: LockManagerConfig<S>,
    ) -> Self {
        Self {
            store,
            namespace,
            clock: clock.unwrap_or_else(|| Arc::new(SystemClock) as Arc<dyn Clock>),
            held: Mutex::new(HashMap::new()),
        }
    }

    /// The namespace this manager prefixes keys with.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// The underlying store.
    #[must_use]
    pub const fn store(&self) -> &S {
        &self.store
    }

    /// Makes a single attempt to acquire the lock on `key`.
    ///
    /// If the key is held by someone else but its logical expiry has passed,
    /// the stale value is deleted and acquisition is retried once. Returns
    /// `Ok(false)` when the lock is busy or the takeover race was lost.
    ///
    /// Without an `owner` a random one is generated. `ttl` is the logical
    /// lifetime of the lock and is raised to at least [`MIN_TTL`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::AlreadyHeld`] if this manager already holds `key`, or
    /// [`Error::Store`] if the store fails.
    #[instrument(skip(self), fields(prefix = %self.namespace.prefix()))]
    pub async fn acquire(
        &self,
        key: &str,
        owner: Option<&str>,
        ttl: Duration,
    ) -> Result<bool, Error<S::Error>> {
        let lock_key = self.namespace.key(key);
        let mut held = self.held.lock().await;

        if held.contains_key(&lock_key) {
            return Err(Error::AlreadyHeld(key.to_string()));
        }

        let ttl = ttl.max(MIN_TTL);
        let owner = owner
            .filter(|owner| !owner.is_empty())
            .map_or_else(|| fastrand::u32(..).to_string(), ToString::to_string);

        if let Some(value) = self.add(&lock_key, &owner, ttl).await? {
            held.insert(lock_key, value);
            return Ok(true);
        }

        if !self.remove_if_stale(&lock_key).await? {
            return Ok(false);
        }

        match self.add(&lock_key, &owner, ttl).await? {
            Some(value) => {
                info!(key = %lock_key, owner = %owner, "Lock acquired after taking over stale lock.");
                held.insert(lock_key, value);
                Ok(true)
            }
            None => {
                debug!(key = %lock_key, "Stale lock removed but another acquirer won the race.");
                Ok(false)
            }
        }
    }

    /// Makes a single attempt to acquire `key` with a random owner and the
    /// default TTL.
    ///
    /// # Errors
    ///
    /// See [`LockManager::acquire`].
    pub async fn try_lock(&self, key: &str) -> Result<bool, Error<S::Error>> {
        self.acquire(key, None, DEFAULT_TTL).await
    }

    /// Releases a lock acquired by this manager.
    ///
    /// Returns `Ok(true)` if the store entry was deleted and `Ok(false)` if
    /// the lock had already been taken over, in which case the store is left
    /// untouched. Either way this manager stops tracking the key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotHeld`] if this manager never acquired `key`, or
    /// [`Error::Store`] if the store fails. After a store failure the key is
    /// still tracked and the release may be retried.
    #[instrument(skip(self), fields(prefix = %self.namespace.prefix()))]
    pub async fn release(&self, key: &str) -> Result<bool, Error<S::Error>> {
        let lock_key = self.namespace.key(key);
        let mut held = self.held.lock().await;

        let Some(value) = held.get(&lock_key) else {
            return Err(Error::NotHeld(key.to_string()));
        };

        let deleted = self
            .store
            .compare_and_delete(&lock_key, value)
            .await
            .map_err(Error::Store)?;

        held.remove(&lock_key);

        if deleted {
            debug!(key = %lock_key, "Lock released.");
        } else {
            warn!(key = %lock_key, "Lock was taken over before release; leaving the new holder's value in place.");
        }

        Ok(deleted)
    }

    /// Releases every lock this manager holds and forgets all of them.
    ///
    /// Keys that were taken over or could not be deleted are logged and
    /// skipped so they never block the rest.
    #[instrument(skip(self), fields(prefix = %self.namespace.prefix()))]
    pub async fn release_all(&self) {
        let held = std::mem::take(&mut *self.held.lock().await);

        for (lock_key, value) in held {
            match self.store.compare_and_delete(&lock_key, &value).await {
                Ok(true) => debug!(key = %lock_key, "Lock released."),
                Ok(false) => {
                    warn!(key = %lock_key, "Lock was taken over before release; skipping.");
                }
                Err(e) => warn!(key = %lock_key, error = %e, "Failed to release lock; skipping."),
            }
        }
    }

    /// Checks the status of a lock in the store.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] if the store fails.
    #[instrument(skip(self), fields(prefix = %self.namespace.prefix()))]
    pub async fn check(&self, key: &str) -> Result<LockStatus, Error<S::Error>> {
        let lock_key = self.namespace.key(key);

        let Some(current) = self.store.get(&lock_key).await.map_err(Error::Store)? else {
            return Ok(LockStatus::Free);
        };

        if self.held.lock().await.get(&lock_key) == Some(&current) {
            return Ok(LockStatus::HeldBySelf);
        }

        Ok(match current.parse::<LockValue>() {
            Ok(value) if value.is_expired(self.clock.now()) => LockStatus::Stale(value.owner),
            Ok(value) => LockStatus::HeldByOther(value.owner),
            Err(_) => LockStatus::HeldByOther(current),
        })
    }

    /// Whether this manager currently tracks `key` as held.
    pub async fn is_held(&self, key: &str) -> bool {
        self.held
            .lock()
            .await
            .contains_key(&self.namespace.key(key))
    }

    /// The keys this manager currently tracks as held, without prefix.
    pub async fn held_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self
            .held
            .lock()
            .await
            .keys()
            .map(|lock_key| self.namespace.strip(lock_key).to_string())
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Writes a fresh lock value if the key is absent. Returns the written
    /// value on success.
    async fn add(
        &self,
        lock_key: &str,
        owner: &str,
        ttl: Duration,
    ) -> Result<Option<String>, Error<S::Error>> {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let value = LockValue::new(owner, self.clock.now(), ttl_secs).to_string();

        let written = self
            .store
            .set_if_absent(lock_key, &value)
            .await
            .map_err(Error::Store)?;

        if !written {
            return Ok(None);
        }

        info!(key = %lock_key, owner = %owner, value = %value, "Lock acquired via set-if-absent.");

        // The lock is ours regardless; the store TTL only collects orphans.
        if let Err(e) = self
            .store
            .set_expiry(lock_key, ttl.saturating_add(STORE_TTL_MARGIN))
            .await
        {
            warn!(key = %lock_key, error = %e, "Failed to set store-level TTL on acquired lock.");
        }

        Ok(Some(value))
    }

    /// Deletes the current value of `lock_key` if it is logically expired.
    /// Returns whether it was deleted.
    async fn remove_if_stale(&self, lock_key: &str) -> Result<bool, Error<S::Error>> {
        let Some(current) = self.store.get(lock_key).await.map_err(Error::Store)? else {
            debug!(key = %lock_key, "set-if-absent failed, but subsequent get found no key. Race condition?");
            return Ok(false);
        };

        let Some(expires_at) = LockValue::parse_expiry(&current) else {
            warn!(key = %lock_key, value = %current, "Unparseable lock value; treating lock as held.");
            return Ok(false);
        };

        if self.clock.now().timestamp() <= expires_at {
            debug!(key = %lock_key, value = %current, "Lock already held by another.");
            return Ok(false);
        }

        let deleted = self
            .store
            .compare_and_delete(lock_key, &current)
            .await
            .map_err(Error::Store)?;

        if deleted {
            debug!(key = %lock_key, value = %current, "Deleted stale lock.");
        } else {
            debug!(key = %lock_key, value = %current, "Stale lock changed before it could be deleted.");
        }

        Ok(deleted)
    }
}

impl<S> fmt::Debug for LockManager<S>
where
    S: LockStore,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockManager")
            .field("namespace", &self.namespace)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LockStoreError, ManualClock};

    use std::sync::atomic::{AtomicBool, Ordering};

    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use chrono::{TimeDelta, TimeZone, Utc};
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("store unavailable")]
    struct Unavailable;

    impl LockStoreError for Unavailable {}

    /// Store with switchable failures, recording the TTLs it was asked to set.
    ///
    /// `write_before_delete` and `write_after_delete` stand in for another
    /// process writing the key around the next compare-and-delete.
    #[derive(Debug, Default)]
    struct FaultyStore {
        values: parking_lot::Mutex<HashMap<String, String>>,
        expiries: parking_lot::Mutex<HashMap<String, Duration>>,
        fail_all: AtomicBool,
        fail_deletes: AtomicBool,
        fail_expiry: AtomicBool,
        write_before_delete: parking_lot::Mutex<Option<String>>,
        write_after_delete: parking_lot::Mutex<Option<String>>,
    }

    impl FaultyStore {
        fn check(&self, flag: &AtomicBool) -> Result<(), Unavailable> {
            if self.fail_all.load(Ordering::SeqCst) || flag.load(Ordering::SeqCst) {
                Err(Unavailable)
            } else {
                Ok(())
            }
        }

        fn value(&self, key: &str) -> Option<String> {
            self.values.lock().get(key).cloned()
        }
    }

    #[async_trait]
    impl LockStore for Arc<FaultyStore> {
        type Error = Unavailable;

        async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
            self.check(&self.fail_all)?;
            let mut values = self.values.lock();
            if values.contains_key(key) {
                return Ok(false);
            }
            values.insert(key.to_string(), value.to_string());
            Ok(true)
        }

        async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
            self.check(&self.fail_all)?;
            Ok(self.value(key))
        }

        async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), Self::Error> {
            self.check(&self.fail_expiry)?;
            self.expiries.lock().insert(key.to_string(), ttl);
            Ok(())
        }

        async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, Self::Error> {
            self.check(&self.fail_deletes)?;
            let mut values = self.values.lock();
            if let Some(value) = self.write_before_delete.lock().take() {
                values.insert(key.to_string(), value);
            }
            if values.get(key).map(String::as_str) == Some(expected) {
                values.remove(key);
                if let Some(value) = self.write_after_delete.lock().take() {
                    values.insert(key.to_string(), value);
                }
                return Ok(true);
            }
            Ok(false)
        }
    }

    fn start() -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn manager(store: &Arc<FaultyStore>, clock: &ManualClock) -> LockManager<Arc<FaultyStore>> {
        LockManager::new(LockManagerConfig {
            store: store.clone(),
            namespace: Namespace::with_prefix("test:"),
            clock: Some(Arc::new(clock.clone())),
        })
    }

    #[tokio::test]
    async fn test_ttl_floor_and_store_ttl_margin() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.acquire("k", Some("bob"), Duration::from_secs(2)).await.unwrap());

        let value: LockValue = store.value("test:k").unwrap().parse().unwrap();
        assert_eq!(value.expires_at, start().timestamp() + 5);
        assert_eq!(value.owner, "bob");
        assert_eq!(
            store.expiries.lock().get("test:k"),
            Some(&Duration::from_secs(605))
        );
    }

    #[tokio::test]
    async fn test_store_ttl_exceeds_logical_ttl() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.try_lock("k").await.unwrap());

        let value: LockValue = store.value("test:k").unwrap().parse().unwrap();
        let logical = u64::try_from(value.expires_at - start().timestamp()).unwrap();
        let store_ttl = store.expiries.lock()["test:k"];
        assert_eq!(logical, DEFAULT_TTL.as_secs());
        assert!(store_ttl.as_secs() > logical);
    }

    #[tokio::test]
    async fn test_random_owner_when_omitted() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.acquire("k", Some(""), DEFAULT_TTL).await.unwrap());

        let value: LockValue = store.value("test:k").unwrap().parse().unwrap();
        assert!(value.owner.parse::<u32>().is_ok());
    }

    #[tokio::test]
    async fn test_failed_store_ttl_keeps_lock() {
        let store = Arc::new(FaultyStore::default());
        store.fail_expiry.store(true, Ordering::SeqCst);
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.try_lock("k").await.unwrap());
        assert!(manager.is_held("k").await);
        assert!(store.expiries.lock().is_empty());
    }

    #[tokio::test]
    async fn test_unavailable_store_is_an_error_not_contention() {
        let store = Arc::new(FaultyStore::default());
        store.fail_all.store(true, Ordering::SeqCst);
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert_matches!(manager.try_lock("k").await, Err(Error::Store(Unavailable)));
        assert!(!manager.is_held("k").await);
    }

    #[tokio::test]
    async fn test_unparseable_value_is_treated_as_held() {
        let store = Arc::new(FaultyStore::default());
        store
            .values
            .lock()
            .insert("test:k".to_string(), "garbage".to_string());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(!manager.try_lock("k").await.unwrap());
        assert_eq!(store.value("test:k").as_deref(), Some("garbage"));
        assert_eq!(
            manager.check("k").await.unwrap(),
            LockStatus::HeldByOther("garbage".to_string())
        );
    }

    #[tokio::test]
    async fn test_takeover_loses_when_retry_is_beaten() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let crashed = manager(&store, &clock);
        let contender = manager(&store, &clock);

        assert!(crashed.acquire("k", Some("crashed"), MIN_TTL).await.unwrap());
        clock.advance(TimeDelta::seconds(30));

        let winner = LockValue::new("winner", clock.now(), 120).to_string();
        *store.write_after_delete.lock() = Some(winner.clone());

        assert!(!contender.acquire("k", Some("loser"), DEFAULT_TTL).await.unwrap());
        assert!(!contender.is_held("k").await);
        assert_eq!(store.value("test:k"), Some(winner));
    }

    #[tokio::test]
    async fn test_takeover_skips_stale_value_that_changed() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let crashed = manager(&store, &clock);
        let contender = manager(&store, &clock);

        assert!(crashed.acquire("k", Some("crashed"), MIN_TTL).await.unwrap());
        clock.advance(TimeDelta::seconds(30));

        let refreshed = LockValue::new("other", clock.now(), 120).to_string();
        *store.write_before_delete.lock() = Some(refreshed.clone());

        assert!(!contender.acquire("k", Some("loser"), DEFAULT_TTL).await.unwrap());
        assert!(!contender.is_held("k").await);
        assert_eq!(store.value("test:k"), Some(refreshed));
    }

    #[tokio::test]
    async fn test_release_failure_keeps_key_for_retry() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.try_lock("k").await.unwrap());

        store.fail_deletes.store(true, Ordering::SeqCst);
        assert_matches!(manager.release("k").await, Err(Error::Store(_)));
        assert!(manager.is_held("k").await);

        store.fail_deletes.store(false, Ordering::SeqCst);
        assert!(manager.release("k").await.unwrap());
        assert!(!manager.is_held("k").await);
        assert_eq!(store.value("test:k"), None);
    }

    #[tokio::test]
    async fn test_release_all_swallows_store_failures() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.try_lock("a").await.unwrap());
        assert!(manager.try_lock("b").await.unwrap());

        store.fail_deletes.store(true, Ordering::SeqCst);
        manager.release_all().await;

        assert!(manager.held_keys().await.is_empty());
        // Left for the store TTL to collect.
        assert!(store.value("test:a").is_some());
        assert!(store.value("test:b").is_some());
    }

    #[tokio::test]
    async fn test_check_reports_each_status() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let first = manager(&store, &clock);
        let second = manager(&store, &clock);

        assert_eq!(first.check("k").await.unwrap(), LockStatus::Free);

        assert!(first.acquire("k", Some("alice"), MIN_TTL).await.unwrap());
        assert_eq!(first.check("k").await.unwrap(), LockStatus::HeldBySelf);
        assert_eq!(
            second.check("k").await.unwrap(),
            LockStatus::HeldByOther("alice".to_string())
        );

        clock.advance(TimeDelta::seconds(6));
        assert_eq!(
            second.check("k").await.unwrap(),
            LockStatus::Stale("alice".to_string())
        );
    }

    #[tokio::test]
    async fn test_held_keys_are_unprefixed_and_sorted() {
        let store = Arc::new(FaultyStore::default());
        let clock = ManualClock::new(start());
        let manager = manager(&store, &clock);

        assert!(manager.try_lock("b").await.unwrap());
        assert!(manager.try_lock("a").await.unwrap());

        assert_eq!(manager.held_keys().await, vec!["a", "b"]);
    }
}
