//! Redis implementation of the lock store.
//!
//! Set-if-absent is `SET key value NX` and the ownership-checked delete is a
//! Lua script, so both run atomically on the server.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod error;

pub use error::Error;

use std::time::Duration;

use async_trait::async_trait;
use latchkey_locks::{LockStore, Namespace};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, info, instrument};
use url::Url;

/// Deletes `KEYS[1]` only if it still holds `ARGV[1]`.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

/// Configuration for the `RedisLockStore`.
#[derive(Clone, Debug)]
pub struct RedisLockStoreConfig {
    /// Host of the Redis server.
    pub host: String,

    /// Port of the Redis server.
    pub port: u16,

    /// ACL username. Only needed together with `password` on Redis 6+.
    pub username: Option<String>,

    /// Password to authenticate with, if the server requires one.
    pub password: Option<String>,

    /// Logical database to select.
    pub database: u8,

    /// Timeout for establishing the connection. Defaults to 10 seconds if not set.
    pub connection_timeout: Option<Duration>,
}

impl Default for RedisLockStoreConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            username: None,
            password: None,
            database: 0,
            connection_timeout: None,
        }
    }
}

impl RedisLockStoreConfig {
    /// Selects the logical database of `namespace`.
    #[must_use]
    pub fn for_namespace(self, namespace: &Namespace) -> Self {
        Self {
            database: namespace.index(),
            ..self
        }
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Builds the `redis://` connection URL for this configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if the host or credentials cannot be
    /// represented in a URL.
    pub fn url(&self) -> Result<Url, Error> {
        let mut url = Url::parse(&format!("redis://{}/", self.address()))
            .map_err(|e| Error::InvalidConfig(format!("bad address {}: {e}", self.address())))?;

        if let Some(password) = &self.password {
            url.set_password(Some(password))
                .map_err(|()| Error::InvalidConfig("cannot set password".to_string()))?;
        }

        if let Some(username) = &self.username {
            url.set_username(username)
                .map_err(|()| Error::InvalidConfig("cannot set username".to_string()))?;
        }

        url.set_path(&self.database.to_string());

        Ok(url)
    }
}

/// A lock store backed by a single Redis server.
#[derive(Clone)]
pub struct RedisLockStore {
    address: String,
    connection: ConnectionManager,
    compare_and_delete_script: Script,
}

impl RedisLockStore {
    /// Connects to Redis, authenticates and selects the configured database.
    ///
    /// The connection is established eagerly so an unreachable server or bad
    /// credentials are reported here rather than as failed lock attempts.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Connect`] or [`Error::Timeout`] if the server cannot
    /// be reached or rejects the credentials, and [`Error::InvalidConfig`] if
    /// the configuration cannot be turned into a connection URL.
    #[instrument(skip(config), fields(host = %config.host, port = config.port, database = config.database))]
    pub async fn connect(config: RedisLockStoreConfig) -> Result<Self, Error> {
        let address = config.address();
        let url = config.url()?;

        let client = redis::Client::open(url.as_str()).map_err(|source| Error::Connect {
            address: address.clone(),
            source,
        })?;

        let timeout = config
            .connection_timeout
            .unwrap_or(Duration::from_secs(10));

        let connection = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| Error::Timeout(address.clone()))?
            .map_err(|source| Error::Connect {
                address: address.clone(),
                source,
            })?;

        info!(address = %address, database = config.database, "Connected to redis lock store.");

        Ok(Self {
            address,
            connection,
            compare_and_delete_script: Script::new(COMPARE_AND_DELETE),
        })
    }
}

impl std::fmt::Debug for RedisLockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisLockStore")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LockStore for RedisLockStore {
    type Error = Error;

    async fn set_if_absent(&self, key: &str, value: &str) -> Result<bool, Self::Error> {
        let mut connection = self.connection.clone();

        let written: bool = connection
            .set_nx(key, value)
            .await
            .map_err(|source| Error::Command {
                command: "SETNX",
                source,
            })?;

        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, Self::Error> {
        let mut connection = self.connection.clone();

        let value: Option<String> = connection
            .get(key)
            .await
            .map_err(|source| Error::Command {
                command: "GET",
                source,
            })?;

        Ok(value)
    }

    async fn set_expiry(&self, key: &str, ttl: Duration) -> Result<(), Self::Error> {
        let mut connection = self.connection.clone();
        let seconds = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);

        let applied: bool = connection
            .expire(key, seconds)
            .await
            .map_err(|source| Error::Command {
                command: "EXPIRE",
                source,
            })?;

        if !applied {
            debug!(key, "EXPIRE on missing key ignored");
        }

        Ok(())
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, Self::Error> {
        let mut connection = self.connection.clone();

        let deleted: i64 = self
            .compare_and_delete_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut connection)
            .await
            .map_err(|source| Error::Command {
                command: "EVALSHA",
                source,
            })?;

        Ok(deleted == 1)
    }
}
