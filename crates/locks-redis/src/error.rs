use latchkey_locks::LockStoreError;
use thiserror::Error;

/// Errors that can occur when using the Redis lock store.
#[derive(Error, Debug)]
pub enum Error {
    /// Connecting, authenticating or selecting the database failed.
    #[error("failed to connect to redis at {address}: {source}")]
    Connect {
        /// The `host:port` that was dialled.
        address: String,
        /// The underlying client error.
        source: redis::RedisError,
    },

    /// A command or script failed.
    #[error("redis command `{command}` failed: {source}")]
    Command {
        /// The command that failed.
        command: &'static str,
        /// The underlying client error.
        source: redis::RedisError,
    },

    /// The store configuration cannot be turned into a connection URL.
    #[error("invalid redis configuration: {0}")]
    InvalidConfig(String),

    /// Connecting took longer than the configured timeout.
    #[error("timed out connecting to redis at {0}")]
    Timeout(String),
}

impl LockStoreError for Error {}
