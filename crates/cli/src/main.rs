//! CLI binary to run commands under a latchkey lock.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use latchkey_locks::{
    LockManager, LockManagerConfig, LockScope, LockStatus, LockStore, LockValue, Namespace,
};
use latchkey_locks_redis::{RedisLockStore, RedisLockStoreConfig};
use tracing::{info, warn};

/// Exit code when the lock is busy (`EX_TEMPFAIL` from sysexits.h).
const EXIT_LOCK_BUSY: u8 = 75;

/// CLI-specific error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Lock protocol error
    #[error(transparent)]
    Lock(#[from] latchkey_locks::Error<latchkey_locks_redis::Error>),

    /// The command could not be started or awaited
    #[error("failed to run `{program}`: {source}")]
    Spawn {
        /// The program that was run.
        program: String,
        /// The underlying IO error.
        source: std::io::Error,
    },

    /// No command was given to run
    #[error("no command given")]
    NoCommand,

    /// Redis store error
    #[error(transparent)]
    Store(#[from] latchkey_locks_redis::Error),
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Redis host
    #[arg(long, default_value = "127.0.0.1", env = "LATCHKEY_REDIS_HOST")]
    redis_host: String,

    /// Redis port
    #[arg(long, default_value_t = 6379, env = "LATCHKEY_REDIS_PORT")]
    redis_port: u16,

    /// Redis ACL username
    #[arg(long, env = "LATCHKEY_REDIS_USERNAME")]
    redis_username: Option<String>,

    /// Redis password
    #[arg(long, env = "LATCHKEY_REDIS_PASSWORD", hide_env_values = true)]
    redis_password: Option<String>,

    /// Redis logical database (derived from the key prefix if not set)
    #[arg(long, env = "LATCHKEY_REDIS_DATABASE", value_parser = clap::value_parser!(u8).range(0..16))]
    redis_database: Option<u8>,

    /// Key prefix (derived from the identifier if not set)
    #[arg(long, env = "LATCHKEY_PREFIX")]
    prefix: Option<String>,

    /// Deployment identifier used to derive the key prefix
    #[arg(long, default_value = "latchkey", env = "LATCHKEY_IDENTIFIER")]
    identifier: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Run a command while holding a lock. Exits with 75 without running it if the lock is busy.
    Run {
        /// Lock key
        #[arg(long)]
        key: String,

        /// Lock owner (random if not set)
        #[arg(long)]
        owner: Option<String>,

        /// Logical lock TTL in seconds
        #[arg(long, default_value_t = 120)]
        ttl: u64,

        /// Command and arguments to run
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Show who holds a lock
    Status {
        /// Lock key
        #[arg(long)]
        key: String,
    },
}

impl Args {
    fn namespace(&self) -> Namespace {
        let prefix = self
            .prefix
            .clone()
            .unwrap_or_else(|| Namespace::derive(&self.identifier).prefix().to_string());

        Namespace::new(prefix, self.redis_database)
    }

    fn store_config(&self, namespace: &Namespace) -> RedisLockStoreConfig {
        RedisLockStoreConfig {
            host: self.redis_host.clone(),
            port: self.redis_port,
            username: self.redis_username.clone(),
            password: self.redis_password.clone(),
            ..RedisLockStoreConfig::default()
        }
        .for_namespace(namespace)
    }
}

async fn run(
    manager: &Arc<LockManager<RedisLockStore>>,
    key: &str,
    owner: Option<&str>,
    ttl: u64,
    command: &[String],
) -> Result<ExitCode, Error> {
    let Some((program, program_args)) = command.split_first() else {
        return Err(Error::NoCommand);
    };

    let mut scope = LockScope::new();
    scope.register(manager.clone());

    if !manager
        .acquire(key, owner, Duration::from_secs(ttl))
        .await?
    {
        warn!(key, "Lock is busy; not running command.");
        return Ok(ExitCode::from(EXIT_LOCK_BUSY));
    }

    info!(key, program, "Lock acquired; running command.");

    let status = run_child(program, program_args).await;

    // Runs however the command ended.
    scope.release_all().await;

    let status = status.map_err(|source| Error::Spawn {
        program: program.clone(),
        source,
    })?;

    info!(key, %status, "Command finished; lock released.");

    Ok(status
        .code()
        .and_then(|code| u8::try_from(code).ok())
        .map_or(ExitCode::FAILURE, ExitCode::from))
}

async fn run_child(
    program: &str,
    args: &[String],
) -> std::io::Result<std::process::ExitStatus> {
    let mut child = tokio::process::Command::new(program).args(args).spawn()?;

    tokio::select! {
        status = child.wait() => status,
        _ = tokio::signal::ctrl_c() => {
            warn!(program, "Interrupted; stopping command.");
            child.kill().await?;
            child.wait().await
        }
    }
}

async fn status(manager: &LockManager<RedisLockStore>, key: &str) -> Result<ExitCode, Error> {
    let status = manager.check(key).await?;

    match &status {
        LockStatus::Free | LockStatus::HeldBySelf => println!("{key}: free"),
        LockStatus::HeldByOther(owner) => println!("{key}: held by {owner}"),
        LockStatus::Stale(owner) => println!("{key}: stale, last held by {owner}"),
    }

    let lock_key = manager.namespace().key(key);
    if let Some(raw) = manager.store().get(&lock_key).await? {
        match raw.parse::<LockValue>() {
            Ok(value) => println!("  logical expiry: {} (epoch seconds)", value.expires_at),
            Err(e) => println!("  {e}"),
        }
    }

    Ok(ExitCode::SUCCESS)
}

#[tokio::main]
async fn main() -> Result<ExitCode, Error> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let namespace = args.namespace();
    let store = RedisLockStore::connect(args.store_config(&namespace)).await?;

    let manager = Arc::new(LockManager::new(LockManagerConfig {
        store,
        namespace,
        clock: None,
    }));

    match &args.command {
        Command::Run {
            key,
            owner,
            ttl,
            command,
        } => run(&manager, key, owner.as_deref(), *ttl, command).await,
        Command::Status { key } => status(&manager, key).await,
    }
}
