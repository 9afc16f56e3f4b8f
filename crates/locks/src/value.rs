//! Textual encoding of the value stored under a lock key.
//!
//! `<logical expiry epoch seconds>__lock__<owner>_<sub-second ticks>`, e.g.
//! `1675238193__lock__user10001_1234`. Every process sharing the store must
//! be able to read the expiry prefix, so the layout is fixed.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Separates the logical expiry from the owner part of a lock value.
pub const SEPARATOR: &str = "__lock__";

/// Sub-second ticks are ten-thousandths of a second.
const TICKS_PER_SECOND: u32 = 10_000;

/// A stored lock value could not be parsed.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("malformed lock value `{value}`: {reason}")]
pub struct ParseError {
    value: String,
    reason: &'static str,
}

impl ParseError {
    fn new(value: &str, reason: &'static str) -> Self {
        Self {
            value: value.to_string(),
            reason,
        }
    }
}

/// The decoded form of a stored lock value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockValue {
    /// Business-level expiry in epoch seconds, independent of the store TTL.
    pub expires_at: i64,

    /// Identity of the actor holding the lock.
    pub owner: String,

    /// Sub-second part of the acquisition timestamp, in ten-thousandths.
    pub ticks: u32,
}

impl LockValue {
    /// Builds the value for a lock acquired at `now` that logically expires
    /// `ttl_secs` later.
    #[must_use]
    pub fn new(owner: impl Into<String>, now: DateTime<Utc>, ttl_secs: i64) -> Self {
        Self {
            expires_at: now.timestamp().saturating_add(ttl_secs),
            owner: owner.into(),
            ticks: now.timestamp_subsec_micros() / (1_000_000 / TICKS_PER_SECOND),
        }
    }

    /// Reads only the logical expiry from an encoded value.
    ///
    /// This is all a contender needs to decide whether a lock is stale, and it
    /// tolerates owners it could not otherwise parse.
    #[must_use]
    pub fn parse_expiry(encoded: &str) -> Option<i64> {
        encoded
            .split_once(SEPARATOR)
            .and_then(|(expiry, _)| expiry.parse().ok())
    }

    /// Whether the logical expiry has passed at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() > self.expires_at
    }
}

impl fmt::Display for LockValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{SEPARATOR}{}_{:04}",
            self.expires_at, self.owner, self.ticks
        )
    }
}

impl FromStr for LockValue {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (expiry, rest) = s
            .split_once(SEPARATOR)
            .ok_or_else(|| ParseError::new(s, "missing separator"))?;

        let expires_at = expiry
            .parse()
            .map_err(|_| ParseError::new(s, "expiry is not an integer"))?;

        // Owners may contain `_` themselves; the ticks follow the last one.
        let (owner, ticks) = rest
            .rsplit_once('_')
            .ok_or_else(|| ParseError::new(s, "missing tick suffix"))?;

        let ticks = ticks
            .parse()
            .map_err(|_| ParseError::new(s, "ticks are not an integer"))?;

        Ok(Self {
            expires_at,
            owner: owner.to_string(),
            ticks,
        })
    }
}
