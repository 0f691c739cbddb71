//! Counter store adapters.
//!
//! The rate limit engine keeps no state of its own. Every counter and block
//! marker lives in a [`CounterStore`], which exposes a handful of atomic
//! primitives. Expiry is the only way anything is ever removed.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::Reason;

pub use memory::InMemoryCounterStore;
pub use redis_store::RedisCounterStore;

/// Errors surfaced by a counter store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached or the connection broke.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The operation did not complete in time.
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    /// The store rejected the command.
    #[error("redis command failed: {0}")]
    Redis(String),

    /// The reply could not be converted to the expected type.
    #[error("unexpected reply type: {0}")]
    Conversion(String),

    /// The reply had the right type but an impossible value.
    #[error("invalid reply: {0}")]
    UnexpectedResponse(String),
}

impl StoreError {
    /// The reason code reported when a decision fails with this error.
    pub fn reason(&self) -> Reason {
        match self {
            StoreError::Unavailable(_) | StoreError::Timeout(_) => Reason::StoreError,
            StoreError::Redis(_) => Reason::RedisError,
            StoreError::Conversion(_) => Reason::ConversionError,
            StoreError::UnexpectedResponse(_) => Reason::InvalidResult,
        }
    }
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            // Redis does not report the configured bound, only that it elapsed.
            StoreError::Timeout(Duration::ZERO)
        } else if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_unrecoverable_error()
        {
            StoreError::Unavailable(err.to_string())
        } else if err.kind() == redis::ErrorKind::TypeError {
            StoreError::Conversion(err.to_string())
        } else {
            StoreError::Redis(err.to_string())
        }
    }
}

/// Atomic counter primitives backed by a shared key-value store.
///
/// Implementations must be safe to call concurrently from many decisions.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new value.
    ///
    /// When the increment creates the key (the result is 1), its time to live
    /// is set to `ttl_if_first`. Later increments leave the expiry untouched.
    async fn increment_with_ttl(&self, key: &str, ttl_if_first: Duration)
        -> Result<i64, StoreError>;

    /// Check whether `key` is present and unexpired.
    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Time left before `key` expires, or `None` when it is absent.
    ///
    /// A key that exists without an expiry reports [`Duration::ZERO`].
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, StoreError>;

    /// Set `key` as a presence flag expiring after `ttl`, replacing any
    /// existing value and expiry.
    async fn set_with_ttl(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Verify that the store is reachable.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Whole seconds for a store-side TTL. Anything shorter than a second would
/// round to zero, which Redis rejects, so the minimum is one.
pub(crate) fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}
