//! Decision outcomes and reason codes.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

/// Machine-readable reason attached to every decision.
///
/// The string forms are stable and may be matched on by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    /// Within the per-second ceiling.
    Ok,
    /// Rate limiting is disabled for this client.
    NoLimit,
    /// A block marker is active for this client.
    Blocked,
    /// The origin address exceeded its per-minute budget; a block was imposed.
    IpRateExceeded,
    /// Over the per-second ceiling; tolerated without a block.
    RateExceeded,
    /// Over the per-second ceiling too often; a block was imposed.
    RateExceededBlocked,
    /// The client identity was empty.
    InvalidClientId,
    /// The store could not be reached or did not answer in time.
    StoreError,
    /// The store rejected a command.
    RedisError,
    /// A store reply had the wrong type.
    ConversionError,
    /// A store reply had an impossible value.
    InvalidResult,
}

impl Reason {
    /// The stable string form of this reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::Ok => "OK",
            Reason::NoLimit => "NO_LIMIT",
            Reason::Blocked => "BLOCKED",
            Reason::IpRateExceeded => "IP_RATE_EXCEEDED",
            Reason::RateExceeded => "RATE_EXCEEDED",
            Reason::RateExceededBlocked => "RATE_EXCEEDED_BLOCKED",
            Reason::InvalidClientId => "INVALID_CLIENT_ID",
            Reason::StoreError => "STORE_ERROR",
            Reason::RedisError => "REDIS_ERROR",
            Reason::ConversionError => "CONVERSION_ERROR",
            Reason::InvalidResult => "INVALID_RESULT",
        }
    }

    /// Whether this reason stems from a store failure rather than a policy
    /// outcome.
    pub fn is_store_failure(&self) -> bool {
        matches!(
            self,
            Reason::StoreError | Reason::RedisError | Reason::ConversionError | Reason::InvalidResult
        )
    }
}

impl fmt::Display for Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors reported alongside a decision.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("client id must not be empty")]
    InvalidClientId,

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The decision deadline elapsed before the store answered.
    #[error("rate limit decision exceeded its deadline")]
    DeadlineExceeded,
}

/// The outcome of a rate limit check.
#[derive(Debug)]
pub struct Decision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Why.
    pub reason: Reason,
    /// How long the caller should wait before retrying, when known.
    pub retry_after: Option<Duration>,
    /// The failure behind a degraded decision. Set for invalid input and
    /// store failures only; policy denials carry no error.
    pub error: Option<DecisionError>,
}

impl Decision {
    /// An allow decision with no error.
    pub fn allow(reason: Reason) -> Self {
        Self {
            allowed: true,
            reason,
            retry_after: None,
            error: None,
        }
    }

    /// A policy denial.
    pub fn deny(reason: Reason, retry_after: Option<Duration>) -> Self {
        Self {
            allowed: false,
            reason,
            retry_after,
            error: None,
        }
    }

    /// The rejection for an empty client identity.
    pub fn invalid_client() -> Self {
        Self {
            allowed: false,
            reason: Reason::InvalidClientId,
            retry_after: None,
            error: Some(DecisionError::InvalidClientId),
        }
    }

    /// A decision degraded by a store failure.
    pub fn degraded(allowed: bool, reason: Reason, error: DecisionError) -> Self {
        Self {
            allowed,
            reason,
            retry_after: None,
            error: Some(error),
        }
    }

    /// Split into the `(allowed, reason, error)` triple.
    pub fn into_parts(self) -> (bool, Reason, Option<DecisionError>) {
        (self.allowed, self.reason, self.error)
    }
}
