//! Tunable rate limiting policy.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::keys::DEFAULT_KEY_PREFIX;
use crate::error::{GatekeeperError, Result};

/// What a decision falls back to when the store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureMode {
    /// Allow the request. Enforcement outages degrade to no throttling.
    #[default]
    Open,
    /// Deny the request.
    Closed,
}

/// Policy constants for the rate limit engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Prefix for all store keys
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Lifetime of a per-second counter; at least 2s to absorb clock skew
    #[serde(default = "default_window_ttl")]
    pub window_ttl_secs: u64,

    /// Lifetime of a per-minute origin counter
    #[serde(default = "default_origin_window")]
    pub origin_window_secs: u64,

    /// An origin may send this many times a client's per-second ceiling per minute
    #[serde(default = "default_origin_multiplier")]
    pub origin_multiplier: i64,

    /// Rolling window over which exceeded seconds are counted
    #[serde(default = "default_exceed_window")]
    pub exceed_window_secs: u64,

    /// Exceeded seconds tolerated within the window before blocking
    #[serde(default = "default_exceed_threshold")]
    pub exceed_threshold: i64,

    /// Block duration imposed on origin abuse
    #[serde(default = "default_block")]
    pub ip_block_secs: u64,

    /// Block duration imposed on repeated exceedance
    #[serde(default = "default_block")]
    pub exceed_block_secs: u64,

    /// Upper bound on a whole decision, in milliseconds
    #[serde(default = "default_decision_timeout")]
    pub decision_timeout_ms: u64,

    /// Extra attempts for a failed store call
    #[serde(default = "default_store_retries")]
    pub store_retries: u32,

    /// Pause before each retry, in milliseconds
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,

    /// Behaviour when the store fails
    #[serde(default)]
    pub failure_mode: FailureMode,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            window_ttl_secs: default_window_ttl(),
            origin_window_secs: default_origin_window(),
            origin_multiplier: default_origin_multiplier(),
            exceed_window_secs: default_exceed_window(),
            exceed_threshold: default_exceed_threshold(),
            ip_block_secs: default_block(),
            exceed_block_secs: default_block(),
            decision_timeout_ms: default_decision_timeout(),
            store_retries: default_store_retries(),
            retry_backoff_ms: default_retry_backoff(),
            failure_mode: FailureMode::default(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_window_ttl() -> u64 {
    2
}

fn default_origin_window() -> u64 {
    60
}

fn default_origin_multiplier() -> i64 {
    10
}

fn default_exceed_window() -> u64 {
    60
}

fn default_exceed_threshold() -> i64 {
    5
}

fn default_block() -> u64 {
    300
}

fn default_decision_timeout() -> u64 {
    3000
}

fn default_store_retries() -> u32 {
    1
}

fn default_retry_backoff() -> u64 {
    50
}

impl RateLimitPolicy {
    /// Reject settings the engine cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(invalid("key_prefix must not be empty"));
        }
        if self.window_ttl_secs < 2 {
            return Err(invalid("window_ttl_secs must be at least 2"));
        }
        if self.origin_multiplier < 1 {
            return Err(invalid("origin_multiplier must be at least 1"));
        }
        if self.exceed_threshold < 0 {
            return Err(invalid("exceed_threshold must not be negative"));
        }
        for (name, value) in [
            ("origin_window_secs", self.origin_window_secs),
            ("exceed_window_secs", self.exceed_window_secs),
            ("ip_block_secs", self.ip_block_secs),
            ("exceed_block_secs", self.exceed_block_secs),
            ("decision_timeout_ms", self.decision_timeout_ms),
        ] {
            if value == 0 {
                return Err(invalid(&format!("{name} must be greater than zero")));
            }
        }
        Ok(())
    }

    pub fn window_ttl(&self) -> Duration {
        Duration::from_secs(self.window_ttl_secs)
    }

    pub fn origin_window(&self) -> Duration {
        Duration::from_secs(self.origin_window_secs)
    }

    pub fn exceed_window(&self) -> Duration {
        Duration::from_secs(self.exceed_window_secs)
    }

    pub fn ip_block(&self) -> Duration {
        Duration::from_secs(self.ip_block_secs)
    }

    pub fn exceed_block(&self) -> Duration {
        Duration::from_secs(self.exceed_block_secs)
    }

    pub fn decision_timeout(&self) -> Duration {
        Duration::from_millis(self.decision_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Requests an origin may send per minute for a given per-second ceiling.
    pub fn origin_limit(&self, max_requests_per_second: i64) -> i64 {
        max_requests_per_second.saturating_mul(self.origin_multiplier)
    }
}

fn invalid(msg: &str) -> GatekeeperError {
    GatekeeperError::Config(format!("invalid rate limiting policy: {msg}"))
}
