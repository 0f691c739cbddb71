//! Credential validation.
//!
//! The authorizer resolves an API key to a [`ClientRecord`] through the
//! [`CredentialValidator`] trait. Where records actually live is up to the
//! implementation; [`FileCredentialStore`] reads them from a YAML file.

mod file;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use file::FileCredentialStore;

/// Errors from credential lookup.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// No record matches the key.
    #[error("invalid or unknown API key")]
    NotFound,

    /// The record exists but cannot be used.
    #[error("malformed credential record: {0}")]
    Malformed(String),
}

/// Per-client usage limits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLimits {
    /// Per-second request ceiling; zero or negative disables rate limiting
    #[serde(default)]
    pub requests_per_second: i64,

    /// Largest accepted request body in MiB; unset means unchecked
    #[serde(default)]
    pub max_payload_size_mb: Option<u64>,
}

/// Client metadata resolved from an API key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientRecord {
    /// Identity the rate ceiling applies to
    pub client_id: String,

    /// Whether the key is enabled
    #[serde(default)]
    pub active: bool,

    /// When the key stops being valid
    pub expires_at: DateTime<Utc>,

    /// Opaque data forwarded to downstream services on allow
    #[serde(default)]
    pub platform_data: HashMap<String, serde_json::Value>,

    /// Rate and payload limits
    #[serde(default)]
    pub usage_limits: UsageLimits,
}

impl ClientRecord {
    /// Whether the key has expired as of `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Resolves API keys to client records.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Look up the record for `api_key`.
    async fn validate(&self, api_key: &str) -> Result<ClientRecord, CredentialError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let record = ClientRecord {
            client_id: "acme".to_string(),
            active: true,
            expires_at: now,
            platform_data: HashMap::new(),
            usage_limits: UsageLimits::default(),
        };

        assert!(!record.is_expired_at(now));
        assert!(record.is_expired_at(now + Duration::seconds(1)));
    }
}
