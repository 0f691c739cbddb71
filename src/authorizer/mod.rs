//! Authorization orchestration.
//!
//! Sequences credential lookup, key state checks, the payload size check and
//! the rate limit decision, then assembles the policy response. Every failure
//! before the rate limit step denies without touching the counter store.

mod response;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::credentials::CredentialValidator;
use crate::ratelimit::DecisionBackend;

pub use response::{
    AuthorizationRequest, AuthorizationResponse, Effect, PolicyDocument, Statement,
    INVOKE_ACTION, POLICY_VERSION,
};

/// Reason codes for denials raised before the rate limit check.
pub mod reasons {
    pub const MISSING_API_KEY: &str = "MISSING_API_KEY";
    pub const INVALID_API_KEY: &str = "INVALID_API_KEY";
    pub const INACTIVE_API_KEY: &str = "INACTIVE_API_KEY";
    pub const EXPIRED_API_KEY: &str = "EXPIRED_API_KEY";
    pub const PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
}

pub const HEADER_RATE_LIMIT: &str = "X-RateLimit-Limit";
pub const HEADER_RATE_REMAINING: &str = "X-RateLimit-Remaining";
pub const HEADER_RATE_RESET: &str = "X-RateLimit-Reset";
pub const HEADER_MAX_PAYLOAD: &str = "X-Max-Payload-Size";

const BYTES_PER_MIB: u64 = 1024 * 1024;

/// Decides whether a request carrying an API key may proceed.
pub struct Authorizer<R: DecisionBackend> {
    credentials: Arc<dyn CredentialValidator>,
    rate_limiter: Arc<R>,
}

impl<R: DecisionBackend> Authorizer<R> {
    /// Create an authorizer from a credential source and a rate limiter.
    pub fn new(credentials: Arc<dyn CredentialValidator>, rate_limiter: Arc<R>) -> Self {
        Self {
            credentials,
            rate_limiter,
        }
    }

    /// The rate limiter behind this authorizer.
    pub fn rate_limiter(&self) -> &Arc<R> {
        &self.rate_limiter
    }

    /// Authorize a single request.
    pub async fn authorize(&self, request: &AuthorizationRequest) -> AuthorizationResponse {
        let resource = request.resource.as_str();

        if request.api_key.is_empty() {
            warn!("Missing API key");
            return AuthorizationResponse::deny("", resource, reasons::MISSING_API_KEY, "Missing API key");
        }

        let record = match self.credentials.validate(&request.api_key).await {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "API key validation failed");
                return AuthorizationResponse::deny(
                    "",
                    resource,
                    reasons::INVALID_API_KEY,
                    format!("Error validating API key: {}", e),
                );
            }
        };
        let client_id = record.client_id.as_str();

        if !record.active {
            warn!(client_id = %client_id, "API key is inactive");
            return AuthorizationResponse::deny(
                client_id,
                resource,
                reasons::INACTIVE_API_KEY,
                "API key is inactive",
            );
        }

        if record.is_expired_at(Utc::now()) {
            warn!(client_id = %client_id, expires_at = %record.expires_at, "API key has expired");
            return AuthorizationResponse::deny(
                client_id,
                resource,
                reasons::EXPIRED_API_KEY,
                "API key has expired",
            );
        }

        if let (Some(size), Some(max_mb)) =
            (request.content_length, record.usage_limits.max_payload_size_mb)
        {
            let max_bytes = max_mb.saturating_mul(BYTES_PER_MIB);
            if size > max_bytes {
                warn!(
                    client_id = %client_id,
                    size,
                    max = max_bytes,
                    "Payload size exceeds maximum allowed size"
                );
                let headers = HashMap::from([(HEADER_MAX_PAYLOAD.to_string(), max_mb.to_string())]);
                return AuthorizationResponse::deny(
                    client_id,
                    resource,
                    reasons::PAYLOAD_TOO_LARGE,
                    "Payload size exceeds maximum allowed size",
                )
                .with_headers(headers);
            }
        }

        let limit = record.usage_limits.requests_per_second;
        let decision = self
            .rate_limiter
            .decide(client_id, &request.origin_address, limit)
            .await;

        if let Some(error) = &decision.error {
            // Degraded decisions are reported, not turned into denials here.
            warn!(client_id = %client_id, error = %error, reason = %decision.reason, "Rate limit check degraded");
        }

        if !decision.allowed && decision.reason.is_store_failure() {
            // Fail-closed outage: the client never went over its limit, so
            // no rate limit headers are attached.
            warn!(client_id = %client_id, reason = %decision.reason, "Denying while rate limit store is unavailable");
            return AuthorizationResponse::deny(
                client_id,
                resource,
                decision.reason.as_str(),
                "Rate limit service unavailable",
            );
        }

        if !decision.allowed {
            let retry_after = decision.retry_after.unwrap_or(Duration::from_secs(1));
            let reset = Utc::now().timestamp() + retry_after.as_secs().max(1) as i64;
            info!(client_id = %client_id, reason = %decision.reason, "Rate limit exceeded");

            let headers = HashMap::from([
                (HEADER_RATE_LIMIT.to_string(), limit.to_string()),
                (HEADER_RATE_REMAINING.to_string(), "0".to_string()),
                (HEADER_RATE_RESET.to_string(), reset.to_string()),
            ]);
            return AuthorizationResponse::deny(
                client_id,
                resource,
                decision.reason.as_str(),
                "Rate limit exceeded",
            )
            .with_headers(headers);
        }

        debug!(client_id = %client_id, reason = %decision.reason, "Request authorized");
        AuthorizationResponse::allow(client_id, resource, decision.reason.as_str(), record.platform_data)
    }
}
