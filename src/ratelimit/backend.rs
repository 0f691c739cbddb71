//! Decision backend trait for abstracting the rate limit engine.

use async_trait::async_trait;

use super::reason::Decision;
use crate::store::StoreError;

/// Trait for rate limit decision implementations.
///
/// The authorizer and the gRPC service work against this trait so that they
/// can be exercised with a stubbed backend.
#[async_trait]
pub trait DecisionBackend: Send + Sync {
    /// Decide whether a request from `client_id` at `origin_address` fits
    /// within `max_requests_per_second`.
    async fn decide(
        &self,
        client_id: &str,
        origin_address: &str,
        max_requests_per_second: i64,
    ) -> Decision;

    /// Check that the backing store is reachable.
    async fn health(&self) -> Result<(), StoreError>;
}
