//! Rate limit decision engine.
//!
//! A decision is a short, fixed sequence of atomic store operations:
//!
//! 1. block marker present? deny `BLOCKED` with the block's remaining time
//! 2. bump the origin's per-minute counter; over budget? block, deny
//!    `IP_RATE_EXCEEDED`
//! 3. bump the client's per-second counter; within ceiling? allow `OK`
//! 4. first excess request in this second bumps the exceed counter; too many
//!    exceeded seconds? block, deny `RATE_EXCEEDED_BLOCKED`; otherwise deny
//!    `RATE_EXCEEDED`
//!
//! Each step short-circuits the next, so calls are issued sequentially.
//! Concurrent decisions for one client may overshoot the ceiling slightly,
//! but no increment is ever lost.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use super::backend::DecisionBackend;
use super::keys::KeySpace;
use super::policy::{FailureMode, RateLimitPolicy};
use super::reason::{Decision, DecisionError, Reason};
use super::window::TimeWindow;
use crate::clock::{Clock, SystemClock};
use crate::store::{CounterStore, StoreError};

/// Decides whether a client request fits within its rate ceiling.
///
/// The engine holds no counters itself; everything is rehydrated from the
/// store on each call, so any number of engines may share one store.
pub struct RateLimitEngine {
    store: Arc<dyn CounterStore>,
    policy: RateLimitPolicy,
    keys: KeySpace,
    clock: Arc<dyn Clock>,
}

impl RateLimitEngine {
    /// Create an engine over the given store and policy.
    pub fn new(store: Arc<dyn CounterStore>, policy: RateLimitPolicy) -> Self {
        let keys = KeySpace::new(policy.key_prefix.clone());
        Self {
            store,
            policy,
            keys,
            clock: Arc::new(SystemClock),
        }
    }

    /// Replace the clock used to pick counter windows.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// The active policy.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// The key space counters are written under.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Decide using the policy's default deadline.
    pub async fn decide(
        &self,
        client_id: &str,
        origin_address: &str,
        max_requests_per_second: i64,
    ) -> Decision {
        let deadline = Instant::now() + self.policy.decision_timeout();
        self.decide_until(client_id, origin_address, max_requests_per_second, deadline)
            .await
    }

    /// Decide, abandoning any outstanding store call at `deadline`.
    pub async fn decide_until(
        &self,
        client_id: &str,
        origin_address: &str,
        max_requests_per_second: i64,
        deadline: Instant,
    ) -> Decision {
        if client_id.is_empty() {
            warn!(origin = %origin_address, "Rejecting rate limit check with empty client id");
            return Decision::invalid_client();
        }

        if max_requests_per_second <= 0 {
            trace!(client_id = %client_id, "Rate limiting disabled for client");
            return Decision::allow(Reason::NoLimit);
        }

        let evaluation = self.evaluate(client_id, origin_address, max_requests_per_second);
        let decision = match timeout_at(deadline, evaluation).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(err)) => self.degrade(client_id, DecisionError::Store(err)),
            Err(_) => self.degrade(client_id, DecisionError::DeadlineExceeded),
        };

        if decision.allowed {
            debug!(
                client_id = %client_id,
                origin = %origin_address,
                limit = max_requests_per_second,
                reason = %decision.reason,
                "Rate limit check allowed"
            );
        } else {
            info!(
                client_id = %client_id,
                origin = %origin_address,
                limit = max_requests_per_second,
                reason = %decision.reason,
                retry_after_secs = decision.retry_after.map(|d| d.as_secs()),
                "Rate limit check denied"
            );
        }

        decision
    }

    async fn evaluate(
        &self,
        client_id: &str,
        origin_address: &str,
        max_requests_per_second: i64,
    ) -> Result<Decision, StoreError> {
        let now = self.clock.now();
        let block_key = self.keys.block_marker(client_id);

        let block_left = self
            .with_retry("block ttl", || self.store.remaining_ttl(&block_key))
            .await?;
        if let Some(left) = block_left {
            // A marker with no expiry gives no usable hint.
            let retry_after = (!left.is_zero()).then_some(left);
            return Ok(Decision::deny(Reason::Blocked, retry_after));
        }

        // An empty origin carries no signal; counting it would lump every
        // such request into one shared bucket.
        if !origin_address.is_empty() {
            let window = TimeWindow::of(self.policy.origin_window());
            let origin_key = self.keys.origin_counter(origin_address, window.index(now));
            let origin_count = self
                .with_retry("increment origin", || {
                    self.store
                        .increment_with_ttl(&origin_key, self.policy.origin_window())
                })
                .await?;

            let origin_limit = self.policy.origin_limit(max_requests_per_second);
            if origin_count > origin_limit {
                let block = self.policy.ip_block();
                self.with_retry("set block", || self.store.set_with_ttl(&block_key, block))
                    .await?;
                warn!(
                    client_id = %client_id,
                    origin = %origin_address,
                    count = origin_count,
                    limit = origin_limit,
                    block_secs = block.as_secs(),
                    "Origin exceeded its request budget, blocking client"
                );
                return Ok(Decision::deny(Reason::IpRateExceeded, Some(block)));
            }
        }

        let window_key = self
            .keys
            .rate_window(client_id, TimeWindow::SECOND.index(now));
        let current = self
            .with_retry("increment window", || {
                self.store
                    .increment_with_ttl(&window_key, self.policy.window_ttl())
            })
            .await?;

        trace!(client_id = %client_id, count = current, limit = max_requests_per_second, "Window counter");

        if current <= max_requests_per_second {
            return Ok(Decision::allow(Reason::Ok));
        }

        // Exactly one request per window sees ceiling + 1, so the exceed
        // counter counts exceeded seconds rather than excess requests.
        if current == max_requests_per_second + 1 {
            let exceed_key = self.keys.exceed_counter(client_id);
            let exceeded = self
                .with_retry("increment exceed", || {
                    self.store
                        .increment_with_ttl(&exceed_key, self.policy.exceed_window())
                })
                .await?;

            if exceeded > self.policy.exceed_threshold {
                let block = self.policy.exceed_block();
                self.with_retry("set block", || self.store.set_with_ttl(&block_key, block))
                    .await?;
                warn!(
                    client_id = %client_id,
                    exceeded_windows = exceeded,
                    threshold = self.policy.exceed_threshold,
                    block_secs = block.as_secs(),
                    "Client repeatedly exceeded its rate limit, blocking"
                );
                return Ok(Decision::deny(Reason::RateExceededBlocked, Some(block)));
            }
        }

        Ok(Decision::deny(
            Reason::RateExceeded,
            Some(TimeWindow::SECOND.until_reset(now)),
        ))
    }

    /// Run a store call, retrying a bounded number of times after a fixed
    /// pause.
    async fn with_retry<T, F, Fut>(&self, op: &'static str, mut call: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.policy.store_retries => {
                    attempt += 1;
                    debug!(op, attempt, error = %err, "Store call failed, retrying");
                    sleep(self.policy.retry_backoff()).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn degrade(&self, client_id: &str, error: DecisionError) -> Decision {
        let reason = match &error {
            DecisionError::Store(err) => err.reason(),
            _ => Reason::StoreError,
        };
        let allowed = self.policy.failure_mode == FailureMode::Open;

        warn!(
            client_id = %client_id,
            reason = %reason,
            error = %error,
            allowed,
            "Rate limit store unavailable, falling back to failure mode"
        );

        Decision::degraded(allowed, reason, error)
    }
}

#[async_trait]
impl DecisionBackend for RateLimitEngine {
    async fn decide(
        &self,
        client_id: &str,
        origin_address: &str,
        max_requests_per_second: i64,
    ) -> Decision {
        RateLimitEngine::decide(self, client_id, origin_address, max_requests_per_second).await
    }

    async fn health(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }
}
