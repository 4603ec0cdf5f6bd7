//! Inbound rate limiter.
//!
//! Each check consults two independent fixed windows per client and category:
//! the current minute bucket and the current hour bucket. Counts are read
//! before they are incremented, so a denied request is never recorded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace, warn};

use super::clock::{Clock, SystemClock};
use super::counter::{CounterKey, CounterStore, Granularity, StoreError};
use super::rules::{PolicyTable, RateLimitPolicy};

/// Seconds a denied client is told to wait. Minute windows are the usual trigger.
pub const RETRY_AFTER_SECS: u64 = 60;

/// What to do when the counter store cannot answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Allow the request and log a warning
    #[default]
    Open,
    /// Deny the request and log an error
    Closed,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// The category the request was counted against
    pub category: String,
    /// The policy that was applied
    pub policy: RateLimitPolicy,
    /// Seconds to wait before retrying; 0 when allowed
    pub retry_after_secs: u64,
    /// Minute window count observed by this check
    pub minute_count: u64,
    /// Hour window count observed by this check
    pub hour_count: u64,
}

impl Decision {
    fn allow(category: &str, policy: RateLimitPolicy, minute_count: u64, hour_count: u64) -> Self {
        Self {
            allowed: true,
            category: category.to_string(),
            policy,
            retry_after_secs: 0,
            minute_count,
            hour_count,
        }
    }

    fn deny(category: &str, policy: RateLimitPolicy, minute_count: u64, hour_count: u64) -> Self {
        Self {
            allowed: false,
            category: category.to_string(),
            policy,
            retry_after_secs: RETRY_AFTER_SECS,
            minute_count,
            hour_count,
        }
    }
}

/// Per-client, per-category fixed-window rate limiter.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct InboundRateLimiter {
    store: Arc<dyn CounterStore>,
    policies: PolicyTable,
    clock: Arc<dyn Clock>,
    failure_policy: FailurePolicy,
}

impl InboundRateLimiter {
    /// Create a rate limiter over a counter store using the system clock.
    pub fn new(store: Arc<dyn CounterStore>, policies: PolicyTable) -> Self {
        Self::with_clock(store, policies, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit clock.
    pub fn with_clock(store: Arc<dyn CounterStore>, policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            policies,
            clock,
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Set the behavior when the counter store is unavailable.
    pub fn with_failure_policy(mut self, failure_policy: FailurePolicy) -> Self {
        self.failure_policy = failure_policy;
        self
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        self.failure_policy
    }

    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    /// Check whether `client_id` may issue another request in `category`.
    ///
    /// Counters are only incremented when the request is allowed.
    pub async fn check(&self, client_id: &str, category: &str) -> Decision {
        let policy = *self.policies.policy_for(category);
        let now = self.clock.now();
        let minute_key = CounterKey::at(client_id, category, Granularity::Minute, now);
        let hour_key = CounterKey::at(client_id, category, Granularity::Hour, now);

        trace!(
            client = %client_id,
            category = %category,
            minute_bucket = %minute_key.bucket,
            hour_bucket = %hour_key.bucket,
            "Checking rate limit"
        );

        match self.evaluate(category, policy, &minute_key, &hour_key).await {
            Ok(decision) => decision,
            Err(err) => self.on_store_failure(client_id, category, policy, err),
        }
    }

    /// Read the current minute and hour counts without changing them.
    pub async fn current_counts(&self, client_id: &str, category: &str) -> Result<(u64, u64), StoreError> {
        let now = self.clock.now();
        let minute = self
            .store
            .get(&CounterKey::at(client_id, category, Granularity::Minute, now))
            .await?;
        let hour = self
            .store
            .get(&CounterKey::at(client_id, category, Granularity::Hour, now))
            .await?;
        Ok((minute, hour))
    }

    async fn evaluate(
        &self,
        category: &str,
        policy: RateLimitPolicy,
        minute_key: &CounterKey,
        hour_key: &CounterKey,
    ) -> Result<Decision, StoreError> {
        let minute_count = self.store.get(minute_key).await?;
        let hour_count = self.store.get(hour_key).await?;

        if minute_count >= policy.requests_per_minute || hour_count >= policy.requests_per_hour {
            debug!(
                client = %minute_key.client_id,
                category = %category,
                minute_count,
                hour_count,
                minute_limit = policy.requests_per_minute,
                hour_limit = policy.requests_per_hour,
                "Rate limit exceeded"
            );
            return Ok(Decision::deny(category, policy, minute_count, hour_count));
        }

        let minute_count = self.store.increment(minute_key).await?;
        let hour_count = match self.store.increment(hour_key).await {
            Ok(count) => count,
            Err(err) => {
                // A fail-closed denial must leave no trace in either window.
                if self.failure_policy == FailurePolicy::Closed {
                    self.rollback(minute_key).await;
                }
                return Err(err);
            }
        };

        Ok(Decision::allow(category, policy, minute_count, hour_count))
    }

    async fn rollback(&self, key: &CounterKey) {
        if let Err(err) = self.store.decrement(key).await {
            error!(key = %key, error = %err, "Failed to roll back counter increment");
        }
    }

    fn on_store_failure(
        &self,
        client_id: &str,
        category: &str,
        policy: RateLimitPolicy,
        err: StoreError,
    ) -> Decision {
        match self.failure_policy {
            FailurePolicy::Open => {
                warn!(
                    client = %client_id,
                    category = %category,
                    error = %err,
                    "Counter store unavailable, allowing request"
                );
                Decision::allow(category, policy, 0, 0)
            }
            FailurePolicy::Closed => {
                error!(
                    client = %client_id,
                    category = %category,
                    error = %err,
                    "Counter store unavailable, denying request"
                );
                Decision::deny(category, policy, 0, 0)
            }
        }
    }
}
