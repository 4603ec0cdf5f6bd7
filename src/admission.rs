//! Composition root tying inbound rate limiting and outbound throttling together.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::{AdmissionConfig, IdentityConfig};
use crate::ratelimit::{
    CategoryClassifier, Clock, CounterStore, Decision, InboundRateLimiter, MemoryCounterStore,
    RequestIdentity,
};
use crate::upstream::{OutboundThrottler, UpstreamThrottleRegistry};

/// Admission control for one process.
///
/// Answers "may this client proceed?" for inbound requests and hands out the
/// `OutboundThrottler` used for every call to an external dependency.
pub struct Admission {
    classifier: CategoryClassifier,
    limiter: InboundRateLimiter,
    throttler: OutboundThrottler,
    emit_headers: bool,
    identity: IdentityConfig,
}

impl Admission {
    /// Create an admission controller from its parts.
    pub fn new(classifier: CategoryClassifier, limiter: InboundRateLimiter, throttler: OutboundThrottler) -> Self {
        Self {
            classifier,
            limiter,
            throttler,
            emit_headers: true,
            identity: IdentityConfig::default(),
        }
    }

    /// Build an admission controller from configuration over a counter store.
    pub fn from_config(config: &AdmissionConfig, store: Arc<dyn CounterStore>, clock: Arc<dyn Clock>) -> Self {
        let rate_limiting = &config.rate_limiting;

        let classifier = match &rate_limiting.classifier_rules {
            Some(rules) => CategoryClassifier::new(rules.clone()),
            None => CategoryClassifier::default(),
        };
        let limiter = InboundRateLimiter::with_clock(store, rate_limiting.policies.clone(), clock)
            .with_failure_policy(rate_limiting.failure_policy);
        let throttler = OutboundThrottler::new(Arc::new(UpstreamThrottleRegistry::new(config.upstreams.clone())));

        info!(
            failure_policy = ?rate_limiting.failure_policy,
            categories = rate_limiting.policies.categories.len(),
            upstreams = config.upstreams.services.len(),
            "Admission control configured"
        );

        Self::new(classifier, limiter, throttler)
            .with_emit_headers(rate_limiting.emit_headers)
            .with_identity(rate_limiting.identity.clone())
    }

    pub fn with_emit_headers(mut self, emit_headers: bool) -> Self {
        self.emit_headers = emit_headers;
        self
    }

    pub fn with_identity(mut self, identity: IdentityConfig) -> Self {
        self.identity = identity;
        self
    }

    /// Decide whether a request for `path` from `identity` may proceed.
    pub async fn check(&self, identity: &RequestIdentity, path: &str) -> Decision {
        let client_id = identity.client_id();
        let category = self.classifier.classify(path);
        let decision = self.limiter.check(&client_id, category.as_str()).await;

        if decision.allowed {
            debug!(client = %client_id, category = %category, path = %path, "Request admitted");
        } else {
            info!(
                client = %client_id,
                category = %category,
                path = %path,
                retry_after = decision.retry_after_secs,
                "Request rejected by rate limiter"
            );
        }

        decision
    }

    pub fn throttler(&self) -> &OutboundThrottler {
        &self.throttler
    }

    pub fn classifier(&self) -> &CategoryClassifier {
        &self.classifier
    }

    pub fn limiter(&self) -> &InboundRateLimiter {
        &self.limiter
    }

    pub fn emit_headers(&self) -> bool {
        self.emit_headers
    }

    pub fn identity(&self) -> &IdentityConfig {
        &self.identity
    }

    /// Close all upstream gates so queued callers stop waiting.
    pub fn shutdown(&self) {
        self.throttler.registry().shutdown();
    }
}

/// Periodically purge expired counters from an in-memory store.
pub fn spawn_counter_sweeper(store: Arc<MemoryCounterStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = store.purge_expired();
            debug!(removed, remaining = store.len(), "Counter sweep finished");
        }
    })
}
