//! Per-upstream gates: a concurrency bound and a minimum-interval pacer.
//!
//! Gates are created lazily on first use of an upstream name and live for the
//! lifetime of the registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::throttler::ThrottleError;

/// Throttle settings for one upstream dependency.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpstreamLimits {
    /// Maximum calls in flight at once
    pub max_concurrent: usize,
    /// Call release rate; zero or negative disables pacing
    pub requests_per_second: f64,
}

impl UpstreamLimits {
    /// Longest spacing the pacer will enforce.
    pub const MAX_INTERVAL: Duration = Duration::from_secs(86_400);

    /// Slowest positive rate accepted by configuration: one call per `MAX_INTERVAL`.
    pub const MIN_REQUESTS_PER_SECOND: f64 = 1.0 / 86_400.0;

    pub const fn new(max_concurrent: usize, requests_per_second: f64) -> Self {
        Self {
            max_concurrent,
            requests_per_second,
        }
    }

    /// Minimum spacing between two calls released to this upstream.
    pub fn min_interval(&self) -> Duration {
        if !(self.requests_per_second.is_finite() && self.requests_per_second > 0.0) {
            return Duration::ZERO;
        }

        Duration::try_from_secs_f64(1.0 / self.requests_per_second)
            .map_or(Self::MAX_INTERVAL, |interval| interval.min(Self::MAX_INTERVAL))
    }
}

impl Default for UpstreamLimits {
    fn default() -> Self {
        Self::new(2, 1.0)
    }
}

/// Upstream name to limits mapping with a default fallback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamTable {
    /// Limits for upstreams without an entry
    #[serde(default)]
    pub default: UpstreamLimits,
    /// Limits keyed by upstream name
    #[serde(default)]
    pub services: HashMap<String, UpstreamLimits>,
}

impl UpstreamTable {
    pub fn new(default: UpstreamLimits) -> Self {
        Self {
            default,
            services: HashMap::new(),
        }
    }

    pub fn with_upstream(mut self, name: impl Into<String>, limits: UpstreamLimits) -> Self {
        self.services.insert(name.into(), limits);
        self
    }

    /// Resolve the limits for an upstream name.
    pub fn limits_for(&self, name: &str) -> &UpstreamLimits {
        self.services.get(name).unwrap_or(&self.default)
    }
}

impl Default for UpstreamTable {
    fn default() -> Self {
        UpstreamTable::new(UpstreamLimits::default())
            .with_upstream("rxnorm", UpstreamLimits::new(5, 20.0))
            .with_upstream("snomed", UpstreamLimits::new(2, 5.0))
            .with_upstream("loinc", UpstreamLimits::new(2, 5.0))
            .with_upstream("payments", UpstreamLimits::new(4, 10.0))
    }
}

/// The throttle state for one upstream.
#[derive(Debug)]
pub struct UpstreamGate {
    name: String,
    limits: UpstreamLimits,
    min_interval: Duration,
    semaphore: Arc<Semaphore>,
    /// When the pacer last released a call. Held across the pacing sleep so
    /// the interval check and the update are one critical section.
    last_call_at: Mutex<Option<Instant>>,
}

impl UpstreamGate {
    /// Create a gate for `name` with the given limits.
    pub fn new(name: &str, limits: UpstreamLimits) -> Self {
        let mut limits = limits;
        if limits.max_concurrent == 0 {
            warn!(upstream = %name, "max_concurrent of 0 would block every call, using 1");
            limits.max_concurrent = 1;
        }

        Self {
            name: name.to_string(),
            min_interval: limits.min_interval(),
            semaphore: Arc::new(Semaphore::new(limits.max_concurrent)),
            last_call_at: Mutex::new(None),
            limits,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn limits(&self) -> &UpstreamLimits {
        &self.limits
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Number of calls currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.limits
            .max_concurrent
            .saturating_sub(self.semaphore.available_permits())
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    /// Wait for a concurrency permit, then for the pacer.
    ///
    /// Dropping the returned future before it completes never leaks a permit:
    /// a permit not yet granted is never taken, and one already granted is
    /// released with the future.
    pub async fn acquire(&self) -> Result<ThrottlePermit, ThrottleError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ThrottleError::Closed {
                upstream: self.name.clone(),
            })?;

        self.pace().await;

        Ok(ThrottlePermit {
            upstream: self.name.clone(),
            _permit: permit,
        })
    }

    async fn pace(&self) {
        let mut last_call_at = self.last_call_at.lock().await;

        if let Some(previous) = *last_call_at {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                trace!(
                    upstream = %self.name,
                    wait_ms = u64::try_from(ready_at.duration_since(Instant::now()).as_millis()).unwrap_or(u64::MAX),
                    "Pacing upstream call"
                );
                tokio::time::sleep_until(ready_at).await;
            }
        }

        *last_call_at = Some(Instant::now());
    }

    pub fn snapshot(&self) -> GateSnapshot {
        GateSnapshot {
            upstream: self.name.clone(),
            in_flight: self.in_flight(),
            max_concurrent: self.limits.max_concurrent,
            requests_per_second: self.limits.requests_per_second,
            closed: self.is_closed(),
        }
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

/// Point-in-time view of a gate, for inspection endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateSnapshot {
    pub upstream: String,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub requests_per_second: f64,
    pub closed: bool,
}

/// A granted slot on an upstream gate. The slot is freed on drop.
#[derive(Debug)]
pub struct ThrottlePermit {
    upstream: String,
    _permit: OwnedSemaphorePermit,
}

impl ThrottlePermit {
    pub fn upstream(&self) -> &str {
        &self.upstream
    }
}

/// Holds one gate per upstream name.
#[derive(Debug)]
pub struct UpstreamThrottleRegistry {
    gates: DashMap<String, Arc<UpstreamGate>>,
    limits: UpstreamTable,
    closed: AtomicBool,
}

impl UpstreamThrottleRegistry {
    pub fn new(limits: UpstreamTable) -> Self {
        Self {
            gates: DashMap::new(),
            limits,
            closed: AtomicBool::new(false),
        }
    }

    /// Get the gate for `upstream`, creating it on first use.
    ///
    /// Concurrent first callers all receive the same gate.
    pub fn gate_for(&self, upstream: &str) -> Arc<UpstreamGate> {
        if let Some(gate) = self.gates.get(upstream) {
            return gate.clone();
        }

        self.gates
            .entry(upstream.to_string())
            .or_insert_with(|| {
                let limits = *self.limits.limits_for(upstream);
                debug!(
                    upstream = %upstream,
                    max_concurrent = limits.max_concurrent,
                    requests_per_second = limits.requests_per_second,
                    "Creating upstream gate"
                );
                let gate = UpstreamGate::new(upstream, limits);
                if self.closed.load(Ordering::SeqCst) {
                    gate.close();
                }
                Arc::new(gate)
            })
            .clone()
    }

    /// Close every gate. Pending and future acquisitions fail with `Closed`.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        for gate in self.gates.iter() {
            gate.close();
        }
        info!(gates = self.gates.len(), "Upstream gates closed");
    }

    pub fn limits(&self) -> &UpstreamTable {
        &self.limits
    }

    /// Snapshots of every gate created so far, sorted by upstream name.
    pub fn snapshot(&self) -> Vec<GateSnapshot> {
        let mut gates: Vec<GateSnapshot> = self.gates.iter().map(|gate| gate.snapshot()).collect();
        gates.sort_by(|a, b| a.upstream.cmp(&b.upstream));
        gates
    }

    /// Get the number of gates created so far.
    pub fn gate_count(&self) -> usize {
        self.gates.len()
    }
}

impl Default for UpstreamThrottleRegistry {
    fn default() -> Self {
        Self::new(UpstreamTable::default())
    }
}
