//! Outbound call throttling.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use super::registry::{ThrottlePermit, UpstreamGate, UpstreamThrottleRegistry};

/// Errors raised by the throttle itself, never by the wrapped operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ThrottleError {
    #[error("Timed out after {waited:?} waiting to call upstream '{upstream}'")]
    Timeout { upstream: String, waited: Duration },
    #[error("Upstream gate '{upstream}' is closed")]
    Closed { upstream: String },
}

/// Runs calls to external dependencies through their upstream gate.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Debug, Clone)]
pub struct OutboundThrottler {
    registry: Arc<UpstreamThrottleRegistry>,
}

impl OutboundThrottler {
    pub fn new(registry: Arc<UpstreamThrottleRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<UpstreamThrottleRegistry> {
        &self.registry
    }

    /// Get the gate for an upstream, creating it on first use.
    pub fn gate(&self, upstream: &str) -> Arc<UpstreamGate> {
        self.registry.gate_for(upstream)
    }

    /// Wait until a call to `upstream` may start and hold its slot.
    ///
    /// The slot is released when the permit is dropped.
    pub async fn admit(&self, upstream: &str) -> Result<ThrottlePermit, ThrottleError> {
        self.registry.gate_for(upstream).acquire().await
    }

    /// Run `operation` once the upstream's concurrency and pacing allow it.
    ///
    /// The operation's output is returned as-is, including its own errors.
    /// The slot is released on every exit path, including cancellation of the
    /// returned future and panics inside `operation`.
    pub async fn execute<F, Fut>(&self, upstream: &str, operation: F) -> Result<Fut::Output, ThrottleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permit = self.admit(upstream).await?;
        let output = operation().await;
        drop(permit);
        Ok(output)
    }

    /// Like `execute`, but give up if no slot is granted within `wait`.
    ///
    /// The deadline covers queueing and pacing only; once started, the
    /// operation runs to completion.
    pub async fn execute_with_timeout<F, Fut>(
        &self,
        upstream: &str,
        wait: Duration,
        operation: F,
    ) -> Result<Fut::Output, ThrottleError>
    where
        F: FnOnce() -> Fut,
        Fut: Future,
    {
        let permit = match tokio::time::timeout(wait, self.admit(upstream)).await {
            Ok(permit) => permit?,
            Err(_) => {
                warn!(upstream = %upstream, waited_ms = wait.as_millis() as u64, "Gave up waiting for upstream slot");
                return Err(ThrottleError::Timeout {
                    upstream: upstream.to_string(),
                    waited: wait,
                });
            }
        };

        let output = operation().await;
        drop(permit);
        Ok(output)
    }
}

impl Default for OutboundThrottler {
    fn default() -> Self {
        Self::new(Arc::new(UpstreamThrottleRegistry::default()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::registry::{UpstreamLimits, UpstreamTable};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;
    use tokio::time::{sleep, Instant};
    use tokio_test::{assert_pending, task};

    fn throttler_with(name: &str, limits: UpstreamLimits) -> OutboundThrottler {
        let table = UpstreamTable::new(UpstreamLimits::new(1, 0.0)).with_upstream(name, limits);
        OutboundThrottler::new(Arc::new(UpstreamThrottleRegistry::new(table)))
    }

    /// Tracks how many operations run at once and the highest level reached.
    #[derive(Default)]
    struct ConcurrencyProbe {
        current: AtomicUsize,
        peak: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
    }

    impl ConcurrencyProbe {
        async fn run(&self, hold: Duration) {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.starts.lock().await.push(Instant::now());
            sleep(hold).await;
            self.current.fetch_sub(1, Ordering::SeqCst);
        }

        async fn sorted_starts(&self) -> Vec<Instant> {
            let mut starts = self.starts.lock().await.clone();
            starts.sort();
            starts
        }
    }

    async fn run_callers(throttler: &OutboundThrottler, probe: &Arc<ConcurrencyProbe>, upstream: &str, callers: usize, hold: Duration) {
        let tasks: Vec<_> = (0..callers)
            .map(|_| {
                let throttler = throttler.clone();
                let probe = probe.clone();
                let upstream = upstream.to_string();
                tokio::spawn(async move {
                    throttler
                        .execute(&upstream, || async move { probe.run(hold).await })
                        .await
                })
            })
            .collect();

        for result in futures::future::join_all(tasks).await {
            result.unwrap().unwrap();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_never_exceeds_limit() {
        let throttler = throttler_with("terminology", UpstreamLimits::new(3, 0.0));
        let probe = Arc::new(ConcurrencyProbe::default());

        run_callers(&throttler, &probe, "terminology", 10, Duration::from_millis(100)).await;

        assert_eq!(probe.peak.load(Ordering::SeqCst), 3);
        assert_eq!(throttler.gate("terminology").in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_calls_are_spaced_by_min_interval() {
        let throttler = throttler_with("loinc", UpstreamLimits::new(10, 10.0));
        let probe = Arc::new(ConcurrencyProbe::default());

        run_callers(&throttler, &probe, "loinc", 6, Duration::from_millis(5)).await;

        let starts = probe.sorted_starts().await;
        assert_eq!(starts.len(), 6);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(100));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_rxnorm_scenario() {
        let throttler = throttler_with("rxnorm", UpstreamLimits::new(2, 5.0));
        let probe = Arc::new(ConcurrencyProbe::default());
        let began = Instant::now();

        let background = {
            let throttler = throttler.clone();
            let probe = probe.clone();
            tokio::spawn(async move {
                run_callers(&throttler, &probe, "rxnorm", 5, Duration::from_secs(1)).await;
            })
        };

        // Two callers hold the permits; the other three are still queued.
        sleep(Duration::from_millis(300)).await;
        assert_eq!(probe.starts.lock().await.len(), 2);
        assert_eq!(throttler.gate("rxnorm").in_flight(), 2);

        background.await.unwrap();

        assert!(probe.peak.load(Ordering::SeqCst) <= 2);
        let starts = probe.sorted_starts().await;
        assert_eq!(starts.len(), 5);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(200));
        }
        assert!(began.elapsed() >= Duration::from_millis(800));
    }

    #[tokio::test]
    async fn test_operation_errors_propagate_and_release() {
        let throttler = throttler_with("payments", UpstreamLimits::new(1, 0.0));

        let result: Result<Result<(), String>, ThrottleError> = throttler
            .execute("payments", || async { Err("card declined".to_string()) })
            .await;

        assert_eq!(result, Ok(Err("card declined".to_string())));
        assert_eq!(throttler.gate("payments").in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_queued_does_not_take_permit() {
        let throttler = throttler_with("snomed", UpstreamLimits::new(1, 0.0));
        let held = throttler.admit("snomed").await.unwrap();

        let mut queued = task::spawn(throttler.execute("snomed", || async {}));
        assert_pending!(queued.poll());
        drop(queued);

        assert_eq!(throttler.gate("snomed").in_flight(), 1);
        drop(held);
        assert_eq!(throttler.gate("snomed").in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_while_pacing_releases_permit() {
        let throttler = throttler_with("snomed", UpstreamLimits::new(2, 0.5));
        let first = throttler.admit("snomed").await.unwrap();

        // Second caller gets a permit, then waits two seconds on the pacer.
        let mut pacing = task::spawn(throttler.execute("snomed", || async {}));
        assert_pending!(pacing.poll());
        assert_eq!(throttler.gate("snomed").in_flight(), 2);

        drop(pacing);
        assert_eq!(throttler.gate("snomed").in_flight(), 1);
        drop(first);
        assert_eq!(throttler.gate("snomed").in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_with_timeout_gives_up() {
        let throttler = throttler_with("payments", UpstreamLimits::new(1, 0.0));
        let _held = throttler.admit("payments").await.unwrap();

        let result = throttler
            .execute_with_timeout("payments", Duration::from_millis(50), || async { 7 })
            .await;

        assert_eq!(
            result,
            Err(ThrottleError::Timeout {
                upstream: "payments".to_string(),
                waited: Duration::from_millis(50),
            })
        );
        assert_eq!(throttler.gate("payments").in_flight(), 1);
    }

    #[tokio::test]
    async fn test_execute_with_timeout_runs_when_free() {
        let throttler = throttler_with("payments", UpstreamLimits::new(1, 0.0));
        let result = throttler
            .execute_with_timeout("payments", Duration::from_secs(1), || async { 7 })
            .await;
        assert_eq!(result, Ok(7));
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let throttler = throttler_with("rxnorm", UpstreamLimits::new(1, 0.0));
        let held = throttler.admit("rxnorm").await.unwrap();

        let waiter = {
            let throttler = throttler.clone();
            tokio::spawn(async move { throttler.execute("rxnorm", || async {}).await })
        };
        tokio::task::yield_now().await;

        throttler.registry().shutdown();
        let result = waiter.await.unwrap();
        assert_eq!(
            result,
            Err(ThrottleError::Closed {
                upstream: "rxnorm".to_string()
            })
        );
        drop(held);
    }
}
