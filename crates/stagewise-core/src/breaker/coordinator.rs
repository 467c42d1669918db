//! Breaker registry - guarded, retried, cancellable backend calls

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::circuit::{CircuitBreaker, CircuitSettings, CircuitSnapshot, CircuitState};
use super::retry::{BackendError, RetryPolicy};
use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;

/// A successful guarded call
#[derive(Debug, Clone)]
pub struct Invocation<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    /// Latency of the successful attempt
    pub latency: Duration,
}

/// Per-backend breakers, concurrency limits and retry policy
///
/// Thresholds and retry policy follow the live config on every call. The
/// concurrency limit is fixed when a backend is first seen.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    limits: DashMap<String, Arc<Semaphore>>,
    config: ConfigHandle,
    metrics: Arc<MetricsRegistry>,
}

impl BreakerRegistry {
    pub fn new(config: ConfigHandle, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            breakers: DashMap::new(),
            limits: DashMap::new(),
            config,
            metrics,
        }
    }

    pub fn circuit_settings(&self) -> CircuitSettings {
        CircuitSettings::from(&self.config.snapshot().breaker)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from(&self.config.snapshot().breaker)
    }

    /// Breaker for a backend, created on first use
    pub fn breaker(&self, backend_id: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(backend_id) {
            return Arc::clone(existing.value());
        }
        self.breakers
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    backend_id,
                    self.circuit_settings(),
                    Arc::clone(&self.metrics),
                ))
            })
            .clone()
    }

    fn limit(&self, backend_id: &str) -> Arc<Semaphore> {
        self.limits
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                let permits = self.config.snapshot().breaker.max_concurrency_per_backend.max(1);
                Arc::new(Semaphore::new(permits))
            })
            .clone()
    }

    /// Whether a call to `backend_id` would be admitted right now
    pub fn is_call_permitted(&self, backend_id: &str) -> bool {
        self.breakers
            .get(backend_id)
            .map(|b| b.is_call_permitted())
            .unwrap_or(true)
    }

    pub fn state(&self, backend_id: &str) -> CircuitState {
        self.breakers
            .get(backend_id)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn snapshot(&self, backend_id: &str) -> Option<CircuitSnapshot> {
        self.breakers.get(backend_id).map(|b| b.snapshot())
    }

    /// Run `operation` against a backend under its breaker
    ///
    /// Transient failures are retried with jittered backoff up to the
    /// policy's attempt limit; permanent failures return at once. An open
    /// circuit fails fast with [`Error::CircuitOpen`] without calling.
    /// Cancellation or the deadline aborts the in-flight attempt and any
    /// remaining retries. Dropping the returned future mid-call hands a
    /// half-open probe slot back to the breaker.
    pub async fn execute<T, F, Fut>(
        &self,
        backend_id: &str,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
        mut operation: F,
    ) -> Result<Invocation<T>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = std::result::Result<T, BackendError>>,
    {
        let breaker = self.breaker(backend_id);
        breaker.configure(self.circuit_settings());
        let retry = self.retry_policy();
        let limit = self.limit(backend_id);
        let mut attempt = 0;

        loop {
            attempt += 1;
            check_run(cancel, deadline)?;

            // Released on every early return below
            let guard = breaker.acquire()?;

            let _slot = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = wait_for(deadline) => return Err(Error::DeadlineExceeded),
                slot = limit.acquire() => slot.map_err(|_| Error::Cancelled)?,
            };

            self.metrics.record_backend_invocation();
            let started = Instant::now();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(backend = %backend_id, attempt, "Backend call cancelled");
                    return Err(Error::Cancelled);
                }
                _ = wait_for(deadline) => {
                    debug!(backend = %backend_id, attempt, "Backend call hit deadline");
                    return Err(Error::DeadlineExceeded);
                }
                outcome = operation(attempt) => outcome,
            };
            let latency = started.elapsed();

            let err = match outcome {
                Ok(value) => {
                    guard.succeed();
                    return Ok(Invocation {
                        value,
                        attempts: attempt,
                        latency,
                    });
                }
                Err(err) => err,
            };

            if !err.is_transient() {
                // The backend answered; only the request was bad
                guard.succeed();
                debug!(backend = %backend_id, error = %err, "Permanent backend failure");
                return Err(err.into_error(backend_id));
            }

            guard.fail();
            if !retry.should_retry(attempt, &err) {
                warn!(
                    backend = %backend_id,
                    attempts = attempt,
                    error = %err,
                    "Backend retries exhausted"
                );
                return Err(err.into_error(backend_id));
            }

            let delay = retry.delay_for(attempt);
            warn!(
                backend = %backend_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after transient error"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = wait_for(deadline) => return Err(Error::DeadlineExceeded),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl std::fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("backends", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

/// Fail if the run was cancelled or its deadline has passed
pub(crate) fn check_run(cancel: &CancellationToken, deadline: Option<Instant>) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    if deadline.is_some_and(|at| Instant::now() >= at) {
        return Err(Error::DeadlineExceeded);
    }
    Ok(())
}

/// Resolve at `deadline`, never if there is none
pub(crate) async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BreakerConfig, Config};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn registry(config: BreakerConfig) -> (Arc<BreakerRegistry>, Arc<MetricsRegistry>) {
        let (registry, metrics, _) = registry_with_handle(config);
        (registry, metrics)
    }

    fn registry_with_handle(config: BreakerConfig) -> (Arc<BreakerRegistry>, Arc<MetricsRegistry>, ConfigHandle) {
        let metrics = Arc::new(MetricsRegistry::new());
        let handle = ConfigHandle::new(Config {
            breaker: config,
            ..Config::default()
        });
        let registry = BreakerRegistry::new(handle.clone(), metrics.clone());
        (Arc::new(registry), metrics, handle)
    }

    async fn trip(registry: &BreakerRegistry, backend: &str) {
        let cancel = CancellationToken::new();
        while registry.state(backend) != CircuitState::Open {
            let _ = registry
                .execute(backend, &cancel, None, |_| async {
                    Err::<(), _>(BackendError::timeout())
                })
                .await;
        }
    }

    fn single_attempt() -> BreakerConfig {
        BreakerConfig {
            max_attempts: 1,
            ..BreakerConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_fail_after_threshold() {
        let (registry, metrics) = registry(single_attempt());
        let cancel = CancellationToken::new();
        let calls = &AtomicU32::new(0);

        for _ in 0..5 {
            let err = registry
                .execute("gpu-a", &cancel, None, move |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(BackendError::from_status(503, "overloaded"))
                })
                .await
                .unwrap_err();
            assert_eq!(err.code(), "E100");
        }
        assert_eq!(registry.state("gpu-a"), CircuitState::Open);
        assert!(!registry.is_call_permitted("gpu-a"));

        let err = registry
            .execute("gpu-a", &cancel, None, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E102");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert_eq!(metrics.backend_invocations(), 5);

        // Other backends are unaffected
        assert!(registry.is_call_permitted("gpu-b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exactly_one_half_open_probe() {
        let (registry, _) = registry(single_attempt());
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let _ = registry
                .execute("gpu-a", &cancel, None, move |_| async move {
                    Err::<(), _>(BackendError::timeout())
                })
                .await;
        }
        tokio::time::advance(Duration::from_secs(30)).await;

        let probes = Arc::new(AtomicU32::new(0));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let registry = Arc::clone(&registry);
            let probes = Arc::clone(&probes);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .execute("gpu-a", &cancel, None, |_| {
                        let probes = Arc::clone(&probes);
                        async move {
                            probes.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            Ok::<_, BackendError>("ok")
                        }
                    })
                    .await
            }));
        }

        let mut admitted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(err) => {
                    assert_eq!(err.code(), "E102");
                    rejected += 1;
                }
            }
        }

        assert_eq!(probes.load(Ordering::SeqCst), 1);
        assert_eq!(admitted, 1);
        assert_eq!(rejected, 3);
        assert_eq!(registry.state("gpu-a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_probe_frees_half_open_slot() {
        let (registry, _) = registry(single_attempt());
        let cancel = CancellationToken::new();
        trip(&registry, "gpu-a").await;
        tokio::time::advance(Duration::from_secs(31)).await;

        // The caller gives up on the probe long before the backend answers
        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            registry.execute("gpu-a", &cancel, None, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BackendError>(())
            }),
        )
        .await;
        assert!(abandoned.is_err());

        assert_eq!(registry.state("gpu-a"), CircuitState::HalfOpen);
        assert!(registry.is_call_permitted("gpu-a"));
        registry
            .execute("gpu-a", &cancel, None, |_| async { Ok::<_, BackendError>("ok") })
            .await
            .unwrap();
        assert_eq!(registry.state("gpu-a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_probe_frees_half_open_slot() {
        let (registry, _) = registry(single_attempt());
        trip(&registry, "gpu-a").await;
        tokio::time::advance(Duration::from_secs(30)).await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let err = registry
            .execute("gpu-a", &cancel, None, |_| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, BackendError>(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), "E500");
        assert!(registry.is_call_permitted("gpu-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_thresholds_follow_config_reload() {
        let (registry, _, handle) = registry_with_handle(single_attempt());
        let cancel = CancellationToken::new();
        let failing = |_| async { Err::<(), _>(BackendError::timeout()) };

        let _ = registry.execute("gpu-a", &cancel, None, failing).await;
        assert_eq!(registry.state("gpu-a"), CircuitState::Closed);

        handle
            .update(|config| {
                config.breaker.failure_threshold = 1;
                config.breaker.max_attempts = 2;
                Ok(())
            })
            .unwrap();

        let _ = registry.execute("gpu-b", &cancel, None, failing).await;
        assert_eq!(registry.state("gpu-b"), CircuitState::Open);

        // Existing breakers pick the change up on their next call
        let _ = registry.execute("gpu-a", &cancel, None, failing).await;
        assert_eq!(registry.state("gpu-a"), CircuitState::Open);
        assert_eq!(registry.retry_policy().max_attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried() {
        let (registry, _) = registry(BreakerConfig::default());
        let cancel = CancellationToken::new();
        let calls = &AtomicU32::new(0);

        let err = registry
            .execute("gpu-a", &cancel, None, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::from_status(422, "unprocessable"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "E101");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.state("gpu-a"), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retry_until_success() {
        let (registry, _) = registry(BreakerConfig::default());
        let cancel = CancellationToken::new();

        let invocation = registry
            .execute("gpu-a", &cancel, None, |attempt| async move {
                if attempt < 3 {
                    Err(BackendError::connection("reset by peer"))
                } else {
                    Ok(attempt * 10)
                }
            })
            .await
            .unwrap();

        assert_eq!(invocation.value, 30);
        assert_eq!(invocation.attempts, 3);
        assert_eq!(registry.state("gpu-a"), CircuitState::Closed);
        assert_eq!(registry.snapshot("gpu-a").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_are_bounded() {
        let (registry, _) = registry(BreakerConfig::default());
        let cancel = CancellationToken::new();
        let calls = &AtomicU32::new(0);

        let err = registry
            .execute("gpu-a", &cancel, None, move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(BackendError::timeout())
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_in_flight_call() {
        let (registry, _) = registry(BreakerConfig::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let err = registry
            .execute("gpu-a", &cancel, None, move |_| async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok::<_, BackendError>(())
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "E500");
        assert!(started.elapsed() < Duration::from_secs(1));
        // Cancellation is not a backend failure
        assert_eq!(registry.snapshot("gpu-a").unwrap().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_suppresses_retries() {
        let (registry, _) = registry(BreakerConfig {
            max_attempts: 10,
            ..BreakerConfig::default()
        });
        let cancel = CancellationToken::new();
        let calls = &AtomicU32::new(0);
        let deadline = Instant::now() + Duration::from_millis(50);

        // Each attempt takes 30ms, so the deadline lands in the second one
        // or in the backoff before it
        let err = registry
            .execute("gpu-a", &cancel, Some(deadline), move |_| async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                Err::<(), _>(BackendError::timeout())
            })
            .await
            .unwrap_err();

        assert_eq!(err.code(), "E501");
        assert!(calls.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_limit_per_backend() {
        let (registry, _) = registry(BreakerConfig {
            max_concurrency_per_backend: 2,
            ..BreakerConfig::default()
        });
        let in_flight = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let registry = Arc::clone(&registry);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                registry
                    .execute("gpu-a", &cancel, None, |_| {
                        let in_flight = Arc::clone(&in_flight);
                        let peak = Arc::clone(&peak);
                        async move {
                            let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(now, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            in_flight.fetch_sub(1, Ordering::SeqCst);
                            Ok::<_, BackendError>(())
                        }
                    })
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }
}
