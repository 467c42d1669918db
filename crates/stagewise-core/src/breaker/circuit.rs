//! Per-backend circuit breaker
//!
//! Closed until `failure_threshold` consecutive transient failures land
//! within `failure_window`, then Open for a cooldown that doubles with each
//! consecutive trip (capped). Once the cooldown elapses exactly one probe is
//! admitted (HalfOpen); its success closes the circuit, its failure re-opens
//! it. A probe dropped without a verdict is handed back through
//! [`CallGuard`].

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{error, info};

use crate::config::BreakerConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSettings {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl From<&BreakerConfig> for CircuitSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            failure_window: Duration::from_secs(config.failure_window_secs),
            cooldown: Duration::from_secs(config.cooldown_secs),
            max_cooldown: Duration::from_secs(config.max_cooldown_secs.max(config.cooldown_secs)),
        }
    }
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self::from(&BreakerConfig::default())
    }
}

/// Admission ticket returned by [`CircuitBreaker::try_acquire`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPermit {
    /// Ordinary call through a closed circuit
    Normal,
    /// The single half-open probe
    Probe,
}

/// Claimed admission that must end in a verdict
///
/// Dropping the guard without [`CallGuard::succeed`] or [`CallGuard::fail`]
/// (cancellation, a timeout around the caller, an aborted task) gives the
/// permit back, so a half-open circuit can admit its next probe.
#[derive(Debug)]
#[must_use = "dropping the guard releases the permit without a verdict"]
pub struct CallGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: CallPermit,
    settled: bool,
}

impl CallGuard<'_> {
    pub fn permit(&self) -> CallPermit {
        self.permit
    }

    pub fn succeed(mut self) {
        self.settled = true;
        self.breaker.record_success(self.permit);
    }

    pub fn fail(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.permit);
    }
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.permit);
        }
    }
}

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u32,
    /// When an open circuit admits its probe
    pub retry_at: Option<Instant>,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    trips: u32,
    retry_at: Option<Instant>,
    probe_in_flight: bool,
    settings: CircuitSettings,
}

/// Circuit breaker for a single backend
#[derive(Debug)]
pub struct CircuitBreaker {
    backend: String,
    inner: Mutex<BreakerInner>,
    metrics: Arc<MetricsRegistry>,
}

impl CircuitBreaker {
    pub fn new(
        backend: impl Into<String>,
        settings: CircuitSettings,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            backend: backend.into(),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                last_failure: None,
                trips: 0,
                retry_at: None,
                probe_in_flight: false,
                settings,
            }),
            metrics,
        }
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Swap in new thresholds; they apply from the next recorded outcome
    pub fn configure(&self, settings: CircuitSettings) {
        let mut inner = self.lock();
        if inner.settings != settings {
            inner.settings = settings;
            info!(backend = %self.backend, "Circuit settings updated");
        }
    }

    pub fn settings(&self) -> CircuitSettings {
        self.lock().settings
    }

    /// Admit a call, returning a guard that settles or releases the permit
    pub fn acquire(&self) -> Result<CallGuard<'_>> {
        let permit = self.try_acquire()?;
        Ok(CallGuard {
            breaker: self,
            permit,
            settled: false,
        })
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.metrics
            .record_circuit_transition(&self.backend, from.as_str(), to.as_str());
    }

    /// Admit a call or fail fast with [`Error::CircuitOpen`]
    ///
    /// The caller owns the verdict; prefer [`CircuitBreaker::acquire`].
    pub fn try_acquire(&self) -> Result<CallPermit> {
        let now = Instant::now();
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(CallPermit::Normal),
            CircuitState::Open => {
                if inner.retry_at.is_some_and(|at| now >= at) {
                    self.transition(&mut inner, CircuitState::HalfOpen);
                    inner.probe_in_flight = true;
                    info!(backend = %self.backend, "Circuit half-open, admitting probe");
                    Ok(CallPermit::Probe)
                } else {
                    Err(Error::CircuitOpen(self.backend.clone()))
                }
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    Err(Error::CircuitOpen(self.backend.clone()))
                } else {
                    inner.probe_in_flight = true;
                    Ok(CallPermit::Probe)
                }
            }
        }
    }

    /// Whether a call would currently be admitted, without claiming a permit
    pub fn is_call_permitted(&self) -> bool {
        let now = Instant::now();
        let inner = self.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => inner.retry_at.is_some_and(|at| now >= at),
            CircuitState::HalfOpen => !inner.probe_in_flight,
        }
    }

    pub fn record_success(&self, permit: CallPermit) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        inner.last_failure = None;

        if permit == CallPermit::Probe && inner.state == CircuitState::HalfOpen {
            inner.probe_in_flight = false;
            inner.trips = 0;
            inner.retry_at = None;
            self.transition(&mut inner, CircuitState::Closed);
            info!(backend = %self.backend, "Circuit closed after successful probe");
        }
    }

    pub fn record_failure(&self, permit: CallPermit) {
        let now = Instant::now();
        let mut inner = self.lock();

        match (inner.state, permit) {
            (CircuitState::HalfOpen, CallPermit::Probe) => {
                inner.probe_in_flight = false;
                self.trip(&mut inner, now);
            }
            (CircuitState::Closed, _) => {
                let settings = inner.settings;
                let within_window = inner
                    .last_failure
                    .is_some_and(|last| now.saturating_duration_since(last) <= settings.failure_window);
                inner.consecutive_failures = if within_window {
                    inner.consecutive_failures + 1
                } else {
                    1
                };
                inner.last_failure = Some(now);

                if inner.consecutive_failures >= settings.failure_threshold {
                    self.trip(&mut inner, now);
                }
            }
            // Late results from calls admitted before a trip
            _ => {}
        }
    }

    /// Give back a probe whose call never produced a verdict (cancelled)
    pub fn release(&self, permit: CallPermit) {
        if permit == CallPermit::Probe {
            self.lock().probe_in_flight = false;
        }
    }

    fn trip(&self, inner: &mut BreakerInner, now: Instant) {
        inner.trips = inner.trips.saturating_add(1);
        let factor = 1u32 << (inner.trips - 1).min(16);
        let cooldown = inner
            .settings
            .cooldown
            .saturating_mul(factor)
            .min(inner.settings.max_cooldown);
        // None: the cooldown runs past the clock's range, so the circuit stays open
        inner.retry_at = now.checked_add(cooldown);
        inner.consecutive_failures = 0;
        inner.last_failure = None;
        self.transition(inner, CircuitState::Open);

        error!(
            backend = %self.backend,
            trips = inner.trips,
            cooldown_ms = cooldown.as_millis() as u64,
            "Circuit OPENED"
        );
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
            retry_at: inner.retry_at,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }
}
