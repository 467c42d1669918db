//! Reward ledger - per (tenant, task, arm) outcome statistics
//!
//! The ledger owns the Beta posteriors the bandit samples from. Updates land
//! in a sharded in-memory map and are persisted write-behind: every updated
//! key is marked dirty and a background flusher writes dirty keys to the
//! [`KeyValueStore`] on an interval (or early, once a batch has built up).
//! A failed write leaves the key dirty and the flusher backs off; callers
//! recording outcomes are never blocked by persistence.

mod reward;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LedgerConfig;
use crate::error::{Error, Result};
use crate::metrics::MetricsRegistry;
use crate::storage::KeyValueStore;

pub use reward::RewardWeights;

/// Key prefix for persisted posteriors
pub const LEDGER_PREFIX: &str = "ledger/";

/// Identifies one posterior: a backend arm for a tenant's task
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LedgerKey {
    pub tenant: String,
    pub task: String,
    pub arm: String,
}

impl LedgerKey {
    pub fn new(tenant: impl Into<String>, task: impl Into<String>, arm: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            task: task.into(),
            arm: arm.into(),
        }
    }

    /// Key under which this posterior is persisted
    pub fn storage_key(&self) -> String {
        format!(
            "{}{}/{}/{}",
            LEDGER_PREFIX,
            escape_segment(&self.tenant),
            escape_segment(&self.task),
            escape_segment(&self.arm)
        )
    }
}

/// Keep `/` out of key segments so distinct triples never collide
fn escape_segment(segment: &str) -> String {
    segment.replace('%', "%25").replace('/', "%2F")
}

/// Beta posterior plus running outcome statistics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PosteriorState {
    pub key: LedgerKey,
    /// Beta alpha (pseudo-successes), always > 0
    pub alpha: f64,
    /// Beta beta (pseudo-failures), always > 0
    pub beta: f64,
    pub trials: u64,
    /// Outcomes with reward above 0.5
    pub successes: u64,
    pub reward_sum: f64,
    pub avg_cost: f64,
    pub avg_latency_ms: f64,
    pub last_updated: DateTime<Utc>,
}

impl PosteriorState {
    /// Non-informative prior Beta(1, 1)
    pub fn prior(key: LedgerKey) -> Self {
        Self {
            key,
            alpha: 1.0,
            beta: 1.0,
            trials: 0,
            successes: 0,
            reward_sum: 0.0,
            avg_cost: 0.0,
            avg_latency_ms: 0.0,
            last_updated: Utc::now(),
        }
    }

    /// Fold one observation into the posterior
    pub fn update(&mut self, reward: f64, cost: f64, latency: Duration) {
        let reward = if reward.is_nan() {
            0.0
        } else {
            reward.clamp(0.0, 1.0)
        };

        self.alpha += reward;
        self.beta += 1.0 - reward;

        self.trials += 1;
        if reward > 0.5 {
            self.successes += 1;
        }
        self.reward_sum += reward;

        let n = self.trials as f64;
        let cost = if cost.is_finite() { cost.max(0.0) } else { 0.0 };
        self.avg_cost += (cost - self.avg_cost) / n;
        self.avg_latency_ms += (latency.as_secs_f64() * 1000.0 - self.avg_latency_ms) / n;
        self.last_updated = Utc::now();
    }

    /// Posterior mean alpha / (alpha + beta)
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    /// Standard deviation of the Beta distribution
    pub fn uncertainty(&self) -> f64 {
        let ab = self.alpha + self.beta;
        ((self.alpha * self.beta) / (ab * ab * (ab + 1.0))).sqrt()
    }

    /// Mean observed reward, 0.5 before any trial
    pub fn mean_reward(&self) -> f64 {
        if self.trials == 0 {
            return 0.5;
        }
        self.reward_sum / self.trials as f64
    }
}

/// Durable, append-and-aggregate store of outcome statistics
pub struct RewardLedger {
    posteriors: DashMap<LedgerKey, PosteriorState>,
    dirty: DashSet<LedgerKey>,
    store: Option<Arc<dyn KeyValueStore>>,
    config: LedgerConfig,
    metrics: Arc<MetricsRegistry>,
    flush_requested: Notify,
    consecutive_failures: AtomicU32,
}

impl RewardLedger {
    /// Create a ledger without durable storage
    pub fn new(config: LedgerConfig, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            posteriors: DashMap::new(),
            dirty: DashSet::new(),
            store: None,
            config,
            metrics,
            flush_requested: Notify::new(),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// In-memory ledger with default settings
    pub fn in_memory() -> Self {
        Self::new(LedgerConfig::default(), Arc::new(MetricsRegistry::new()))
    }

    /// Attach a durable store for write-behind persistence
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Reward blend weights in effect
    pub fn reward_weights(&self) -> &RewardWeights {
        &self.config.reward_weights
    }

    /// Record an outcome and return the updated posterior
    ///
    /// Only touches memory; persistence happens on the next flush.
    pub fn record_outcome(
        &self,
        tenant: &str,
        task: &str,
        arm: &str,
        reward: f64,
        cost: f64,
        latency: Duration,
    ) -> PosteriorState {
        let key = LedgerKey::new(tenant, task, arm);
        let updated = {
            let mut state = self
                .posteriors
                .entry(key.clone())
                .or_insert_with(|| PosteriorState::prior(key.clone()));
            state.update(reward, cost, latency);
            state.clone()
        };

        debug!(
            tenant = %tenant,
            task = %task,
            arm = %arm,
            reward = reward,
            alpha = updated.alpha,
            beta = updated.beta,
            "Recorded outcome"
        );

        if self.store.is_some() {
            self.dirty.insert(key);
            if self.dirty.len() >= self.config.flush_batch_size {
                self.flush_requested.notify_one();
            }
        }

        updated
    }

    /// Current (alpha, beta) for a triple, (1, 1) if unseen
    pub fn get_posterior(&self, tenant: &str, task: &str, arm: &str) -> (f64, f64) {
        let key = LedgerKey::new(tenant, task, arm);
        self.posteriors
            .get(&key)
            .map(|s| (s.alpha, s.beta))
            .unwrap_or((1.0, 1.0))
    }

    /// Full state for a triple, the prior if unseen
    pub fn snapshot(&self, tenant: &str, task: &str, arm: &str) -> PosteriorState {
        let key = LedgerKey::new(tenant, task, arm);
        match self.posteriors.get(&key) {
            Some(state) => state.clone(),
            None => PosteriorState::prior(key),
        }
    }

    /// All known posteriors for a tenant's task
    pub fn posteriors_for(&self, tenant: &str, task: &str) -> Vec<PosteriorState> {
        let mut states: Vec<PosteriorState> = self
            .posteriors
            .iter()
            .filter(|e| e.key().tenant == tenant && e.key().task == task)
            .map(|e| e.value().clone())
            .collect();
        states.sort_by(|a, b| a.key.arm.cmp(&b.key.arm));
        states
    }

    /// Keys awaiting persistence
    pub fn dirty_count(&self) -> usize {
        self.dirty.len()
    }

    /// Persist every dirty key
    ///
    /// Keys whose write fails stay dirty for the next attempt. Returns the
    /// number of keys written.
    pub async fn flush(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let keys: Vec<LedgerKey> = self.dirty.iter().map(|k| k.key().clone()).collect();
        let mut written = 0;
        let mut failed = 0;
        let mut last_error = None;

        for key in keys {
            // Clear before reading so an update racing with the write re-marks it
            self.dirty.remove(&key);
            let Some(state) = self.posteriors.get(&key).map(|s| s.clone()) else {
                continue;
            };

            let bytes = serde_json::to_vec(&state)?;
            match store.set(&key.storage_key(), bytes).await {
                Ok(()) => written += 1,
                Err(err) => {
                    self.dirty.insert(key);
                    self.metrics.record_persistence_failure();
                    failed += 1;
                    last_error = Some(err);
                }
            }
        }

        if let Some(err) = last_error {
            warn!(written, failed, error = %err, "Ledger flush incomplete");
            return Err(Error::persistence(format!(
                "{} of {} ledger writes failed: {}",
                failed,
                written + failed,
                err
            )));
        }

        if written > 0 {
            debug!(count = written, "Flushed ledger posteriors");
        }
        Ok(written)
    }

    /// Warm in-memory state from the durable store
    ///
    /// Keys already present in memory are kept as they are.
    pub async fn load(&self) -> Result<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };

        let mut loaded = 0;
        for (storage_key, bytes) in store.scan_prefix(LEDGER_PREFIX).await? {
            let state: PosteriorState = match serde_json::from_slice(&bytes) {
                Ok(state) => state,
                Err(err) => {
                    warn!(key = %storage_key, error = %err, "Skipping unreadable posterior");
                    continue;
                }
            };
            if state.alpha <= 0.0 || state.beta <= 0.0 {
                warn!(key = %storage_key, "Skipping posterior with non-positive parameters");
                continue;
            }
            if !self.posteriors.contains_key(&state.key) {
                self.posteriors.insert(state.key.clone(), state);
                loaded += 1;
            }
        }

        info!(count = loaded, "Loaded ledger posteriors from store");
        Ok(loaded)
    }

    /// Delay before the next flush, growing while writes keep failing
    fn next_flush_delay(&self) -> Duration {
        let base = self.config.flush_interval_ms.max(1);
        let failures = self.consecutive_failures.load(Ordering::Relaxed).min(16);
        let delay = base.saturating_mul(1u64 << failures);
        Duration::from_millis(delay.min(self.config.max_backoff_ms.max(base)))
    }

    /// Run the write-behind flusher until `cancel` fires
    ///
    /// A final flush is attempted on shutdown.
    pub fn spawn_flusher(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let delay = ledger.next_flush_delay();
                let backing_off = ledger.consecutive_failures.load(Ordering::Relaxed) > 0;

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                    _ = ledger.flush_requested.notified(), if !backing_off => {}
                }

                match ledger.flush().await {
                    Ok(_) => ledger.consecutive_failures.store(0, Ordering::Relaxed),
                    Err(err) => {
                        let failures = ledger.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            failures,
                            retry_in_ms = ledger.next_flush_delay().as_millis() as u64,
                            error = %err,
                            "Ledger persistence failed, backing off"
                        );
                    }
                }
            }

            if let Err(err) = ledger.flush().await {
                warn!(error = %err, "Final ledger flush failed");
            }
            debug!("Ledger flusher stopped");
        })
    }
}

impl std::fmt::Debug for RewardLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RewardLedger")
            .field("posteriors", &self.posteriors.len())
            .field("dirty", &self.dirty.len())
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
