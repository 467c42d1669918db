//! Pipeline orchestrator - drives ordered stages through budget, cache,
//! routing and breakers
//!
//! For each stage, in order:
//! 1. Stop if the run was cancelled or its deadline passed
//! 2. Reserve budget for the most expensive affordable candidate
//! 3. Probe the cache; on a miss populate once per key: pick an arm, call it
//!    through its breaker, record the outcome to the ledger
//! 4. Settle the reservation against the actual cost
//! 5. Ask the quality gate whether the remaining stages can be skipped
//!
//! Completed stage results are never discarded; later failures only change
//! the run status.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::stage::{StageDefinition, validate_stages};
use super::types::{
    PayloadSource, PipelineResult, PipelineStatus, SkipReason, StageError, StageInput,
    StageResult, StageStatus, TaskContext,
};
use crate::breaker::{BreakerRegistry, wait_for};
use crate::budget::{BudgetDecision, BudgetGovernor, Reservation};
use crate::cache::{CacheOutcome, CacheSource, LayeredCache, ScopedEmbedding, cache_key};
use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::gate::{ConfidenceAccumulator, should_exit};
use crate::ledger::RewardLedger;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use crate::routing::{Arm, BanditPolicy};
use crate::storage::KeyValueStore;

const COST_EPSILON: f64 = 1e-9;

/// Stage payload as kept in the cache
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedStage {
    arm: String,
    payload: Value,
}

impl CachedStage {
    /// Split a cached value into (arm, payload); foreign values pass through
    fn decode(value: Value) -> (Option<String>, Value) {
        match serde_json::from_value::<CachedStage>(value.clone()) {
            Ok(cached) => (Some(cached.arm), cached.payload),
            Err(_) => (None, value),
        }
    }
}

/// Bookkeeping for one stage population
#[derive(Debug, Default)]
struct Attempts {
    count: u32,
    last_arm: Option<String>,
    cost: f64,
}

/// Composes ledger, policy, cache, breakers, budget and gate into runs
///
/// Cheap to share behind an `Arc`; independent runs may execute in parallel.
pub struct Orchestrator {
    config: ConfigHandle,
    metrics: Arc<MetricsRegistry>,
    ledger: Arc<RewardLedger>,
    policy: Arc<BanditPolicy>,
    cache: Arc<LayeredCache>,
    breakers: Arc<BreakerRegistry>,
    budget: Arc<BudgetGovernor>,
}

/// Builder for [`Orchestrator`]
#[derive(Default)]
pub struct OrchestratorBuilder {
    config: Option<ConfigHandle>,
    metrics: Option<Arc<MetricsRegistry>>,
    store: Option<Arc<dyn KeyValueStore>>,
    seed: Option<u64>,
}

impl OrchestratorBuilder {
    pub fn with_config(mut self, config: ConfigHandle) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Durable store shared by the ledger and the cache's write-through tier
    pub fn with_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Fixed seed for the bandit sampler
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn build(self) -> Orchestrator {
        let config = self.config.unwrap_or_default();
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(MetricsRegistry::new()));
        let snapshot = config.snapshot();

        let mut ledger = RewardLedger::new(snapshot.ledger.clone(), Arc::clone(&metrics));
        let mut cache = LayeredCache::new(config.clone(), Arc::clone(&metrics));
        if let Some(store) = self.store {
            ledger = ledger.with_store(Arc::clone(&store));
            cache = cache.with_store(store);
        }
        let ledger = Arc::new(ledger);

        let mut policy = BanditPolicy::new(Arc::clone(&ledger), config.clone(), Arc::clone(&metrics));
        if let Some(seed) = self.seed {
            policy = policy.with_seed(seed);
        }

        Orchestrator {
            breakers: Arc::new(BreakerRegistry::new(config.clone(), Arc::clone(&metrics))),
            budget: Arc::new(BudgetGovernor::new(config.clone(), Arc::clone(&metrics))),
            cache: Arc::new(cache),
            policy: Arc::new(policy),
            ledger,
            metrics,
            config,
        }
    }
}

impl Orchestrator {
    pub fn builder() -> OrchestratorBuilder {
        OrchestratorBuilder::default()
    }

    /// In-memory orchestrator over the given configuration
    pub fn new(config: ConfigHandle) -> Self {
        Self::builder().with_config(config).build()
    }

    pub fn config(&self) -> &ConfigHandle {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub fn ledger(&self) -> &Arc<RewardLedger> {
        &self.ledger
    }

    pub fn policy(&self) -> &Arc<BanditPolicy> {
        &self.policy
    }

    pub fn cache(&self) -> &Arc<LayeredCache> {
        &self.cache
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    pub fn budget(&self) -> &Arc<BudgetGovernor> {
        &self.budget
    }

    /// Warm posteriors from the durable store
    pub async fn warm_start(&self) -> Result<usize> {
        self.ledger.load().await
    }

    /// Start the ledger's write-behind flusher
    pub fn spawn_flusher(&self, cancel: CancellationToken) -> JoinHandle<()> {
        self.ledger.spawn_flusher(cancel)
    }

    /// Run `stages` in order for one request
    ///
    /// Only configuration problems (no stages, duplicate names, empty
    /// candidate sets) return `Err`. Everything that happens during the run
    /// is reported per stage in the [`PipelineResult`].
    pub async fn run_pipeline(
        &self,
        ctx: &TaskContext,
        stages: &[StageDefinition],
    ) -> Result<PipelineResult> {
        validate_stages(stages)?;

        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let thresholds = self.config.resolve(&ctx.tenant, &ctx.task).gate;
        self.metrics.record_pipeline_run();

        info!(
            run_id = %run_id,
            tenant = %ctx.tenant,
            task = %ctx.task,
            stages = stages.len(),
            status = %PipelineStatus::Started,
            "Pipeline started"
        );

        let mut results: Vec<StageResult> = Vec::with_capacity(stages.len());
        let mut confidence = ConfidenceAccumulator::new();
        let mut total_cost = 0.0;
        let mut early_exit = false;
        let mut aborted = false;
        let mut degraded = false;

        for stage in stages {
            if early_exit || aborted {
                let reason = if early_exit {
                    SkipReason::EarlyExit
                } else {
                    SkipReason::Aborted
                };
                results.push(StageResult::skipped(&stage.name, reason));
                continue;
            }

            debug!(
                run_id = %run_id,
                stage = %stage.name,
                status = %PipelineStatus::InProgress,
                "Advancing pipeline"
            );
            let previous = results
                .iter()
                .rev()
                .find(|r| r.status == StageStatus::Completed);
            let result = self.run_stage(ctx, stage, previous, total_cost).await;

            match result.status {
                StageStatus::Completed => {
                    total_cost += result.cost;
                    confidence.record(result.confidence, stage.weight);
                    if should_exit(&result, &confidence, &thresholds) {
                        early_exit = true;
                        info!(
                            run_id = %run_id,
                            stage = %stage.name,
                            confidence = confidence.value(),
                            completed = confidence.completed(),
                            "Quality gate reached, skipping remaining stages"
                        );
                    }
                }
                StageStatus::Failed => {
                    if ctx.check().is_err() {
                        aborted = true;
                        warn!(run_id = %run_id, stage = %stage.name, "Run interrupted");
                    } else if stage.critical {
                        aborted = true;
                        warn!(run_id = %run_id, stage = %stage.name, "Critical stage failed, aborting run");
                    } else {
                        degraded = true;
                    }
                }
                StageStatus::Skipped => degraded = true,
                StageStatus::Pending | StageStatus::Running => {}
            }
            results.push(result);
        }

        let status = if aborted {
            self.metrics.record_aborted_run();
            PipelineStatus::Aborted
        } else if degraded {
            self.metrics.record_partial_failure();
            PipelineStatus::PartialFailure
        } else {
            PipelineStatus::Completed
        };
        if early_exit {
            self.metrics.record_early_exit();
        }

        let result = PipelineResult {
            run_id,
            tenant: ctx.tenant.clone(),
            task: ctx.task.clone(),
            status,
            stages: results,
            cumulative_confidence: confidence.value(),
            early_exit,
            total_cost,
            elapsed: started.elapsed(),
        };

        info!(
            run_id = %run_id,
            status = %status,
            confidence = result.cumulative_confidence,
            cost = total_cost,
            early_exit,
            elapsed_ms = result.elapsed.as_millis() as u64,
            "Pipeline finished"
        );

        Ok(result)
    }

    async fn run_stage(
        &self,
        ctx: &TaskContext,
        stage: &StageDefinition,
        previous: Option<&StageResult>,
        spent: f64,
    ) -> StageResult {
        let started = Instant::now();
        if let Err(err) = ctx.check() {
            return StageResult::failed(&stage.name, err.code(), err.to_string(), 0, Duration::ZERO);
        }
        debug!(stage = %stage.name, status = %StageStatus::Running, "Stage running");

        let fingerprint = (stage.fingerprint)(ctx, previous);
        let key = cache_key([
            ctx.tenant.as_str(),
            ctx.task.as_str(),
            stage.name.as_str(),
            fingerprint.as_str(),
        ]);
        // Near-duplicates only match within the same tenant, task and stage
        let embedding = if stage.accept_semantic {
            stage.embedding.as_ref().and_then(|embed| embed(ctx)).map(|vector| {
                let scope = cache_key([ctx.tenant.as_str(), ctx.task.as_str(), stage.name.as_str()]);
                ScopedEmbedding::new(scope, vector)
            })
        } else {
            None
        };

        let (reservation, candidates) = match self.reserve(ctx, stage, spent) {
            Ok(granted) => granted,
            Err(err) => {
                // Nothing affordable, but a cached answer costs nothing
                if let Some(hit) = self.cache.lookup(&key, embedding.as_ref()).await {
                    let (arm, payload) = CachedStage::decode(hit.value);
                    return completed(
                        stage,
                        arm,
                        payload,
                        PayloadSource::from(CacheSource::Hit(hit.provenance)),
                        0.0,
                        0,
                        started,
                    );
                }
                info!(stage = %stage.name, error = %err, "Stage skipped");
                let mut skipped = StageResult::skipped(&stage.name, SkipReason::BudgetExceeded);
                skipped.error = Some(StageError::from(&err));
                return skipped;
            }
        };

        let mut attempts = Attempts::default();
        let progress = &mut attempts;
        let population = self.cache.get_or_populate(
            &key,
            embedding,
            stage.cache_ttl,
            move || async move {
                let cached = self
                    .invoke_stage(ctx, stage, &fingerprint, previous, &candidates, progress)
                    .await?;
                Ok::<_, Error>(serde_json::to_value(cached)?)
            },
        );

        // Population first: an interrupted backend call settles its breaker
        // permit before the run gives up on it
        let outcome = tokio::select! {
            biased;
            outcome = population => outcome,
            _ = ctx.cancellation_token().cancelled() => Err(Error::Cancelled),
            _ = wait_for(ctx.deadline) => Err(Error::DeadlineExceeded),
        };

        match outcome {
            Ok(CacheOutcome { value, source }) => {
                let cost = if source == CacheSource::Populated {
                    attempts.cost
                } else {
                    0.0
                };
                self.settle(reservation, cost);
                let (arm, payload) = CachedStage::decode(value);
                completed(stage, arm, payload, source.into(), cost, attempts.count, started)
            }
            Err(err) => {
                self.budget.release(reservation);
                warn!(
                    stage = %stage.name,
                    attempts = attempts.count,
                    code = err.code(),
                    error = %err,
                    "Stage failed"
                );
                let mut failed = StageResult::failed(
                    &stage.name,
                    err.code(),
                    err.to_string(),
                    attempts.count,
                    started.elapsed(),
                );
                failed.arm = attempts.last_arm;
                failed
            }
        }
    }

    /// Reserve for the priciest candidate that fits, narrowing on denial
    fn reserve(
        &self,
        ctx: &TaskContext,
        stage: &StageDefinition,
        spent: f64,
    ) -> Result<(Reservation, Vec<Arm>)> {
        let estimate = |arm: &Arm| arm.estimate_cost(stage.estimated_units);
        let mut candidates: Vec<Arm> = match ctx.budget_cap {
            Some(cap) => {
                let room = (cap - spent).max(0.0);
                stage
                    .candidates
                    .iter()
                    .filter(|arm| estimate(arm) <= room + COST_EPSILON)
                    .cloned()
                    .collect()
            }
            None => stage.candidates.clone(),
        };
        let mut requested = stage.max_estimated_cost();
        let mut available = ctx
            .budget_cap
            .map(|cap| (cap - spent).max(0.0))
            .unwrap_or(0.0);

        while !candidates.is_empty() {
            let needed = candidates.iter().map(|arm| estimate(arm)).fold(0.0, f64::max);
            match self.budget.reserve(&ctx.tenant, needed) {
                BudgetDecision::Granted(reservation) => return Ok((reservation, candidates)),
                BudgetDecision::Denied {
                    requested: denied,
                    available: left,
                } => {
                    requested = denied;
                    available = left;
                    let before = candidates.len();
                    candidates.retain(|arm| estimate(arm) <= left + COST_EPSILON);
                    debug!(
                        stage = %stage.name,
                        requested = denied,
                        available = left,
                        remaining_candidates = candidates.len(),
                        "Budget denied, narrowing to cheaper arms"
                    );
                    if candidates.len() == before {
                        break;
                    }
                }
            }
        }

        Err(Error::BudgetExceeded {
            tenant: ctx.tenant.clone(),
            requested,
            available,
        })
    }

    fn settle(&self, reservation: Reservation, cost: f64) {
        if cost > 0.0 {
            self.budget.commit(reservation, cost);
        } else {
            self.budget.release(reservation);
        }
    }

    /// Call the stage, re-selecting an arm on each stage-level retry
    async fn invoke_stage(
        &self,
        ctx: &TaskContext,
        stage: &StageDefinition,
        fingerprint: &str,
        previous: Option<&StageResult>,
        candidates: &[Arm],
        progress: &mut Attempts,
    ) -> Result<CachedStage> {
        let weights = self.config.snapshot().ledger.reward_weights.clone();
        let expected_cost = candidates
            .iter()
            .map(|arm| arm.estimate_cost(stage.estimated_units))
            .fold(0.0, f64::max);
        let mut failed_arms: HashSet<String> = HashSet::new();
        let mut last_error = None;

        for attempt in 1..=stage.max_retries.saturating_add(1) {
            ctx.check()?;
            let pool = self.routable(candidates, &failed_arms);
            let decision = self.policy.select_arm(&ctx.tenant, &ctx.task, &pool)?;
            let arm = decision.arm;
            progress.count = attempt;
            progress.last_arm = Some(arm.id.clone());

            let input = StageInput {
                tenant: ctx.tenant.clone(),
                task: ctx.task.clone(),
                stage: stage.name.clone(),
                fingerprint: fingerprint.to_string(),
                arm: arm.clone(),
                attempt,
                previous: previous.cloned(),
                cancel: ctx.cancellation_token().clone(),
            };
            let invoker = stage.invoker.as_ref();
            let input = &input;
            let started = Instant::now();
            let outcome = self
                .breakers
                .execute(&arm.id, ctx.cancellation_token(), ctx.deadline, move |_| {
                    invoker.invoke(input.clone())
                })
                .await;

            match outcome {
                Ok(invocation) => {
                    let cost = arm.estimate_cost(stage.estimated_units);
                    let confidence = stage.confidence_of(&invocation.value);
                    let reward = weights.blend(
                        true,
                        confidence,
                        cost,
                        expected_cost,
                        invocation.latency,
                        Duration::from_millis(arm.expected_latency_ms),
                    );
                    self.ledger.record_outcome(
                        &ctx.tenant,
                        &ctx.task,
                        &arm.id,
                        reward,
                        cost,
                        invocation.latency,
                    );
                    progress.cost = cost;
                    return Ok(CachedStage {
                        arm: arm.id,
                        payload: invocation.value,
                    });
                }
                Err(err @ (Error::Cancelled | Error::DeadlineExceeded)) => return Err(err),
                Err(err) => {
                    // An open circuit made no call, so there is nothing to learn
                    if !matches!(err, Error::CircuitOpen(_)) {
                        self.ledger.record_outcome(
                            &ctx.tenant,
                            &ctx.task,
                            &arm.id,
                            0.0,
                            0.0,
                            started.elapsed(),
                        );
                    }
                    warn!(
                        stage = %stage.name,
                        arm = %arm.id,
                        attempt,
                        error = %err,
                        "Stage attempt failed"
                    );
                    let permanent = matches!(err, Error::PermanentBackend { .. });
                    failed_arms.insert(arm.id);
                    last_error = Some(err);
                    if permanent {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            Error::config(format!("stage '{}' made no attempts", stage.name))
        }))
    }

    /// Candidates worth trying next: untried before failed, admitted before open
    fn routable(&self, candidates: &[Arm], failed: &HashSet<String>) -> Vec<Arm> {
        let fresh: Vec<Arm> = candidates
            .iter()
            .filter(|arm| !failed.contains(&arm.id))
            .cloned()
            .collect();
        let pool = if fresh.is_empty() {
            candidates.to_vec()
        } else {
            fresh
        };

        let admitted: Vec<Arm> = pool
            .iter()
            .filter(|arm| self.breakers.is_call_permitted(&arm.id))
            .cloned()
            .collect();
        if admitted.is_empty() { pool } else { admitted }
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("breakers", &self.breakers)
            .field("budget", &self.budget)
            .finish_non_exhaustive()
    }
}

fn completed(
    stage: &StageDefinition,
    arm: Option<String>,
    payload: Value,
    source: PayloadSource,
    cost: f64,
    attempts: u32,
    started: Instant,
) -> StageResult {
    let confidence = stage.confidence_of(&payload);
    let mut result = StageResult::completed(&stage.name, payload, confidence, started.elapsed())
        .with_cost(cost)
        .with_source(source)
        .with_attempts(attempts);
    result.arm = arm;

    debug!(
        stage = %stage.name,
        arm = ?result.arm,
        source = ?source,
        confidence,
        cost,
        "Stage completed"
    );
    result
}
