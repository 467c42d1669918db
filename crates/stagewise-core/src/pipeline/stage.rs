//! Stage definitions supplied by the caller at run time

use std::collections::HashSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::types::{StageInput, StageResult, TaskContext};
use crate::breaker::BackendError;
use crate::error::{Error, Result};
use crate::routing::Arm;

/// Performs the actual work of a stage against one arm
///
/// The core never does domain work itself; everything a backend does lives
/// behind this trait.
#[async_trait]
pub trait StageInvoker: Send + Sync {
    async fn invoke(&self, input: StageInput) -> std::result::Result<Value, BackendError>;
}

/// Adapter turning an async closure into a [`StageInvoker`]
pub struct FnInvoker<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> StageInvoker for FnInvoker<F>
where
    F: Fn(StageInput) -> Fut + Send + Sync,
    Fut: Future<Output = std::result::Result<Value, BackendError>> + Send,
{
    async fn invoke(&self, input: StageInput) -> std::result::Result<Value, BackendError> {
        (self.f)(input).await
    }
}

/// Wrap an async closure as a shared invoker
pub fn invoker_fn<F, Fut>(f: F) -> Arc<dyn StageInvoker>
where
    F: Fn(StageInput) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<Value, BackendError>> + Send + 'static,
{
    Arc::new(FnInvoker { f })
}

/// Cache fingerprint for a stage, given the request and the previous stage
pub type FingerprintFn = Arc<dyn Fn(&TaskContext, Option<&StageResult>) -> String + Send + Sync>;

/// Confidence in [0, 1] extracted from a stage payload
pub type ConfidenceFn = Arc<dyn Fn(&Value) -> f64 + Send + Sync>;

/// Embedding used for semantic cache lookups
pub type EmbeddingFn = Arc<dyn Fn(&TaskContext) -> Option<Vec<f32>> + Send + Sync>;

/// One ordered step of a pipeline
#[derive(Clone)]
pub struct StageDefinition {
    pub name: String,
    pub candidates: Vec<Arm>,
    pub fingerprint: FingerprintFn,
    pub confidence: ConfidenceFn,
    pub embedding: Option<EmbeddingFn>,
    pub invoker: Arc<dyn StageInvoker>,
    /// Stage-level retries after the first attempt, each with a fresh arm
    pub max_retries: u32,
    /// A failure aborts the whole run
    pub critical: bool,
    /// Weight in the cumulative confidence
    pub weight: f64,
    /// Cache TTL, the cache default when unset
    pub cache_ttl: Option<Duration>,
    pub accept_semantic: bool,
    /// Units the arm's cost-per-unit is multiplied by
    pub estimated_units: f64,
}

impl StageDefinition {
    /// Stage keyed on the request fingerprint, reading `confidence` from the
    /// payload
    pub fn new(name: impl Into<String>, invoker: Arc<dyn StageInvoker>) -> Self {
        Self {
            name: name.into(),
            candidates: Vec::new(),
            fingerprint: Arc::new(|ctx: &TaskContext, _: Option<&StageResult>| ctx.fingerprint.clone()),
            confidence: Arc::new(confidence_field),
            embedding: None,
            invoker,
            max_retries: 1,
            critical: false,
            weight: 1.0,
            cache_ttl: None,
            accept_semantic: true,
            estimated_units: 1.0,
        }
    }

    pub fn with_candidates(mut self, candidates: Vec<Arm>) -> Self {
        self.candidates = candidates;
        self
    }

    pub fn with_candidate(mut self, arm: Arm) -> Self {
        self.candidates.push(arm);
        self
    }

    pub fn with_fingerprint<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskContext, Option<&StageResult>) -> String + Send + Sync + 'static,
    {
        self.fingerprint = Arc::new(f);
        self
    }

    pub fn with_confidence<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> f64 + Send + Sync + 'static,
    {
        self.confidence = Arc::new(f);
        self
    }

    pub fn with_embedding<F>(mut self, f: F) -> Self
    where
        F: Fn(&TaskContext) -> Option<Vec<f32>> + Send + Sync + 'static,
    {
        self.embedding = Some(Arc::new(f));
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn critical(mut self) -> Self {
        self.critical = true;
        self
    }

    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    /// Only exact cache hits may answer this stage
    pub fn exact_only(mut self) -> Self {
        self.accept_semantic = false;
        self
    }

    pub fn with_estimated_units(mut self, units: f64) -> Self {
        self.estimated_units = units;
        self
    }

    /// Reservation needed for the most expensive candidate
    pub fn max_estimated_cost(&self) -> f64 {
        self.candidates
            .iter()
            .map(|arm| arm.estimate_cost(self.estimated_units))
            .fold(0.0, f64::max)
    }

    /// Confidence for a payload, clamped to [0, 1]
    pub fn confidence_of(&self, payload: &Value) -> f64 {
        let confidence = (self.confidence)(payload);
        if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }
}

impl fmt::Debug for StageDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StageDefinition")
            .field("name", &self.name)
            .field("candidates", &self.candidates)
            .field("max_retries", &self.max_retries)
            .field("critical", &self.critical)
            .field("weight", &self.weight)
            .field("cache_ttl", &self.cache_ttl)
            .field("accept_semantic", &self.accept_semantic)
            .field("estimated_units", &self.estimated_units)
            .finish_non_exhaustive()
    }
}

/// Default confidence extraction: a numeric `confidence` field, else 0
pub fn confidence_field(payload: &Value) -> f64 {
    payload
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(0.0)
}

/// Reject empty candidate sets and duplicate stage names
pub fn validate_stages(stages: &[StageDefinition]) -> Result<()> {
    if stages.is_empty() {
        return Err(Error::config("pipeline has no stages"));
    }

    let mut seen = HashSet::new();
    for stage in stages {
        if stage.name.trim().is_empty() {
            return Err(Error::config("stage name cannot be empty"));
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(Error::config(format!("duplicate stage name '{}'", stage.name)));
        }
        if stage.candidates.is_empty() {
            return Err(Error::config(format!(
                "stage '{}' has no candidate arms",
                stage.name
            )));
        }
        let mut arm_ids = HashSet::new();
        for arm in &stage.candidates {
            if !arm_ids.insert(arm.id.as_str()) {
                return Err(Error::config(format!(
                    "stage '{}' lists arm '{}' twice",
                    stage.name, arm.id
                )));
            }
        }
    }
    Ok(())
}
