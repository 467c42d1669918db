//! Pipeline data types

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cache::CacheSource;
use crate::error::{Error, Result};

/// Per-request context, created at entry and dropped with the response
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub tenant: String,
    pub task: String,
    /// Fingerprint of the request input, the base of every stage cache key
    pub fingerprint: String,
    pub deadline: Option<Instant>,
    /// Optional spend cap for this request on top of the tenant ceiling
    pub budget_cap: Option<f64>,
    cancel: CancellationToken,
}

impl TaskContext {
    pub fn new(
        tenant: impl Into<String>,
        task: impl Into<String>,
        fingerprint: impl Into<String>,
    ) -> Self {
        Self {
            tenant: tenant.into(),
            task: task.into(),
            fingerprint: fingerprint.into(),
            deadline: None,
            budget_cap: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_budget_cap(mut self, cap: f64) -> Self {
        self.budget_cap = Some(cap);
        self
    }

    /// Tie the run to an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `Err(Cancelled)` or `Err(DeadlineExceeded)` once the run must stop
    pub fn check(&self) -> Result<()> {
        crate::breaker::check_run(&self.cancel, self.deadline)
    }
}

/// What an invoker receives for one backend call
#[derive(Debug, Clone)]
pub struct StageInput {
    pub tenant: String,
    pub task: String,
    pub stage: String,
    pub fingerprint: String,
    /// Arm chosen for this call
    pub arm: crate::routing::Arm,
    /// Stage-level attempt (1-based), before breaker retries
    pub attempt: u32,
    /// Last finished stage of this run, if any
    pub previous: Option<StageResult>,
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StageStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed)
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Skipped => write!(f, "skipped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Why a stage did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// The quality gate ended the run
    EarlyExit,
    /// No candidate fit under the tenant's remaining budget
    BudgetExceeded,
    /// The run was aborted by a critical failure, cancellation or deadline
    Aborted,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EarlyExit => write!(f, "early exit"),
            Self::BudgetExceeded => write!(f, "budget exceeded"),
            Self::Aborted => write!(f, "run aborted"),
        }
    }
}

/// Error captured in a failed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageError {
    pub code: String,
    pub message: String,
}

impl From<&Error> for StageError {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

/// Where a completed stage's payload came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadSource {
    /// A backend call made by this run
    Backend,
    /// Exact cache hit
    ExactHit,
    /// Semantic (similarity) cache hit
    SemanticHit,
    /// A concurrent run's population of the same key
    Coalesced,
}

impl PayloadSource {
    pub fn is_cache_hit(&self) -> bool {
        matches!(self, Self::ExactHit | Self::SemanticHit)
    }
}

impl From<CacheSource> for PayloadSource {
    fn from(source: CacheSource) -> Self {
        match source {
            CacheSource::Hit(crate::cache::Provenance::Exact) => Self::ExactHit,
            CacheSource::Hit(crate::cache::Provenance::Semantic) => Self::SemanticHit,
            CacheSource::Populated => Self::Backend,
            CacheSource::Coalesced => Self::Coalesced,
        }
    }
}

/// Final record of one stage in one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub success: bool,
    pub confidence: f64,
    pub payload: Option<Value>,
    pub elapsed: Duration,
    pub cost: f64,
    pub arm: Option<String>,
    pub source: Option<PayloadSource>,
    pub attempts: u32,
    pub skip_reason: Option<SkipReason>,
    pub error: Option<StageError>,
}

impl StageResult {
    pub fn completed(
        stage: impl Into<String>,
        payload: Value,
        confidence: f64,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Completed,
            success: true,
            confidence,
            payload: Some(payload),
            elapsed,
            cost: 0.0,
            arm: None,
            source: None,
            attempts: 0,
            skip_reason: None,
            error: None,
        }
    }

    pub fn failed(
        stage: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
        attempts: u32,
        elapsed: Duration,
    ) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Failed,
            success: false,
            confidence: 0.0,
            payload: None,
            elapsed,
            cost: 0.0,
            arm: None,
            source: None,
            attempts,
            skip_reason: None,
            error: Some(StageError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    pub fn skipped(stage: impl Into<String>, reason: SkipReason) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Skipped,
            success: false,
            confidence: 0.0,
            payload: None,
            elapsed: Duration::ZERO,
            cost: 0.0,
            arm: None,
            source: None,
            attempts: 0,
            skip_reason: Some(reason),
            error: None,
        }
    }

    pub fn with_arm(mut self, arm: impl Into<String>) -> Self {
        self.arm = Some(arm.into());
        self
    }

    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_source(mut self, source: PayloadSource) -> Self {
        self.source = Some(source);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    pub fn is_cache_hit(&self) -> bool {
        self.source.is_some_and(|s| s.is_cache_hit())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Started,
    InProgress,
    Completed,
    PartialFailure,
    Aborted,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::PartialFailure => write!(f, "partial_failure"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Outcome of `run_pipeline`, with one result per stage definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    pub run_id: Uuid,
    pub tenant: String,
    pub task: String,
    pub status: PipelineStatus,
    pub stages: Vec<StageResult>,
    pub cumulative_confidence: f64,
    pub early_exit: bool,
    pub total_cost: f64,
    pub elapsed: Duration,
}

impl PipelineResult {
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.stage == name)
    }

    pub fn completed_stages(&self) -> impl Iterator<Item = &StageResult> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Completed)
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// Payload of the last completed stage
    pub fn final_payload(&self) -> Option<&Value> {
        self.completed_stages()
            .last()
            .and_then(|s| s.payload.as_ref())
    }
}
