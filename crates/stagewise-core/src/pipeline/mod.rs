//! Pipeline orchestration
//!
//! Callers describe a run as an ordered list of [`StageDefinition`]s and hand
//! it to [`Orchestrator::run_pipeline`], the single entry point. Stages run
//! sequentially; independent runs may share one orchestrator concurrently.

mod orchestrator;
mod stage;
mod types;

pub use orchestrator::{Orchestrator, OrchestratorBuilder};
pub use stage::{
    ConfidenceFn, EmbeddingFn, FingerprintFn, FnInvoker, StageDefinition, StageInvoker,
    confidence_field, invoker_fn, validate_stages,
};
pub use types::{
    PayloadSource, PipelineResult, PipelineStatus, SkipReason, StageError, StageInput,
    StageResult, StageStatus, TaskContext,
};
