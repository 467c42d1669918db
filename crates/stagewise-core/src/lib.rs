//! Stagewise Core Library
//!
//! Adaptive routing and caching for multi-stage pipelines:
//! - Reward ledger (per tenant/task/arm outcome statistics, write-behind)
//! - Bandit routing (Thompson sampling with a cold-start window)
//! - Layered cache (exact + semantic, TTL/LRU, stampede protection)
//! - Circuit breakers and bounded retry
//! - Per-tenant budget governor
//! - Quality gate for early exit
//! - Pipeline orchestrator composing all of the above

pub mod breaker;
pub mod budget;
pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod metrics;
pub mod pipeline;
pub mod routing;
pub mod storage;

pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::breaker::BackendError;
    pub use crate::config::{Config, ConfigHandle};
    pub use crate::error::{Error, Result};
    pub use crate::metrics::{MetricsRegistry, MetricsSnapshot};
    pub use crate::pipeline::{
        Orchestrator, PipelineResult, PipelineStatus, StageDefinition, StageInput, StageResult,
        StageStatus, TaskContext, invoker_fn,
    };
    pub use crate::routing::Arm;
}
