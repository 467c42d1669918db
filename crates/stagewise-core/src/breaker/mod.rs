//! Failure containment for backend calls
//!
//! - [`CircuitBreaker`]: closed / open / half-open per backend
//! - [`RetryPolicy`]: bounded exponential backoff with full jitter
//! - [`BreakerRegistry`]: ties both together with per-backend concurrency
//!   limits and run cancellation

mod circuit;
mod coordinator;
mod retry;

pub use circuit::{CallPermit, CircuitBreaker, CircuitSettings, CircuitSnapshot, CircuitState};
pub use coordinator::{BreakerRegistry, Invocation};
pub(crate) use coordinator::{check_run, wait_for};
pub use retry::{BackendError, BackendErrorKind, RetryPolicy};
