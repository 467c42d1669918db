//! Backend selection with Thompson Sampling
//!
//! - **Sampler** ([`ThompsonSampler`]): draws from Beta posteriors, seedable
//!   for reproducible runs.
//! - **Policy** ([`BanditPolicy`]): per (tenant, task) arm choice on top of
//!   the reward ledger, with a cold-start window and a deterministic mode.
//!
//! ## Example
//!
//! ```rust,ignore
//! use stagewise_core::routing::{Arm, BanditPolicy};
//!
//! let candidates = vec![Arm::new("gpu-a").with_cost(0.002), Arm::new("gpu-b")];
//! let decision = policy.select_arm("acme", "summarize", &candidates)?;
//!
//! // Call the backend, then feed the outcome back
//! ledger.record_outcome("acme", "summarize", &decision.arm.id, reward, cost, latency);
//! ```

mod bandit;
mod policy;
mod types;

pub use bandit::{ArmBelief, ThompsonSampler, best_mean};
pub use policy::BanditPolicy;
pub use types::{Arm, SelectionDecision, SelectionMode, SelectionReason};
