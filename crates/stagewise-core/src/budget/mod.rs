//! Budget governor - per-tenant spend ceilings over a rolling window
//!
//! Spend is reserved pessimistically before a backend call and settled
//! afterwards. For every tenant, committed spend inside the window plus
//! outstanding reservations never exceeds the tenant's ceiling:
//!
//! - [`BudgetGovernor::reserve`] grants only what fits under the ceiling
//! - [`BudgetGovernor::commit`] charges the actual cost, capped at the
//!   remaining headroom; anything above is reported as an overrun
//! - [`BudgetGovernor::release`] hands a reservation back untouched
//!
//! Ceilings come from the live configuration, so a reload takes effect on
//! the next call.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::ConfigHandle;
use crate::metrics::MetricsRegistry;

/// Slack for floating-point comparisons against the ceiling
const EPSILON: f64 = 1e-9;

/// Claim on part of a tenant's remaining budget
///
/// Settle it with [`BudgetGovernor::commit`] or [`BudgetGovernor::release`].
#[derive(Debug, PartialEq)]
pub struct Reservation {
    id: Uuid,
    tenant: String,
    amount: f64,
}

impl Reservation {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn tenant(&self) -> &str {
        &self.tenant
    }

    pub fn amount(&self) -> f64 {
        self.amount
    }
}

/// Answer to a reservation request
#[derive(Debug, PartialEq)]
pub enum BudgetDecision {
    Granted(Reservation),
    Denied { requested: f64, available: f64 },
}

impl BudgetDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted(_))
    }
}

/// Result of settling a reservation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommitOutcome {
    /// Amount that had been reserved
    pub reserved: f64,
    /// Amount actually added to committed spend
    pub charged: f64,
    /// Actual cost that did not fit under the ceiling
    pub overrun: f64,
}

/// A tenant's position against its ceiling
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetUsage {
    pub committed: f64,
    pub reserved: f64,
    pub ceiling: f64,
}

impl BudgetUsage {
    pub fn available(&self) -> f64 {
        (self.ceiling - self.committed - self.reserved).max(0.0)
    }
}

#[derive(Debug)]
struct SpendRecord {
    amount: f64,
    at: Instant,
}

#[derive(Debug, Default)]
struct TenantAccount {
    committed: VecDeque<SpendRecord>,
    reservations: HashMap<Uuid, f64>,
}

impl TenantAccount {
    /// Drop committed spend that has aged out of the window
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.committed.front() {
            if now.saturating_duration_since(front.at) >= window {
                self.committed.pop_front();
            } else {
                break;
            }
        }
    }

    fn committed_total(&self) -> f64 {
        self.committed.iter().map(|r| r.amount).sum()
    }

    fn reserved_total(&self) -> f64 {
        self.reservations.values().sum()
    }
}

/// Per-tenant budget enforcement
pub struct BudgetGovernor {
    accounts: DashMap<String, TenantAccount>,
    config: ConfigHandle,
    metrics: Arc<MetricsRegistry>,
}

impl BudgetGovernor {
    pub fn new(config: ConfigHandle, metrics: Arc<MetricsRegistry>) -> Self {
        Self {
            accounts: DashMap::new(),
            config,
            metrics,
        }
    }

    fn limits(&self, tenant: &str) -> (f64, Duration) {
        let config = self.config.snapshot();
        (config.budget_ceiling(tenant), config.budget.window())
    }

    /// Reserve `estimated_cost` against the tenant's ceiling
    ///
    /// Denials are soft: they are counted and returned, never raised.
    pub fn reserve(&self, tenant: &str, estimated_cost: f64) -> BudgetDecision {
        let requested = sanitize(estimated_cost);
        let (ceiling, window) = self.limits(tenant);
        let now = Instant::now();

        let mut account = self.accounts.entry(tenant.to_string()).or_default();
        account.prune(now, window);
        let available =
            (ceiling - account.committed_total() - account.reserved_total()).max(0.0);

        if requested > available + EPSILON {
            drop(account);
            self.metrics.record_budget_reservation(false);
            debug!(
                tenant = %tenant,
                requested = requested,
                available = available,
                "Budget reservation denied"
            );
            return BudgetDecision::Denied {
                requested,
                available,
            };
        }

        let id = Uuid::new_v4();
        account.reservations.insert(id, requested);
        drop(account);
        self.metrics.record_budget_reservation(true);

        BudgetDecision::Granted(Reservation {
            id,
            tenant: tenant.to_string(),
            amount: requested,
        })
    }

    /// Convert a reservation into committed spend
    pub fn commit(&self, reservation: Reservation, actual_cost: f64) -> CommitOutcome {
        let actual = sanitize(actual_cost);
        let (ceiling, window) = self.limits(&reservation.tenant);
        let now = Instant::now();

        let mut account = self.accounts.entry(reservation.tenant.clone()).or_default();
        let reserved = account
            .reservations
            .remove(&reservation.id)
            .unwrap_or(0.0);
        account.prune(now, window);

        let headroom =
            (ceiling - account.committed_total() - account.reserved_total()).max(0.0);
        let charged = actual.min(headroom);
        let overrun = actual - charged;
        if charged > 0.0 {
            account.committed.push_back(SpendRecord {
                amount: charged,
                at: now,
            });
        }
        drop(account);

        if overrun > EPSILON {
            self.metrics.record_budget_overrun();
            warn!(
                tenant = %reservation.tenant,
                reserved = reserved,
                actual = actual,
                overrun = overrun,
                "Actual cost exceeded remaining budget, charge capped at ceiling"
            );
        }

        CommitOutcome {
            reserved,
            charged,
            overrun,
        }
    }

    /// Return a reservation without charging anything
    pub fn release(&self, reservation: Reservation) {
        if let Some(mut account) = self.accounts.get_mut(&reservation.tenant) {
            account.reservations.remove(&reservation.id);
        }
    }

    /// Current committed spend, outstanding reservations and ceiling
    pub fn usage(&self, tenant: &str) -> BudgetUsage {
        let (ceiling, window) = self.limits(tenant);
        let now = Instant::now();
        match self.accounts.get_mut(tenant) {
            Some(mut account) => {
                account.prune(now, window);
                BudgetUsage {
                    committed: account.committed_total(),
                    reserved: account.reserved_total(),
                    ceiling,
                }
            }
            None => BudgetUsage {
                committed: 0.0,
                reserved: 0.0,
                ceiling,
            },
        }
    }

    /// Headroom left for new reservations
    pub fn available(&self, tenant: &str) -> f64 {
        self.usage(tenant).available()
    }
}

impl std::fmt::Debug for BudgetGovernor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BudgetGovernor")
            .field("tenants", &self.accounts.len())
            .finish()
    }
}

fn sanitize(cost: f64) -> f64 {
    if cost.is_finite() { cost.max(0.0) } else { 0.0 }
}
