//! Pull-based metrics surface
//!
//! Components bump counters on a shared [`MetricsRegistry`]; callers pull a
//! serialisable [`MetricsSnapshot`] and render it however they like.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::cache::Provenance;

/// Shared counters for every routing component
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    cache_exact_hits: AtomicU64,
    cache_semantic_hits: AtomicU64,
    cache_misses: AtomicU64,
    cache_unavailable: AtomicU64,
    cache_evictions: AtomicU64,
    /// (task, arm) -> selections
    arm_selections: DashMap<(String, String), u64>,
    /// (backend, from, to) -> transitions
    circuit_transitions: DashMap<(String, &'static str, &'static str), u64>,
    backend_invocations: AtomicU64,
    budget_reservations: AtomicU64,
    budget_denials: AtomicU64,
    budget_overruns: AtomicU64,
    pipeline_runs: AtomicU64,
    early_exits: AtomicU64,
    partial_failures: AtomicU64,
    aborted_runs: AtomicU64,
    persistence_failures: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_cache_hit(&self, provenance: Provenance) {
        match provenance {
            Provenance::Exact => self.cache_exact_hits.fetch_add(1, Ordering::Relaxed),
            Provenance::Semantic => self.cache_semantic_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_unavailable(&self) {
        self.cache_unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_evictions(&self, count: u64) {
        self.cache_evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_arm_selection(&self, task: &str, arm: &str) {
        *self
            .arm_selections
            .entry((task.to_string(), arm.to_string()))
            .or_default() += 1;
    }

    pub fn record_circuit_transition(&self, backend: &str, from: &'static str, to: &'static str) {
        *self
            .circuit_transitions
            .entry((backend.to_string(), from, to))
            .or_default() += 1;
    }

    pub fn record_backend_invocation(&self) {
        self.backend_invocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_budget_reservation(&self, granted: bool) {
        self.budget_reservations.fetch_add(1, Ordering::Relaxed);
        if !granted {
            self.budget_denials.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_budget_overrun(&self) {
        self.budget_overruns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pipeline_run(&self) {
        self.pipeline_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_early_exit(&self) {
        self.early_exits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_partial_failure(&self) {
        self.partial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_aborted_run(&self) {
        self.aborted_runs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of backend calls attempted so far
    pub fn backend_invocations(&self) -> u64 {
        self.backend_invocations.load(Ordering::Relaxed)
    }

    /// Take a point-in-time snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        let exact_hits = self.cache_exact_hits.load(Ordering::Relaxed);
        let semantic_hits = self.cache_semantic_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let lookups = exact_hits + semantic_hits + misses;

        let mut arm_selections: BTreeMap<String, BTreeMap<String, u64>> = BTreeMap::new();
        for entry in self.arm_selections.iter() {
            let (task, arm) = entry.key();
            arm_selections
                .entry(task.clone())
                .or_default()
                .insert(arm.clone(), *entry.value());
        }

        let mut circuit_transitions: Vec<CircuitTransitionCount> = self
            .circuit_transitions
            .iter()
            .map(|entry| {
                let (backend, from, to) = entry.key();
                CircuitTransitionCount {
                    backend: backend.clone(),
                    from: from.to_string(),
                    to: to.to_string(),
                    count: *entry.value(),
                }
            })
            .collect();
        circuit_transitions.sort_by(|a, b| {
            (&a.backend, &a.from, &a.to).cmp(&(&b.backend, &b.from, &b.to))
        });

        let reservations = self.budget_reservations.load(Ordering::Relaxed);
        let denials = self.budget_denials.load(Ordering::Relaxed);
        let runs = self.pipeline_runs.load(Ordering::Relaxed);
        let early_exits = self.early_exits.load(Ordering::Relaxed);

        MetricsSnapshot {
            cache: CacheMetrics {
                exact_hits,
                semantic_hits,
                misses,
                unavailable: self.cache_unavailable.load(Ordering::Relaxed),
                evictions: self.cache_evictions.load(Ordering::Relaxed),
                hit_rate: ratio(exact_hits + semantic_hits, lookups),
                exact_hit_rate: ratio(exact_hits, lookups),
                semantic_hit_rate: ratio(semantic_hits, lookups),
            },
            arm_selections,
            circuit_transitions,
            backend_invocations: self.backend_invocations.load(Ordering::Relaxed),
            budget: BudgetMetrics {
                reservations,
                denials,
                overruns: self.budget_overruns.load(Ordering::Relaxed),
                rejection_rate: ratio(denials, reservations),
            },
            pipeline: PipelineMetrics {
                runs,
                early_exits,
                partial_failures: self.partial_failures.load(Ordering::Relaxed),
                aborted: self.aborted_runs.load(Ordering::Relaxed),
                early_exit_rate: ratio(early_exits, runs),
            },
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Point-in-time view of every counter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub cache: CacheMetrics,
    /// task -> arm -> selections
    pub arm_selections: BTreeMap<String, BTreeMap<String, u64>>,
    pub circuit_transitions: Vec<CircuitTransitionCount>,
    pub backend_invocations: u64,
    pub budget: BudgetMetrics,
    pub pipeline: PipelineMetrics,
    pub persistence_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub exact_hits: u64,
    pub semantic_hits: u64,
    pub misses: u64,
    pub unavailable: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub exact_hit_rate: f64,
    pub semantic_hit_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitTransitionCount {
    pub backend: String,
    pub from: String,
    pub to: String,
    pub count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetMetrics {
    pub reservations: u64,
    pub denials: u64,
    pub overruns: u64,
    pub rejection_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub runs: u64,
    pub early_exits: u64,
    pub partial_failures: u64,
    pub aborted: u64,
    pub early_exit_rate: f64,
}
