//! Bandit policy - picks a backend arm for each (tenant, task)
//!
//! Selection runs in two phases. Inside the cold-start window the policy
//! picks uniformly among the least-selected candidates, so every arm is tried
//! once the window is at least as large as the candidate set. After that it
//! either samples the ledger's posteriors (Thompson) or takes the best
//! posterior mean (deterministic), per the resolved tenant settings.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::debug;

use super::bandit::{ArmBelief, ThompsonSampler, best_mean};
use super::types::{Arm, SelectionDecision, SelectionMode, SelectionReason};
use crate::config::ConfigHandle;
use crate::error::{Error, Result};
use crate::ledger::{LedgerKey, PosteriorState, RewardLedger};
use crate::metrics::MetricsRegistry;

/// Arm selector backed by the reward ledger
pub struct BanditPolicy {
    ledger: Arc<RewardLedger>,
    config: ConfigHandle,
    sampler: ThompsonSampler,
    metrics: Arc<MetricsRegistry>,
    /// (tenant, task) -> selections made by this process
    task_selections: DashMap<(String, String), u64>,
    /// (tenant, task, arm) -> selections made by this process
    arm_selections: DashMap<LedgerKey, u64>,
}

impl BanditPolicy {
    pub fn new(
        ledger: Arc<RewardLedger>,
        config: ConfigHandle,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            ledger,
            config,
            sampler: ThompsonSampler::new(),
            metrics,
            task_selections: DashMap::new(),
            arm_selections: DashMap::new(),
        }
    }

    /// Use a fixed RNG seed (for reproducibility in tests and simulations)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.sampler = ThompsonSampler::with_seed(seed);
        self
    }

    /// The ledger this policy reads posteriors from
    pub fn ledger(&self) -> &Arc<RewardLedger> {
        &self.ledger
    }

    /// Selections made so far for a (tenant, task)
    pub fn selections(&self, tenant: &str, task: &str) -> u64 {
        self.task_selections
            .get(&(tenant.to_string(), task.to_string()))
            .map(|count| *count)
            .unwrap_or(0)
    }

    /// Choose an arm for the next call
    pub fn select_arm(
        &self,
        tenant: &str,
        task: &str,
        candidates: &[Arm],
    ) -> Result<SelectionDecision> {
        if candidates.is_empty() {
            return Err(Error::config(format!(
                "no candidate arms for task '{}' (tenant '{}')",
                task, tenant
            )));
        }

        let settings = self.config.resolve(tenant, task);
        let ordinal = {
            let mut count = self
                .task_selections
                .entry((tenant.to_string(), task.to_string()))
                .or_default();
            let ordinal = *count;
            *count += 1;
            ordinal
        };

        let states: Vec<_> = candidates
            .iter()
            .map(|arm| self.ledger.snapshot(tenant, task, &arm.id))
            .collect();
        let recorded_trials: u64 = states.iter().map(|s| s.trials).sum();

        let (index, score, reason, is_exploration) = if candidates.len() == 1 {
            (0, states[0].mean(), SelectionReason::OnlyCandidate, false)
        } else if ordinal < settings.cold_start_window
            && recorded_trials < settings.cold_start_window
        {
            let index = self.least_selected(tenant, task, candidates, &states);
            (index, states[index].mean(), SelectionReason::ColdStart, true)
        } else {
            let beliefs: Vec<ArmBelief> = states
                .iter()
                .zip(candidates)
                .map(|(state, arm)| ArmBelief {
                    alpha: state.alpha,
                    beta: state.beta,
                    cost: arm.cost_per_unit,
                })
                .collect();

            match settings.selection_mode {
                SelectionMode::Thompson => {
                    let (index, sample, exploring) =
                        self.sampler.sample_best(&beliefs).unwrap_or((0, 0.5, true));
                    (index, sample, SelectionReason::Sampled, exploring)
                }
                SelectionMode::Deterministic => {
                    let (index, mean) = best_mean(&beliefs).unwrap_or((0, 0.5));
                    (index, mean, SelectionReason::Deterministic, false)
                }
            }
        };

        let arm = candidates[index].clone();
        *self
            .arm_selections
            .entry(LedgerKey::new(tenant, task, &arm.id))
            .or_default() += 1;
        self.metrics.record_arm_selection(task, &arm.id);

        debug!(
            tenant = %tenant,
            task = %task,
            arm = %arm.id,
            score = score,
            reason = %reason,
            exploration = is_exploration,
            "Selected arm"
        );

        Ok(SelectionDecision {
            arm,
            score,
            reason,
            is_exploration,
        })
    }

    /// Uniform pick among the candidates tried least so far
    fn least_selected(
        &self,
        tenant: &str,
        task: &str,
        candidates: &[Arm],
        states: &[PosteriorState],
    ) -> usize {
        let counts: Vec<u64> = candidates
            .iter()
            .zip(states)
            .map(|(arm, state)| {
                let selected = self
                    .arm_selections
                    .get(&LedgerKey::new(tenant, task, &arm.id))
                    .map(|count| *count)
                    .unwrap_or(0);
                selected.max(state.trials)
            })
            .collect();

        let fewest = counts.iter().copied().min().unwrap_or(0);
        let least: Vec<usize> = counts
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == fewest)
            .map(|(index, _)| index)
            .collect();

        self.sampler.choose_uniform(&least).unwrap_or(0)
    }
}

impl std::fmt::Debug for BanditPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BanditPolicy")
            .field("tracked_tasks", &self.task_selections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, TaskOverrides, TenantOverrides};
    use rand::prelude::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn policy_with(config: Config, seed: u64) -> BanditPolicy {
        BanditPolicy::new(
            Arc::new(RewardLedger::in_memory()),
            ConfigHandle::new(config),
            Arc::new(MetricsRegistry::new()),
        )
        .with_seed(seed)
    }

    fn arms(ids: &[&str]) -> Vec<Arm> {
        ids.iter().map(|id| Arm::new(*id)).collect()
    }

    #[test]
    fn test_empty_candidates_is_configuration_error() {
        let policy = policy_with(Config::default(), 1);
        let err = policy.select_arm("acme", "summarize", &[]).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.code(), "E001");
    }

    #[test]
    fn test_single_candidate() {
        let policy = policy_with(Config::default(), 1);
        let decision = policy.select_arm("acme", "t", &arms(&["only"])).unwrap();
        assert_eq!(decision.arm.id, "only");
        assert_eq!(decision.reason, SelectionReason::OnlyCandidate);
    }

    #[test]
    fn test_cold_start_exercises_every_arm() {
        let mut config = Config::default();
        config.routing.cold_start_window = 3;
        let policy = policy_with(config, 99);
        let candidates = arms(&["a", "b", "c"]);

        let mut seen = Vec::new();
        for _ in 0..3 {
            let decision = policy.select_arm("acme", "t", &candidates).unwrap();
            assert_eq!(decision.reason, SelectionReason::ColdStart);
            seen.push(decision.arm.id);
        }
        seen.sort();
        assert_eq!(seen, vec!["a", "b", "c"]);

        let next = policy.select_arm("acme", "t", &candidates).unwrap();
        assert_eq!(next.reason, SelectionReason::Sampled);
        assert_eq!(policy.selections("acme", "t"), 4);
    }

    #[test]
    fn test_cold_start_alternates_between_arms() {
        let mut config = Config::default();
        config.routing.cold_start_window = 4;
        let policy = policy_with(config, 5);
        let candidates = arms(&["left", "right"]);

        let decision = policy.select_arm("acme", "t", &candidates).unwrap();
        assert_eq!(decision.reason, SelectionReason::ColdStart);
        let first = decision.arm.id.clone();
        let second = policy.select_arm("acme", "t", &candidates).unwrap().arm.id;
        assert_ne!(first, second);
    }

    #[test]
    fn test_deterministic_mode_picks_best_mean() {
        let mut config = Config::default();
        config.routing.cold_start_window = 0;
        config.tenants.insert(
            "acme".to_string(),
            TenantOverrides {
                tasks: [(
                    "t".to_string(),
                    TaskOverrides {
                        selection_mode: Some(SelectionMode::Deterministic),
                        ..TaskOverrides::default()
                    },
                )]
                .into_iter()
                .collect(),
                ..TenantOverrides::default()
            },
        );
        let policy = policy_with(config, 1);
        let candidates = arms(&["a", "b"]);
        for _ in 0..5 {
            policy.ledger().record_outcome("acme", "t", "b", 1.0, 0.0, Duration::ZERO);
            policy.ledger().record_outcome("acme", "t", "a", 0.2, 0.0, Duration::ZERO);
        }

        for _ in 0..10 {
            let decision = policy.select_arm("acme", "t", &candidates).unwrap();
            assert_eq!(decision.arm.id, "b");
            assert_eq!(decision.reason, SelectionReason::Deterministic);
        }

        // Other tasks still sample
        let other = policy.select_arm("acme", "other", &candidates).unwrap();
        assert_eq!(other.reason, SelectionReason::Sampled);
    }

    #[test]
    fn test_deterministic_ties_prefer_cheaper_arm() {
        let mut config = Config::default();
        config.routing.cold_start_window = 0;
        config.routing.selection_mode = SelectionMode::Deterministic;
        let policy = policy_with(config, 1);
        let candidates = vec![
            Arm::new("pricey").with_cost(1.0),
            Arm::new("cheap").with_cost(0.1),
        ];

        let decision = policy.select_arm("acme", "t", &candidates).unwrap();
        assert_eq!(decision.arm.id, "cheap");
    }

    #[test]
    fn test_converges_to_better_arm() {
        let mut config = Config::default();
        config.routing.cold_start_window = 10;
        let policy = policy_with(config, 2024);
        let candidates = arms(&["good", "fair"]);
        let success_rate: HashMap<&str, f64> = [("good", 0.9), ("fair", 0.5)].into_iter().collect();
        let mut world = StdRng::seed_from_u64(7);

        let mut post_cold_start = 0;
        let mut picked_good = 0;
        for run in 0..500 {
            let decision = policy.select_arm("acme", "t", &candidates).unwrap();
            let id = decision.arm.id.as_str();
            let reward = if world.gen_bool(success_rate[id]) { 1.0 } else { 0.0 };
            policy
                .ledger()
                .record_outcome("acme", "t", id, reward, 0.0, Duration::ZERO);

            if run >= 10 {
                post_cold_start += 1;
                if id == "good" {
                    picked_good += 1;
                }
            }
        }

        let share = picked_good as f64 / post_cold_start as f64;
        assert!(share >= 0.85, "better arm share was {:.3}", share);
    }

    #[test]
    fn test_selections_reported_to_metrics() {
        let metrics = Arc::new(MetricsRegistry::new());
        let policy = BanditPolicy::new(
            Arc::new(RewardLedger::in_memory()),
            ConfigHandle::default(),
            metrics.clone(),
        );
        let candidates = arms(&["a", "b"]);
        for _ in 0..6 {
            policy.select_arm("acme", "t", &candidates).unwrap();
        }
        let snapshot = metrics.snapshot();
        let total: u64 = snapshot.arm_selections["t"].values().sum();
        assert_eq!(total, 6);
    }
}
