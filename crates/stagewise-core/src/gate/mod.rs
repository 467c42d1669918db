//! Quality gate - early exit once accumulated confidence is sufficient
//!
//! Confidence is aggregated as a weighted mean over completed stages. A run
//! may stop early only when the latest stage succeeded, the aggregate meets
//! the threshold, and enough stages have completed that one cheap stage
//! cannot end the run on its own.

use serde::{Deserialize, Serialize};

use crate::pipeline::{StageResult, StageStatus};

/// Early-exit thresholds, resolved per tenant and task
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateThresholds {
    pub confidence_threshold: f64,
    pub min_stages: usize,
}

impl GateThresholds {
    pub fn new(confidence_threshold: f64, min_stages: usize) -> Self {
        Self {
            confidence_threshold,
            min_stages,
        }
    }
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self::new(0.80, 2)
    }
}

/// Weighted running confidence over completed stages
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceAccumulator {
    weighted_sum: f64,
    total_weight: f64,
    completed: usize,
}

impl ConfidenceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in one completed stage
    ///
    /// Confidence is clamped to [0, 1]. A negative or non-finite weight
    /// counts as 1.0; a zero weight counts the stage without moving the mean.
    pub fn record(&mut self, confidence: f64, weight: f64) {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let weight = if weight.is_finite() && weight >= 0.0 {
            weight
        } else {
            1.0
        };

        self.weighted_sum += confidence * weight;
        self.total_weight += weight;
        self.completed += 1;
    }

    /// Σ wᵢ·cᵢ / Σ wᵢ, or 0 before any weighted stage
    pub fn value(&self) -> f64 {
        if self.total_weight > 0.0 {
            self.weighted_sum / self.total_weight
        } else {
            0.0
        }
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}

/// Whether the remaining stages can be skipped after `latest`
///
/// The aggregate must exceed the threshold; reaching it exactly keeps the
/// pipeline running.
pub fn should_exit(
    latest: &StageResult,
    cumulative: &ConfidenceAccumulator,
    thresholds: &GateThresholds,
) -> bool {
    latest.status == StageStatus::Completed
        && latest.success
        && cumulative.completed() >= thresholds.min_stages.max(1)
        && cumulative.value() > thresholds.confidence_threshold
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn completed(name: &str, confidence: f64) -> StageResult {
        StageResult::completed(name, json!({ "stage": name }), confidence, Duration::from_millis(5))
    }

    #[test]
    fn test_exits_after_minimum_stages() {
        let thresholds = GateThresholds::new(0.8, 2);
        let mut acc = ConfidenceAccumulator::new();

        let first = completed("extract", 0.9);
        acc.record(first.confidence, 1.0);
        assert!(!should_exit(&first, &acc, &thresholds));

        let second = completed("classify", 0.85);
        acc.record(second.confidence, 1.0);
        assert!((acc.value() - 0.875).abs() < 1e-9);
        assert!(should_exit(&second, &acc, &thresholds));
    }

    #[test]
    fn test_confidence_at_threshold_keeps_running() {
        let thresholds = GateThresholds::new(0.8, 1);
        let mut acc = ConfidenceAccumulator::new();

        let exact = completed("extract", 0.8);
        acc.record(exact.confidence, 1.0);
        assert_eq!(acc.value(), 0.8);
        assert!(!should_exit(&exact, &acc, &thresholds));

        let above = completed("classify", 0.82);
        acc.record(above.confidence, 1.0);
        assert!(should_exit(&above, &acc, &thresholds));
    }

    #[test]
    fn test_low_confidence_keeps_running() {
        let thresholds = GateThresholds::default();
        let mut acc = ConfidenceAccumulator::new();
        for (name, confidence) in [("a", 0.9), ("b", 0.5), ("c", 0.7)] {
            let result = completed(name, confidence);
            acc.record(result.confidence, 1.0);
            assert!(!should_exit(&result, &acc, &thresholds));
        }
    }

    #[test]
    fn test_failed_latest_stage_never_exits() {
        let thresholds = GateThresholds::new(0.5, 1);
        let mut acc = ConfidenceAccumulator::new();
        acc.record(0.95, 1.0);
        acc.record(0.95, 1.0);

        let failed = StageResult::failed("verify", "E101", "validation failed", 1, Duration::ZERO);
        assert!(!should_exit(&failed, &acc, &thresholds));
    }

    #[test]
    fn test_weights_shift_the_aggregate() {
        let mut acc = ConfidenceAccumulator::new();
        acc.record(1.0, 3.0);
        acc.record(0.2, 1.0);
        assert!((acc.value() - 0.8).abs() < 1e-9);
        assert_eq!(acc.completed(), 2);

        acc.record(0.0, 0.0);
        assert!((acc.value() - 0.8).abs() < 1e-9);
        assert_eq!(acc.completed(), 3);
    }

    #[test]
    fn test_bad_inputs_are_sanitized() {
        let mut acc = ConfidenceAccumulator::new();
        assert_eq!(acc.value(), 0.0);

        acc.record(f64::NAN, 1.0);
        acc.record(4.0, f64::INFINITY);
        assert!((acc.value() - 0.5).abs() < 1e-9);
    }
}
