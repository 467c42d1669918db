//! Reward blending
//!
//! Turns a stage outcome (success, confidence, spend, latency) into a scalar
//! reward in [0, 1] that the ledger folds into the arm's posterior.

use std::time::Duration;

use anyhow::bail;
use serde::{Deserialize, Serialize};

/// Weights for each reward component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    pub success: f64,
    pub quality: f64,
    pub cost: f64,
    pub latency: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            success: 0.4,
            quality: 0.3,
            cost: 0.2,
            latency: 0.1,
        }
    }
}

impl RewardWeights {
    pub fn validate(&self) -> anyhow::Result<()> {
        let weights = [self.success, self.quality, self.cost, self.latency];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            bail!("reward weights must be finite and non-negative");
        }
        if weights.iter().sum::<f64>() <= 0.0 {
            bail!("at least one reward weight must be positive");
        }
        Ok(())
    }

    /// Blend an outcome into a reward in [0, 1]
    ///
    /// Cost and latency score 0.5 when they match expectation, rising to 1.0
    /// at half the expected value or less. A failed call always scores 0.
    pub fn blend(
        &self,
        success: bool,
        confidence: f64,
        cost: f64,
        expected_cost: f64,
        latency: Duration,
        expected_latency: Duration,
    ) -> f64 {
        if !success {
            return 0.0;
        }

        let quality = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        let cost_efficiency = efficiency(expected_cost, cost);
        let speed_efficiency = efficiency(
            expected_latency.as_secs_f64(),
            latency.as_secs_f64(),
        );

        let total = self.success + self.quality + self.cost + self.latency;
        if total <= 0.0 {
            return quality;
        }

        let reward = (self.success
            + quality * self.quality
            + cost_efficiency * self.cost
            + speed_efficiency * self.latency)
            / total;

        reward.clamp(0.0, 1.0)
    }
}

/// Ratio of expected to actual, capped at 2x and scaled into [0, 1]
fn efficiency(expected: f64, actual: f64) -> f64 {
    if actual <= 0.0 || !actual.is_finite() {
        return 1.0;
    }
    if expected <= 0.0 || !expected.is_finite() {
        return 0.5;
    }
    (expected / actual).min(2.0) / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_weights_are_valid() {
        assert!(RewardWeights::default().validate().is_ok());
    }

    #[test]
    fn test_negative_or_zero_weights_rejected() {
        let negative = RewardWeights {
            cost: -0.1,
            ..RewardWeights::default()
        };
        assert!(negative.validate().is_err());

        let zero = RewardWeights {
            success: 0.0,
            quality: 0.0,
            cost: 0.0,
            latency: 0.0,
        };
        assert!(zero.validate().is_err());
    }

    #[test]
    fn test_failure_scores_zero() {
        let weights = RewardWeights::default();
        let reward = weights.blend(
            false,
            1.0,
            0.0,
            1.0,
            Duration::ZERO,
            Duration::from_millis(100),
        );
        assert_eq!(reward, 0.0);
    }

    #[test]
    fn test_blend_on_expectation() {
        let weights = RewardWeights::default();
        let reward = weights.blend(
            true,
            0.5,
            0.01,
            0.01,
            Duration::from_millis(200),
            Duration::from_millis(200),
        );
        // 0.4 + 0.3 * 0.5 + 0.2 * 0.5 + 0.1 * 0.5
        assert!((reward - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_cheaper_and_faster_scores_higher() {
        let weights = RewardWeights::default();
        let expected = weights.blend(
            true,
            0.8,
            0.02,
            0.02,
            Duration::from_millis(400),
            Duration::from_millis(400),
        );
        let better = weights.blend(
            true,
            0.8,
            0.01,
            0.02,
            Duration::from_millis(200),
            Duration::from_millis(400),
        );
        assert!(better > expected);
        assert!(better <= 1.0);
    }
}
