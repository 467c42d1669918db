//! Thompson Sampling over Beta posteriors
//!
//! Each arm carries a Beta(α, β) belief about its reward. A selection draws
//! θ ~ Beta(α, β) for every candidate and takes the largest draw, so
//! uncertain arms still get explored while proven arms are exploited.
//!
//! The sampler holds no statistics of its own; posteriors live in the
//! reward ledger and are passed in per call.

use std::sync::Mutex;

use rand::prelude::*;
use rand_distr::{Beta, Distribution};

/// Standard deviation above which a pick counts as exploration
const EXPLORATION_UNCERTAINTY: f64 = 0.15;

/// Posterior view of one candidate
#[derive(Debug, Clone, Copy)]
pub struct ArmBelief {
    pub alpha: f64,
    pub beta: f64,
    pub cost: f64,
}

impl ArmBelief {
    pub fn mean(&self) -> f64 {
        self.alpha / (self.alpha + self.beta)
    }

    pub fn uncertainty(&self) -> f64 {
        let ab = self.alpha + self.beta;
        ((self.alpha * self.beta) / (ab * ab * (ab + 1.0))).sqrt()
    }
}

/// Seedable Thompson sampler
#[derive(Debug)]
pub struct ThompsonSampler {
    rng: Mutex<StdRng>,
}

impl Default for ThompsonSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl ThompsonSampler {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Fixed seed, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut rng)
    }

    /// Draw from Beta(alpha, beta), falling back to 0.5 on bad parameters
    pub fn sample_beta(&self, alpha: f64, beta: f64) -> f64 {
        if !(alpha > 0.0 && beta > 0.0) {
            return 0.5;
        }
        match Beta::new(alpha, beta) {
            Ok(dist) => self.with_rng(|rng| dist.sample(rng)),
            Err(_) => 0.5,
        }
    }

    /// Index of the highest draw, with the draw and an exploration flag
    ///
    /// Returns `None` for an empty slice.
    pub fn sample_best(&self, beliefs: &[ArmBelief]) -> Option<(usize, f64, bool)> {
        let mut best: Option<(usize, f64, bool)> = None;
        for (index, belief) in beliefs.iter().enumerate() {
            let sample = self.sample_beta(belief.alpha, belief.beta);
            let better = match best {
                None => true,
                Some((best_index, best_sample, _)) => {
                    sample > best_sample
                        || (sample == best_sample && belief.cost < beliefs[best_index].cost)
                }
            };
            if better {
                best = Some((
                    index,
                    sample,
                    belief.uncertainty() > EXPLORATION_UNCERTAINTY,
                ));
            }
        }
        best
    }

    /// Uniform choice among `indices`
    pub fn choose_uniform(&self, indices: &[usize]) -> Option<usize> {
        self.with_rng(|rng| indices.choose(rng).copied())
    }
}

/// Index with the highest posterior mean
///
/// Ties go to the cheaper arm, then to the earlier candidate.
pub fn best_mean(beliefs: &[ArmBelief]) -> Option<(usize, f64)> {
    let mut best: Option<(usize, f64)> = None;
    for (index, belief) in beliefs.iter().enumerate() {
        let mean = belief.mean();
        let better = match best {
            None => true,
            Some((best_index, best_mean)) => {
                mean > best_mean || (mean == best_mean && belief.cost < beliefs[best_index].cost)
            }
        };
        if better {
            best = Some((index, mean));
        }
    }
    best
}
