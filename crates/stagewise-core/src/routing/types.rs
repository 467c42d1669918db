//! Types for backend selection

use serde::{Deserialize, Serialize};

/// A backend a stage can be routed to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Arm {
    /// Backend identifier, also the circuit-breaker key
    pub id: String,
    /// Opaque endpoint descriptor handed to the stage invoker
    pub endpoint: String,
    /// Cost charged per unit of work
    pub cost_per_unit: f64,
    /// Typical latency, used as the reward baseline
    pub expected_latency_ms: u64,
}

impl Arm {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            endpoint: id.clone(),
            id,
            cost_per_unit: 0.0,
            expected_latency_ms: 1_000,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_cost(mut self, cost_per_unit: f64) -> Self {
        self.cost_per_unit = cost_per_unit.max(0.0);
        self
    }

    pub fn with_latency(mut self, expected_latency_ms: u64) -> Self {
        self.expected_latency_ms = expected_latency_ms;
        self
    }

    /// Estimated cost for `units` of work
    pub fn estimate_cost(&self, units: f64) -> f64 {
        self.cost_per_unit * units.max(0.0)
    }
}

/// How arms are chosen once the cold-start window has passed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionMode {
    /// Sample each posterior and take the highest draw
    Thompson,
    /// Take the highest posterior mean
    Deterministic,
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Thompson => write!(f, "thompson"),
            Self::Deterministic => write!(f, "deterministic"),
        }
    }
}

impl std::str::FromStr for SelectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "thompson" => Ok(Self::Thompson),
            "deterministic" => Ok(Self::Deterministic),
            _ => Err(format!("Unknown selection mode: {}", s)),
        }
    }
}

/// Why an arm was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionReason {
    /// Only one candidate was available
    OnlyCandidate,
    /// Uniform choice inside the cold-start window
    ColdStart,
    /// Highest Thompson sample
    Sampled,
    /// Highest posterior mean
    Deterministic,
}

impl std::fmt::Display for SelectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OnlyCandidate => write!(f, "only_candidate"),
            Self::ColdStart => write!(f, "cold_start"),
            Self::Sampled => write!(f, "sampled"),
            Self::Deterministic => write!(f, "deterministic"),
        }
    }
}

/// Outcome of an arm selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionDecision {
    pub arm: Arm,
    /// Sampled value (Thompson) or posterior mean (deterministic)
    pub score: f64,
    pub reason: SelectionReason,
    /// Whether the pick was driven by uncertainty rather than evidence
    pub is_exploration: bool,
}
