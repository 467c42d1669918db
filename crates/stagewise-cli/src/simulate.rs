//! Synthetic three-stage workload driven through the orchestrator

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures_util::future::join_all;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use stagewise_core::budget::BudgetUsage;
use stagewise_core::ledger::PosteriorState;
use stagewise_core::prelude::*;
use tracing::{debug, info};

/// Knobs for one simulation
#[derive(Debug, Clone)]
pub struct SimulationOptions {
    pub runs: u64,
    pub tenant: String,
    pub task: String,
    pub seed: u64,
    pub concurrency: usize,
    /// Number of distinct inputs drawn from; repeats land in the cache
    pub distinct_inputs: u64,
}

/// Summary printed by `stagewise simulate`
#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub runs: u64,
    pub tenant: String,
    pub task: String,
    pub statuses: BTreeMap<String, u64>,
    pub early_exits: u64,
    pub cache_served_stages: u64,
    pub total_cost: f64,
    pub mean_confidence: f64,
    pub budget: BudgetUsage,
    pub posteriors: Vec<PosteriorState>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone, Copy)]
struct ArmProfile {
    success_rate: f64,
    quality: f64,
    latency_ms: u64,
}

struct SimulatedArm {
    id: &'static str,
    cost_per_unit: f64,
    profile: ArmProfile,
}

const fn arm(id: &'static str, cost_per_unit: f64, success_rate: f64, quality: f64, latency_ms: u64) -> SimulatedArm {
    SimulatedArm {
        id,
        cost_per_unit,
        profile: ArmProfile {
            success_rate,
            quality,
            latency_ms,
        },
    }
}

const EXTRACT_ARMS: [SimulatedArm; 2] = [
    arm("ocr-fast", 0.002, 0.97, 0.72, 2),
    arm("vision-xl", 0.02, 0.99, 0.93, 6),
];

const CLASSIFY_ARMS: [SimulatedArm; 3] = [
    arm("rules", 0.0005, 0.99, 0.55, 1),
    arm("llm-small", 0.004, 0.92, 0.84, 3),
    arm("llm-large", 0.03, 0.97, 0.95, 8),
];

const SUMMARIZE_ARMS: [SimulatedArm; 2] = [
    arm("llm-small", 0.004, 0.9, 0.78, 3),
    arm("llm-large", 0.03, 0.96, 0.94, 8),
];

/// Build the extract → classify → summarize pipeline
///
/// Backends fail transiently at their arm's failure rate and report a noisy
/// confidence around the arm's quality.
pub fn synthetic_stages(seed: u64) -> Vec<StageDefinition> {
    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(seed ^ 0x5eed)));

    vec![
        stage("extract", &EXTRACT_ARMS, &rng).critical(),
        stage("classify", &CLASSIFY_ARMS, &rng).with_embedding(|ctx: &TaskContext| Some(embed(&ctx.fingerprint))),
        stage("summarize", &SUMMARIZE_ARMS, &rng)
            .with_weight(0.5)
            .with_fingerprint(|ctx: &TaskContext, previous: Option<&StageResult>| {
                let upstream = previous.and_then(|p| p.arm.as_deref()).unwrap_or("none");
                format!("{}:{}", ctx.fingerprint, upstream)
            }),
    ]
}

fn stage(name: &str, arms: &[SimulatedArm], rng: &Arc<Mutex<StdRng>>) -> StageDefinition {
    let profiles: Arc<HashMap<String, ArmProfile>> = Arc::new(
        arms.iter()
            .map(|a| (a.id.to_string(), a.profile))
            .collect(),
    );
    let candidates = arms
        .iter()
        .map(|a| {
            Arm::new(a.id)
                .with_endpoint(format!("sim://{name}/{}", a.id))
                .with_cost(a.cost_per_unit)
                .with_latency(a.profile.latency_ms)
        })
        .collect();

    let rng = Arc::clone(rng);
    let invoker = invoker_fn(move |input: StageInput| {
        let profile = profiles.get(&input.arm.id).copied();
        let (roll, noise) = {
            let mut rng = match rng.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (rng.r#gen::<f64>(), rng.gen_range(-0.08..0.08))
        };

        async move {
            let Some(profile) = profile else {
                return Err(BackendError::permanent(format!("unknown arm '{}'", input.arm.id)));
            };
            tokio::time::sleep(Duration::from_millis(profile.latency_ms)).await;

            if roll > profile.success_rate {
                return Err(BackendError::from_status(503, "simulated backend outage"));
            }
            let confidence = (profile.quality + noise).clamp(0.0, 1.0);
            Ok(json!({
                "stage": input.stage,
                "arm": input.arm.id,
                "input": input.fingerprint,
                "confidence": confidence,
            }))
        }
    });

    StageDefinition::new(name, invoker).with_candidates(candidates)
}

/// Unit vector for an input; inputs in the same group of four are near-duplicates
fn embed(fingerprint: &str) -> Vec<f32> {
    let n: u64 = fingerprint
        .rsplit('-')
        .next()
        .and_then(|tail| tail.parse().ok())
        .unwrap_or(0);
    let theta = (n / 4) as f32 * 0.5 + (n % 4) as f32 * 0.01;
    vec![theta.cos(), theta.sin()]
}

/// Drive `options.runs` requests through the orchestrator in batches
pub async fn run(orchestrator: &Arc<Orchestrator>, options: &SimulationOptions) -> anyhow::Result<SimulationReport> {
    let stages = Arc::new(synthetic_stages(options.seed));
    let mut rng = StdRng::seed_from_u64(options.seed);
    let inputs: Vec<String> = (0..options.runs)
        .map(|_| format!("input-{}", rng.gen_range(0..options.distinct_inputs.max(1))))
        .collect();

    let mut statuses: BTreeMap<String, u64> = BTreeMap::new();
    let mut early_exits = 0;
    let mut cache_served = 0;
    let mut total_cost = 0.0;
    let mut confidence_sum = 0.0;

    info!(
        runs = options.runs,
        tenant = %options.tenant,
        task = %options.task,
        "Starting simulation"
    );

    for batch in inputs.chunks(options.concurrency.max(1)) {
        let handles = batch.iter().map(|fingerprint| {
            let orchestrator = Arc::clone(orchestrator);
            let stages = Arc::clone(&stages);
            let ctx = TaskContext::new(options.tenant.as_str(), options.task.as_str(), fingerprint.as_str());
            tokio::spawn(async move { orchestrator.run_pipeline(&ctx, &stages).await })
        });

        for joined in join_all(handles).await {
            let result = joined.context("Simulation task panicked")??;
            debug!(
                run_id = %result.run_id,
                status = %result.status,
                confidence = result.cumulative_confidence,
                "Run finished"
            );

            *statuses.entry(result.status.to_string()).or_default() += 1;
            if result.early_exit {
                early_exits += 1;
            }
            cache_served += result.stages.iter().filter(|s| s.is_cache_hit()).count() as u64;
            total_cost += result.total_cost;
            confidence_sum += result.cumulative_confidence;
        }
    }

    let mut posteriors = orchestrator.ledger().posteriors_for(&options.tenant, &options.task);
    posteriors.sort_by(|a, b| a.key.arm.cmp(&b.key.arm));

    Ok(SimulationReport {
        runs: options.runs,
        tenant: options.tenant.clone(),
        task: options.task.clone(),
        statuses,
        early_exits,
        cache_served_stages: cache_served,
        total_cost,
        mean_confidence: if options.runs > 0 {
            confidence_sum / options.runs as f64
        } else {
            0.0
        },
        budget: orchestrator.budget().usage(&options.tenant),
        posteriors,
        metrics: orchestrator.metrics_snapshot(),
    })
}
