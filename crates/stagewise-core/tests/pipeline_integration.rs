//! Stagewise Core Integration Tests
//!
//! End-to-end runs through the orchestrator with simulated backends.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::join_all;
use rand::prelude::*;
use serde_json::json;
use stagewise_core::breaker::BackendError;
use stagewise_core::config::{Config, ConfigHandle, TenantOverrides};
use stagewise_core::ledger::RewardWeights;
use stagewise_core::pipeline::{
    Orchestrator, PayloadSource, PipelineStatus, SkipReason, StageDefinition, StageInput,
    StageStatus, TaskContext, invoker_fn,
};
use stagewise_core::routing::Arm;
use stagewise_core::storage::{KeyValueStore, MemoryStore};
use tokio_util::sync::CancellationToken;

fn orchestrator(config: Config) -> Orchestrator {
    Orchestrator::builder()
        .with_config(ConfigHandle::new(config))
        .with_seed(42)
        .build()
}

/// Stage answering with a fixed confidence, counting its backend calls
fn counted(name: &str, confidence: f64, calls: Arc<AtomicU32>) -> StageDefinition {
    StageDefinition::new(
        name,
        invoker_fn(move |input: StageInput| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "stage": input.stage, "arm": input.arm.id, "confidence": confidence }))
            }
        }),
    )
    .with_candidates(vec![
        Arm::new(format!("{}-small", name)).with_cost(0.01),
        Arm::new(format!("{}-large", name)).with_cost(0.03),
    ])
}

fn failing(name: &str, error: BackendError) -> StageDefinition {
    StageDefinition::new(
        name,
        invoker_fn(move |_| {
            let error = error.clone();
            async move { Err(error) }
        }),
    )
    .with_candidate(Arm::new(format!("{}-arm", name)))
}

#[tokio::test]
async fn test_early_exit_marks_remaining_skipped() {
    let orch = orchestrator(Config::default());
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![
        counted("extract", 0.9, calls.clone()),
        counted("classify", 0.85, calls.clone()),
        counted("summarize", 0.95, calls.clone()),
        counted("verify", 0.95, calls.clone()),
    ];
    let ctx = TaskContext::new("acme", "triage", "ticket-1");

    let result = orch.run_pipeline(&ctx, &stages).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(result.early_exit);
    assert!((result.cumulative_confidence - 0.875).abs() < 1e-9);
    assert_eq!(result.count(StageStatus::Completed), 2);
    for name in ["summarize", "verify"] {
        let stage = result.stage(name).unwrap();
        assert_eq!(stage.status, StageStatus::Skipped);
        assert_eq!(stage.skip_reason, Some(SkipReason::EarlyExit));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let pipeline = orch.metrics_snapshot().pipeline;
    assert_eq!(pipeline.runs, 1);
    assert_eq!(pipeline.early_exits, 1);
}

#[tokio::test]
async fn test_tenant_gate_override_delays_exit() {
    let mut config = Config::default();
    config.tenants.insert(
        "strict".to_string(),
        TenantOverrides {
            confidence_threshold: Some(0.95),
            ..TenantOverrides::default()
        },
    );
    let orch = orchestrator(config);
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![
        counted("extract", 0.9, calls.clone()),
        counted("classify", 0.85, calls.clone()),
        counted("summarize", 0.6, calls.clone()),
    ];

    let strict = orch
        .run_pipeline(&TaskContext::new("strict", "triage", "t-1"), &stages)
        .await
        .unwrap();
    assert!(!strict.early_exit);
    assert_eq!(strict.count(StageStatus::Completed), 3);

    let relaxed = orch
        .run_pipeline(&TaskContext::new("acme", "triage", "t-1"), &stages)
        .await
        .unwrap();
    assert!(relaxed.early_exit);
}

#[tokio::test]
async fn test_warm_rerun_hits_cache_without_backend_calls() {
    let orch = orchestrator(Config::default());
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![
        counted("extract", 0.4, calls.clone()),
        counted("classify", 0.5, calls.clone()),
        counted("summarize", 0.6, calls.clone()),
    ];
    let ctx = TaskContext::new("acme", "triage", "doc-99");

    let first = orch.run_pipeline(&ctx, &stages).await.unwrap();
    assert_eq!(first.status, PipelineStatus::Completed);
    let invocations = orch.metrics().backend_invocations();
    assert_eq!(invocations, 3);

    let second = orch.run_pipeline(&ctx, &stages).await.unwrap();
    assert_eq!(second.status, PipelineStatus::Completed);
    assert!(second.stages.iter().all(|s| s.source == Some(PayloadSource::ExactHit)));
    assert_eq!(orch.metrics().backend_invocations(), invocations);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(second.total_cost, 0.0);

    for (a, b) in first.stages.iter().zip(&second.stages) {
        assert_eq!(a.payload, b.payload);
        assert_eq!(a.arm, b.arm);
    }
}

#[tokio::test]
async fn test_failed_stage_keeps_completed_work() {
    let mut config = Config::default();
    config.breaker.max_attempts = 1;
    let orch = orchestrator(config);
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![
        counted("extract", 0.3, calls.clone()),
        failing("enrich", BackendError::validation("missing field")),
        counted("summarize", 0.4, calls.clone()),
    ];
    let ctx = TaskContext::new("acme", "triage", "doc-7");

    let result = orch.run_pipeline(&ctx, &stages).await.unwrap();

    assert_eq!(result.status, PipelineStatus::PartialFailure);
    assert_eq!(result.stage("extract").unwrap().status, StageStatus::Completed);
    assert_eq!(result.stage("summarize").unwrap().status, StageStatus::Completed);

    let enrich = result.stage("enrich").unwrap();
    assert_eq!(enrich.status, StageStatus::Failed);
    assert_eq!(enrich.error.as_ref().unwrap().code, "E101");
    assert_eq!(enrich.attempts, 1);
    assert_eq!(orch.metrics_snapshot().pipeline.partial_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_exhaust_stage_retries() {
    let mut config = Config::default();
    config.breaker.max_attempts = 2;
    config.breaker.failure_threshold = 10;
    let orch = orchestrator(config);
    let stage = failing("enrich", BackendError::from_status(503, "unavailable")).with_max_retries(2);
    let ctx = TaskContext::new("acme", "triage", "doc-8");

    let result = orch.run_pipeline(&ctx, &[stage]).await.unwrap();

    let enrich = result.stage("enrich").unwrap();
    assert_eq!(enrich.status, StageStatus::Failed);
    assert_eq!(enrich.error.as_ref().unwrap().code, "E100");
    assert_eq!(enrich.attempts, 3);
    // Three stage attempts, two breaker attempts each
    assert_eq!(orch.metrics().backend_invocations(), 6);

    let (alpha, beta) = orch.ledger().get_posterior("acme", "triage", "enrich-arm");
    assert_eq!(alpha, 1.0);
    assert_eq!(beta, 4.0);
}

#[tokio::test]
async fn test_critical_failure_aborts_run() {
    let mut config = Config::default();
    config.breaker.max_attempts = 1;
    let orch = orchestrator(config);
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![
        counted("extract", 0.5, calls.clone()),
        failing("authorize", BackendError::from_status(403, "forbidden")).critical(),
        counted("summarize", 0.5, calls.clone()),
        counted("verify", 0.5, calls.clone()),
    ];
    let ctx = TaskContext::new("acme", "triage", "doc-9");

    let result = orch.run_pipeline(&ctx, &stages).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Aborted);
    assert_eq!(result.stages.len(), 4);
    assert_eq!(result.stage("extract").unwrap().status, StageStatus::Completed);
    assert_eq!(result.stage("authorize").unwrap().status, StageStatus::Failed);
    for name in ["summarize", "verify"] {
        assert_eq!(result.stage(name).unwrap().skip_reason, Some(SkipReason::Aborted));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(orch.metrics_snapshot().pipeline.aborted, 1);
}

#[tokio::test]
async fn test_exhausted_budget_skips_stage_softly() {
    let mut config = Config::default();
    config.budget.default_ceiling = 0.05;
    let orch = orchestrator(config);
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![counted("extract", 0.5, calls.clone())];

    // Each run spends at least 0.01; different inputs avoid the cache
    let mut skipped = 0;
    for i in 0..10 {
        let ctx = TaskContext::new("acme", "triage", format!("doc-{}", i));
        let result = orch.run_pipeline(&ctx, &stages).await.unwrap();
        let extract = result.stage("extract").unwrap();
        if extract.status == StageStatus::Skipped {
            assert_eq!(extract.skip_reason, Some(SkipReason::BudgetExceeded));
            assert_eq!(result.status, PipelineStatus::PartialFailure);
            skipped += 1;
        }
        let usage = orch.budget().usage("acme");
        assert!(usage.committed <= usage.ceiling + 1e-9);
        assert_eq!(usage.reserved, 0.0);
    }

    assert!(skipped > 0);
    let budget = orch.metrics_snapshot().budget;
    assert!(budget.denials > 0);
    assert!(budget.rejection_rate > 0.0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_aborts_and_releases_reservation() {
    let orch = orchestrator(Config::default());
    let calls = Arc::new(AtomicU32::new(0));
    let slow = StageDefinition::new(
        "summarize",
        invoker_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({ "confidence": 0.9 }))
        }),
    )
    .with_candidate(Arm::new("slow").with_cost(0.5));
    let stages = vec![
        counted("extract", 0.5, calls.clone()),
        slow,
        counted("verify", 0.5, calls.clone()),
    ];

    let token = CancellationToken::new();
    let ctx = TaskContext::new("acme", "triage", "doc-10").with_cancellation(token.clone());
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
    });

    let result = orch.run_pipeline(&ctx, &stages).await.unwrap();
    canceller.await.unwrap();

    assert_eq!(result.status, PipelineStatus::Aborted);
    assert_eq!(result.stage("extract").unwrap().status, StageStatus::Completed);
    let summarize = result.stage("summarize").unwrap();
    assert_eq!(summarize.status, StageStatus::Failed);
    assert_eq!(summarize.error.as_ref().unwrap().code, "E500");
    assert_eq!(result.stage("verify").unwrap().skip_reason, Some(SkipReason::Aborted));

    let usage = orch.budget().usage("acme");
    assert_eq!(usage.reserved, 0.0);
    assert!(usage.committed < 0.5);
    // Nothing was learned from the interrupted call
    assert_eq!(orch.ledger().snapshot("acme", "triage", "slow").trials, 0);
}

#[tokio::test(start_paused = true)]
async fn test_deadline_aborts_in_flight_call() {
    let orch = orchestrator(Config::default());
    let slow = StageDefinition::new(
        "summarize",
        invoker_fn(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(json!({ "confidence": 0.9 }))
        }),
    )
    .with_candidate(Arm::new("slow"));
    let ctx = TaskContext::new("acme", "triage", "doc-11").with_timeout(Duration::from_secs(5));

    let result = orch.run_pipeline(&ctx, &[slow]).await.unwrap();

    assert_eq!(result.status, PipelineStatus::Aborted);
    let summarize = result.stage("summarize").unwrap();
    assert_eq!(summarize.error.as_ref().unwrap().code, "E501");
    assert!(result.elapsed <= Duration::from_secs(6));
}

#[tokio::test]
async fn test_concurrent_identical_runs_populate_once() {
    let orch = Arc::new(orchestrator(Config::default()));
    let calls = Arc::new(AtomicU32::new(0));

    let slow_calls = Arc::clone(&calls);
    let stage = StageDefinition::new(
        "extract",
        invoker_fn(move |_| {
            let calls = Arc::clone(&slow_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(json!({ "confidence": 0.7, "text": "shared" }))
            }
        }),
    )
    .with_candidate(Arm::new("extractor").with_cost(0.01));
    let stages = Arc::new(vec![stage]);

    let runs = (0..16).map(|_| {
        let orch = Arc::clone(&orch);
        let stages = Arc::clone(&stages);
        tokio::spawn(async move {
            let ctx = TaskContext::new("acme", "triage", "same-input");
            orch.run_pipeline(&ctx, &stages).await
        })
    });
    let results: Vec<_> = join_all(runs)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let payload = results[0].stage("extract").unwrap().payload.clone();
    for result in &results {
        assert_eq!(result.status, PipelineStatus::Completed);
        assert_eq!(result.stage("extract").unwrap().payload, payload);
    }

    // Only the run that called the backend pays for it
    let paid = results.iter().filter(|r| r.total_cost > 0.0).count();
    assert_eq!(paid, 1);
    assert!((orch.budget().usage("acme").committed - 0.01).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_leader_hands_population_to_follower() {
    let orch = Arc::new(orchestrator(Config::default()));
    let calls = Arc::new(AtomicU32::new(0));

    let slow_calls = Arc::clone(&calls);
    let stage = StageDefinition::new(
        "extract",
        invoker_fn(move |_| {
            let calls = Arc::clone(&slow_calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!({ "confidence": 0.7, "text": "shared" }))
            }
        }),
    )
    .with_candidate(Arm::new("extractor").with_cost(0.01));
    let stages = Arc::new(vec![stage]);

    let token = CancellationToken::new();
    let leader = {
        let orch = Arc::clone(&orch);
        let stages = Arc::clone(&stages);
        let ctx = TaskContext::new("acme", "triage", "same-input").with_cancellation(token.clone());
        tokio::spawn(async move { orch.run_pipeline(&ctx, &stages).await })
    };
    tokio::time::sleep(Duration::from_millis(1)).await;
    let follower = {
        let orch = Arc::clone(&orch);
        let stages = Arc::clone(&stages);
        let ctx = TaskContext::new("acme", "triage", "same-input");
        tokio::spawn(async move { orch.run_pipeline(&ctx, &stages).await })
    };
    tokio::time::sleep(Duration::from_millis(19)).await;
    token.cancel();

    let leader = leader.await.unwrap().unwrap();
    assert_eq!(leader.status, PipelineStatus::Aborted);
    assert_eq!(leader.stage("extract").unwrap().error.as_ref().unwrap().code, "E500");

    let follower = follower.await.unwrap().unwrap();
    assert_eq!(follower.status, PipelineStatus::Completed);
    let extract = follower.stage("extract").unwrap();
    assert_eq!(extract.status, StageStatus::Completed);
    assert_eq!(extract.source, Some(PayloadSource::Backend));
    assert_eq!(extract.payload.as_ref().unwrap()["text"], "shared");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

/// Stage whose inputs all embed to the same vector
fn embedded(name: &str, calls: Arc<AtomicU32>) -> StageDefinition {
    counted(name, 0.5, calls).with_embedding(|_| Some(vec![1.0, 0.0, 0.0]))
}

#[tokio::test]
async fn test_semantic_hits_stay_within_tenant_task_and_stage() {
    let orch = orchestrator(Config::default());
    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![embedded("extract", calls.clone()), embedded("classify", calls.clone())];

    let first = orch
        .run_pipeline(&TaskContext::new("acme", "triage", "doc-1"), &stages)
        .await
        .unwrap();
    let other_tenant = orch
        .run_pipeline(&TaskContext::new("globex", "triage", "doc-zzz"), &stages)
        .await
        .unwrap();
    let other_task = orch
        .run_pipeline(&TaskContext::new("acme", "billing", "doc-7"), &stages)
        .await
        .unwrap();
    for result in [&first, &other_tenant, &other_task] {
        for stage in &result.stages {
            assert_eq!(stage.source, Some(PayloadSource::Backend), "{} was served from cache", stage.stage);
        }
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);

    // A near-duplicate in the same scope still reuses each stage's own answer
    let repeat = orch
        .run_pipeline(&TaskContext::new("acme", "triage", "doc-2"), &stages)
        .await
        .unwrap();
    for name in ["extract", "classify"] {
        let stage = repeat.stage(name).unwrap();
        assert_eq!(stage.source, Some(PayloadSource::SemanticHit));
        assert_eq!(stage.payload.as_ref().unwrap()["stage"], name);
    }
    assert_eq!(calls.load(Ordering::SeqCst), 6);
}

#[tokio::test]
async fn test_bandit_converges_on_better_arm() {
    let mut config = Config::default();
    config.breaker.max_attempts = 1;
    config.ledger.reward_weights = RewardWeights {
        success: 1.0,
        quality: 0.0,
        cost: 0.0,
        latency: 0.0,
    };
    let cold_start = config.routing.cold_start_window as usize;
    let orch = orchestrator(config);

    let rng = Arc::new(Mutex::new(StdRng::seed_from_u64(2024)));
    let stage = StageDefinition::new(
        "answer",
        invoker_fn(move |input: StageInput| {
            let rng = Arc::clone(&rng);
            async move {
                let rate = if input.arm.id == "good" { 0.9 } else { 0.5 };
                let roll: f64 = rng.lock().unwrap().r#gen();
                if roll < rate {
                    Ok(json!({ "confidence": 0.5 }))
                } else {
                    Err(BackendError::validation("wrong answer"))
                }
            }
        }),
    )
    .with_candidates(vec![Arm::new("good"), Arm::new("poor")])
    .with_max_retries(0);
    let stages = [stage];

    let mut picks = Vec::with_capacity(500);
    for run in 0..500 {
        let ctx = TaskContext::new("acme", "qa", format!("question-{}", run));
        let result = orch.run_pipeline(&ctx, &stages).await.unwrap();
        picks.push(result.stages[0].arm.clone().unwrap());
    }

    let post_cold_start = &picks[cold_start..];
    let good = post_cold_start.iter().filter(|arm| *arm == "good").count();
    let share = good as f64 / post_cold_start.len() as f64;
    assert!(share >= 0.85, "better arm picked {:.1}% of the time", share * 100.0);

    let snapshot = orch.metrics_snapshot();
    assert!(snapshot.arm_selections["qa"]["poor"] > 0);
}

#[tokio::test]
async fn test_restart_restores_posteriors_and_durable_cache() {
    let store = Arc::new(MemoryStore::new());
    let mut config = Config::default();
    config.cache.write_through = true;
    let handle = ConfigHandle::new(config);

    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![counted("extract", 0.6, calls.clone())];
    let ctx = TaskContext::new("acme", "triage", "doc-persist");

    let first = Orchestrator::builder()
        .with_config(handle.clone())
        .with_store(store.clone())
        .build();
    let result = first.run_pipeline(&ctx, &stages).await.unwrap();
    let arm = result.stage("extract").unwrap().arm.clone().unwrap();
    assert_eq!(first.ledger().flush().await.unwrap(), 1);
    assert!(!store.scan_prefix("ledger/").await.unwrap().is_empty());

    let second = Orchestrator::builder()
        .with_config(handle)
        .with_store(store.clone())
        .build();
    assert_eq!(second.warm_start().await.unwrap(), 1);
    assert_eq!(second.ledger().snapshot("acme", "triage", &arm).trials, 1);

    let rerun = second.run_pipeline(&ctx, &stages).await.unwrap();
    assert_eq!(rerun.stage("extract").unwrap().source, Some(PayloadSource::ExactHit));
    assert_eq!(second.metrics().backend_invocations(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_store_outage_does_not_fail_runs() {
    let store = Arc::new(MemoryStore::new());
    let mut config = Config::default();
    config.cache.write_through = true;
    let orch = Orchestrator::builder()
        .with_config(ConfigHandle::new(config))
        .with_store(store.clone())
        .build();
    store.set_available(false);

    let calls = Arc::new(AtomicU32::new(0));
    let stages = vec![counted("extract", 0.6, calls.clone())];
    let ctx = TaskContext::new("acme", "triage", "doc-outage");

    let result = orch.run_pipeline(&ctx, &stages).await.unwrap();
    assert_eq!(result.status, PipelineStatus::Completed);
    assert!(orch.ledger().flush().await.is_err());
    assert_eq!(orch.ledger().dirty_count(), 1);

    let snapshot = orch.metrics_snapshot();
    assert!(snapshot.cache.unavailable > 0);
    assert!(snapshot.persistence_failures > 0);
}
