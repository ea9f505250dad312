//! End-to-end tests for the in-process pipeline.
//!
//! Runs the full coordinator → dispatcher → worker pool loop against the
//! in-memory store with scripted workers.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{standard_workers, Behavior, Gate, InvocationLog, ScriptedWorker};
use coordination::agents::*;
use coordination::{
    AgentSpec, CoordinationConfig, ErrorType, InMemoryStore, MessageType, PhaseId,
    PhaseSequencer, PhaseSpec, Pipeline, RunSettings, RunStatus, SharedWorker, StepStatus,
};

const WAIT: Duration = Duration::from_secs(30);

fn settings(max_debate_rounds: u32) -> RunSettings {
    RunSettings {
        timeout_ms: 5_000,
        max_retries: 2,
        retry_delay_ms: 50,
        max_debate_rounds,
        ..RunSettings::default()
    }
}

/// Test: the standard pipeline runs every phase and records the decision
#[tokio::test]
async fn test_standard_pipeline_completes_with_decision() {
    common::init_tracing();
    let log = InvocationLog::default();
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(&log, vec![]))
        .build();

    let run_id = pipeline
        .submit("AAPL", "user-1", Some(settings(1)))
        .await
        .unwrap();
    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();

    assert_eq!(run.payload.run_status, RunStatus::Completed);
    assert_eq!(run.payload.decision.as_deref(), Some("BUY"));
    assert_eq!(run.payload.confidence, Some(0.8));
    assert!(run.payload.finished_at.is_some());
    assert!(run.payload.error.is_none());
    for phase in &run.payload.workflow_steps {
        for step in &phase.agents {
            assert_eq!(
                step.status,
                StepStatus::Completed,
                "{} in {} not completed",
                step.name,
                phase.phase
            );
        }
    }
    assert!(run
        .messages
        .iter()
        .any(|m| m.kind == MessageType::Decision && m.agent == PORTFOLIO_MANAGER));

    pipeline.shutdown().await;
}

/// Test: agents within a phase run strictly in sequencer order
#[tokio::test]
async fn test_handoff_follows_sequencer_order() {
    let log = InvocationLog::default();
    let sequencer = PhaseSequencer::new(vec![
        PhaseSpec::new(
            PhaseId::Analysis,
            vec![
                AgentSpec::required("alpha"),
                AgentSpec::required("beta"),
                AgentSpec::required("gamma"),
            ],
        )
        .then(PhaseId::Portfolio),
        PhaseSpec::new(PhaseId::Portfolio, vec![AgentSpec::required("closer")]),
    ]);
    let workers: Vec<SharedWorker> = vec![
        ScriptedWorker::new("gamma", Behavior::Succeed, &log),
        ScriptedWorker::new("alpha", Behavior::Succeed, &log),
        ScriptedWorker::new("closer", Behavior::Decide("HOLD", 0.5), &log),
        ScriptedWorker::new("beta", Behavior::Succeed, &log),
    ];
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .sequencer(sequencer)
        .workers(workers)
        .build();

    let run_id = pipeline.submit("MSFT", "user-1", None).await.unwrap();
    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();

    assert_eq!(run.payload.run_status, RunStatus::Completed);
    assert_eq!(log.entries(), vec!["alpha", "beta", "gamma", "closer"]);
    pipeline.shutdown().await;
}

/// Test: two debate rounds alternate bull and bear before synthesis
#[tokio::test]
async fn test_debate_runs_configured_rounds() {
    let log = InvocationLog::default();
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(&log, vec![]))
        .build();

    let run_id = pipeline
        .submit("TSLA", "user-1", Some(settings(2)))
        .await
        .unwrap();
    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();
    assert_eq!(run.payload.run_status, RunStatus::Completed);

    let research: Vec<String> = log
        .entries()
        .into_iter()
        .filter(|e| e.contains("researcher") || e == RESEARCH_MANAGER)
        .collect();
    assert_eq!(
        research,
        vec![
            "bull-researcher@1",
            "bear-researcher@1",
            "bull-researcher@2",
            "bear-researcher@2",
            RESEARCH_MANAGER,
        ]
    );
    assert_eq!(run.payload.debate_rounds.len(), 2);
    assert!(run.payload.debate_rounds.iter().all(|r| r.is_complete()));
    let debate_messages = run
        .messages
        .iter()
        .filter(|m| m.kind == MessageType::Debate)
        .count();
    assert_eq!(debate_messages, 4);
    pipeline.shutdown().await;
}

/// Test: settling during round 1 skips the remaining rounds and runs synthesis
#[tokio::test]
async fn test_settle_debate_ends_after_current_round() {
    let log = InvocationLog::default();
    let gate = Arc::new(Gate::default());
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(
            &log,
            vec![(BEAR_RESEARCHER, Behavior::Gated(Arc::clone(&gate)))],
        ))
        .build();

    let run_id = pipeline
        .submit("AMD", "user-1", Some(settings(3)))
        .await
        .unwrap();
    gate.entered.notified().await;
    pipeline.settle_debate(&run_id).await.unwrap();
    // Settling twice is harmless.
    pipeline.settle_debate(&run_id).await.unwrap();
    gate.release.notify_one();

    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();
    assert_eq!(run.payload.run_status, RunStatus::Completed);
    assert!(run.payload.debate_settled);
    assert_eq!(run.payload.debate_rounds.len(), 1);
    assert!(run.payload.debate_rounds[0].is_complete());
    assert_eq!(log.count(RESEARCH_MANAGER), 1);

    let research: Vec<String> = log
        .entries()
        .into_iter()
        .filter(|e| e.contains("researcher") || e == RESEARCH_MANAGER)
        .collect();
    assert_eq!(
        research,
        vec!["bull-researcher@1", "bear-researcher@1", RESEARCH_MANAGER]
    );
    pipeline.shutdown().await;
}

/// Test: a failing optional analyst degrades the run instead of failing it
#[tokio::test]
async fn test_optional_failure_degrades_and_completes() {
    let log = InvocationLog::default();
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(
            &log,
            vec![(NEWS_ANALYST, Behavior::Fail(ErrorType::DataFetch))],
        ))
        .build();

    let run_id = pipeline
        .submit("AMZN", "user-1", Some(settings(1)))
        .await
        .unwrap();
    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();

    assert_eq!(run.payload.run_status, RunStatus::Completed);
    assert_eq!(run.payload.degraded_agents, vec![NEWS_ANALYST.to_string()]);
    assert_eq!(run.payload.agent_insights[NEWS_ANALYST]["degraded"], true);
    assert_eq!(log.count(NEWS_ANALYST), 1);
    assert_eq!(log.count(SOCIAL_MEDIA_ANALYST), 1);
    let news = run
        .payload
        .workflow_steps
        .iter()
        .find_map(|p| p.agent(NEWS_ANALYST))
        .unwrap();
    assert_eq!(news.status, StepStatus::Error);
    pipeline.shutdown().await;
}

/// Test: a required agent failing with a non-transient error fails the run
#[tokio::test]
async fn test_required_failure_fails_run_without_retry() {
    let log = InvocationLog::default();
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(
            &log,
            vec![(TRADER, Behavior::Fail(ErrorType::ApiKey))],
        ))
        .build();

    let run_id = pipeline
        .submit("GOOG", "user-1", Some(settings(1)))
        .await
        .unwrap();
    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();

    assert_eq!(run.payload.run_status, RunStatus::Error);
    let error = run.payload.error.unwrap();
    assert_eq!(error.error_type, ErrorType::ApiKey);
    assert_eq!(error.agent.as_deref(), Some(TRADER));
    assert_eq!(error.phase, Some(PhaseId::Trading));
    assert_eq!(log.count(TRADER), 1);
    assert_eq!(log.count(RISK_MANAGER), 0);
    pipeline.shutdown().await;
}

/// Test: a transient failure is retried by the agent itself and the run completes
#[tokio::test]
async fn test_transient_failure_self_retries() {
    let log = InvocationLog::default();
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(
            &log,
            vec![(MARKET_ANALYST, Behavior::FailTimes(1, ErrorType::RateLimit))],
        ))
        .build();

    let run_id = pipeline
        .submit("NFLX", "user-1", Some(settings(1)))
        .await
        .unwrap();
    let run = pipeline.wait_for_terminal(&run_id, WAIT).await.unwrap();

    assert_eq!(run.payload.run_status, RunStatus::Completed);
    assert_eq!(log.count(MARKET_ANALYST), 2);
    pipeline.shutdown().await;
}

/// Test: a run cannot be started twice
#[tokio::test]
async fn test_start_requires_pending_run() {
    let log = InvocationLog::default();
    let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
        .workers(standard_workers(&log, vec![]))
        .build();

    let run_id = pipeline.create_run("ORCL", "user-1", None).await.unwrap();
    let pending = pipeline.snapshot(&run_id).await.unwrap();
    assert_eq!(pending.payload.run_status, RunStatus::Pending);

    pipeline.start_run(&run_id).await.unwrap();
    assert!(pipeline.start_run(&run_id).await.is_err());
    pipeline.shutdown().await;
}
