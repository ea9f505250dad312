//! Self-retries that cannot be dispatched, recovered by the coordinator.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use common::{Behavior, InvocationLog, ScriptedWorker, ALL_AGENTS};
use coordination::agents::*;
use coordination::{
    AgentRuntime, AtomicUpdater, CasPolicy, CompletionType, CoordinationConfig, Coordinator,
    CoordinatorDecision, DispatchError, Dispatcher, ErrorType, EventBus, InMemoryStore,
    InvocationRequest, Notification, NotifyPolicy, PhaseId, PhaseSequencer, QueueDispatcher,
    QueueNotifier, RunPayload, RunSettings, RunStatus, SharedUpdater, StepStatus, WorkItem,
};
use tokio::sync::mpsc::UnboundedReceiver;

/// Forwards to a work queue, except for the listed dispatch calls (1-based).
struct FlakyDispatcher {
    inner: QueueDispatcher,
    failing: HashSet<u32>,
    calls: AtomicU32,
}

impl FlakyDispatcher {
    fn new(inner: QueueDispatcher, failing: &[u32]) -> Self {
        Self {
            inner,
            failing: failing.iter().copied().collect(),
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dispatcher for FlakyDispatcher {
    async fn dispatch(&self, agent: &str, request: InvocationRequest) -> Result<(), DispatchError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.contains(&call) {
            return Err(DispatchError::Unavailable(format!("outage on dispatch {call}")));
        }
        self.inner.dispatch(agent, request).await
    }
}

struct Harness {
    updater: SharedUpdater,
    dispatcher: Arc<FlakyDispatcher>,
    runtime: AgentRuntime,
    coordinator: Coordinator,
    work_rx: UnboundedReceiver<WorkItem>,
    notify_rx: UnboundedReceiver<Notification>,
}

/// A running run whose market analyst step is about to be invoked.
async fn harness(failing: &[u32]) -> Harness {
    let sequencer = Arc::new(PhaseSequencer::standard());
    let store = InMemoryStore::new().shared();
    let updater = AtomicUpdater::new(store, CasPolicy::default()).shared();
    let payload = RunPayload::new("MSFT", "user-1", settings(), sequencer.initial_steps());
    updater.insert("r1", &payload).await.unwrap();
    assert!(updater.start_run("r1", PhaseId::Analysis).await.unwrap());

    let (queue, work_rx) = QueueDispatcher::new(ALL_AGENTS.iter().map(|a| a.to_string()));
    let dispatcher = Arc::new(FlakyDispatcher::new(queue, failing));
    let (notifier, notify_rx) = QueueNotifier::new();
    let events = EventBus::new().shared();
    let runtime = AgentRuntime::new(
        Arc::clone(&updater),
        Arc::clone(&sequencer),
        dispatcher.clone(),
        Arc::new(notifier),
        Arc::clone(&events),
        NotifyPolicy::default(),
    );
    let coordinator = Coordinator::new(
        Arc::clone(&updater),
        sequencer,
        dispatcher.clone(),
        events,
        &CoordinationConfig::default(),
    );
    Harness {
        updater,
        dispatcher,
        runtime,
        coordinator,
        work_rx,
        notify_rx,
    }
}

fn settings() -> RunSettings {
    RunSettings {
        timeout_ms: 60_000,
        max_retries: 1,
        retry_delay_ms: 100,
        ..RunSettings::default()
    }
}

fn market_request() -> InvocationRequest {
    InvocationRequest::new("r1", "MSFT", "user-1", settings()).in_phase(PhaseId::Analysis, None)
}

async fn market_status(updater: &SharedUpdater) -> StepStatus {
    let run = updater.snapshot("r1").await.unwrap();
    run.payload
        .step(PhaseId::Analysis, MARKET_ANALYST)
        .unwrap()
        .status
}

/// Test: an undispatchable self-retry resets the step, the coordinator
/// re-dispatches it, and the spent retry budget then escalates the run
#[tokio::test(start_paused = true)]
async fn test_failed_retry_dispatch_is_redispatched_then_escalated() {
    let mut h = harness(&[1]).await;
    let log = InvocationLog::default();
    let worker = ScriptedWorker::new(MARKET_ANALYST, Behavior::Fail(ErrorType::RateLimit), &log);

    let response = h.runtime.invoke(worker.as_ref(), market_request()).await;
    assert!(!response.success);

    // The scheduled retry hits the outage.
    let failed = h.notify_rx.recv().await.unwrap();
    assert_eq!(failed.completion_type, CompletionType::InvocationFailed);
    assert_eq!(failed.agent, MARKET_ANALYST);
    assert_eq!(failed.request.as_ref().unwrap().attempt(), 1);
    assert_eq!(market_status(&h.updater).await, StepStatus::Pending);
    assert!(h.work_rx.try_recv().is_err());

    let decision = h.coordinator.handle(failed).await.unwrap();
    assert_eq!(
        decision,
        CoordinatorDecision::Redispatch {
            agent: MARKET_ANALYST.to_string(),
            attempt: 1
        }
    );
    let item = h.work_rx.try_recv().unwrap();
    assert_eq!(item.agent, MARKET_ANALYST);
    assert_eq!(h.dispatcher.calls(), 2);

    // The re-dispatched attempt is the last one the budget allows.
    let response = h.runtime.invoke(worker.as_ref(), item.request).await;
    assert!(!response.success);
    assert_eq!(log.count(MARKET_ANALYST), 2);

    let escalated = h.notify_rx.recv().await.unwrap();
    assert_eq!(escalated.completion_type, CompletionType::AgentFailed);
    assert_eq!(escalated.error_type, Some(ErrorType::RateLimit));
    assert_eq!(escalated.attempts, Some(2));

    let decision = h.coordinator.handle(escalated).await.unwrap();
    assert_eq!(
        decision,
        CoordinatorDecision::FailRun {
            agent: MARKET_ANALYST.to_string(),
            error_type: ErrorType::RateLimit
        }
    );
    let run = h.updater.snapshot("r1").await.unwrap();
    assert_eq!(run.payload.run_status, RunStatus::Error);
    assert_eq!(h.dispatcher.calls(), 2);
    assert!(h.work_rx.try_recv().is_err());
}

/// Test: when the re-dispatch fails too, the coordinator fails the run closed
#[tokio::test(start_paused = true)]
async fn test_persistent_outage_fails_the_run() {
    let mut h = harness(&[1, 2]).await;
    let log = InvocationLog::default();
    let worker = ScriptedWorker::new(MARKET_ANALYST, Behavior::Fail(ErrorType::Timeout), &log);

    assert!(!h.runtime.invoke(worker.as_ref(), market_request()).await.success);
    let failed = h.notify_rx.recv().await.unwrap();
    assert_eq!(failed.completion_type, CompletionType::InvocationFailed);
    assert_eq!(market_status(&h.updater).await, StepStatus::Pending);

    let decision = h.coordinator.handle(failed).await.unwrap();
    assert_eq!(
        decision,
        CoordinatorDecision::FailRun {
            agent: MARKET_ANALYST.to_string(),
            error_type: ErrorType::Other
        }
    );
    assert_eq!(h.dispatcher.calls(), 2);
    assert_eq!(log.count(MARKET_ANALYST), 1);

    let run = h.updater.snapshot("r1").await.unwrap();
    assert_eq!(run.payload.run_status, RunStatus::Error);
    let error = run.payload.error.unwrap();
    assert_eq!(error.agent.as_deref(), Some(MARKET_ANALYST));
    assert!(h.work_rx.try_recv().is_err());
}
