//! Agent runtime: the single "invoke" entry point every agent shares.
//!
//! # Invocation Flow
//!
//! ```text
//! guard ─▶ step running ─▶ arm timer ─▶ worker.analyze ─▶ disarm
//!                                                    │
//!           ┌─ cancelled since? ◀────────────────────┘
//!           ▼
//!        record (insight | debate round, message, step status)
//!           ▼
//!        hand off: debate controller │ sequencer
//!                  next agent ──▶ dispatch (detached)
//!                  last in phase ──▶ notify coordinator
//! ```
//!
//! The expensive external call runs on a private draft; no store write
//! happens until it returns, and nothing is held across it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::debate::{DebateController, DebateStep};
use crate::error::{AgentError, ErrorType};
use crate::events::{PipelineEvent, SharedEventBus};
use crate::guard::{self, GuardDecision, GuardTarget};
use crate::invocation::{InvocationRequest, InvocationResponse, SharedDispatcher, WorkItem};
use crate::notify::{notify_detached, Notification, SharedNotifier};
use crate::phases::{Handoff, PhaseId, PhaseSequencer};
use crate::retry::{RetryEnvelope, RetryScheduler, SharedRetryScheduler};
use crate::settings::{NotifyPolicy, RunSettings};
use crate::state::{
    DebateRound, DebateSide, Message, MessageType, StepChange, StepUpdate, StoreError,
};
use crate::update::{SharedUpdater, UpdateError};

/// Everything a worker may read for its analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentContext {
    pub run_id: String,
    pub subject: String,
    pub owner: String,
    pub phase: PhaseId,
    pub round: Option<u32>,
    pub side: Option<DebateSide>,
    pub attempt: u32,
    pub settings: RunSettings,
    /// Upstream results, keyed by agent.
    pub insights: BTreeMap<String, serde_json::Value>,
    /// Optional agents that failed; their insight is a placeholder.
    pub degraded: Vec<String>,
    pub debate_rounds: Vec<DebateRound>,
}

impl AgentContext {
    pub fn is_degraded(&self, agent: &str) -> bool {
        self.degraded.iter().any(|a| a == agent)
    }
}

/// Final output of the terminal phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalDecision {
    pub decision: String,
    pub confidence: Option<f64>,
}

/// What a worker produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Human-readable text for the message log (and debate transcript).
    pub summary: String,
    /// Opaque structured result stored under the agent's key.
    pub insight: serde_json::Value,
    /// Debate points, for bull/bear turns.
    #[serde(default)]
    pub points: Vec<String>,
    #[serde(default)]
    pub decision: Option<FinalDecision>,
}

impl AgentOutput {
    pub fn new(summary: impl Into<String>) -> Self {
        let summary = summary.into();
        Self {
            insight: serde_json::json!({ "summary": summary }),
            summary,
            points: Vec::new(),
            decision: None,
        }
    }

    pub fn with_insight(mut self, insight: serde_json::Value) -> Self {
        self.insight = insight;
        self
    }

    pub fn with_points(mut self, points: Vec<String>) -> Self {
        self.points = points;
        self
    }

    pub fn with_decision(mut self, decision: impl Into<String>, confidence: Option<f64>) -> Self {
        self.decision = Some(FinalDecision {
            decision: decision.into(),
            confidence,
        });
        self
    }
}

/// One agent's business logic. The runtime owns everything else.
#[async_trait]
pub trait AgentWorker: Send + Sync {
    fn name(&self) -> &str;

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError>;
}

/// Shared reference to a worker
pub type SharedWorker = Arc<dyn AgentWorker>;

/// Shared reference to the runtime
pub type SharedAgentRuntime = Arc<AgentRuntime>;

pub struct AgentRuntime {
    updater: SharedUpdater,
    sequencer: Arc<PhaseSequencer>,
    dispatcher: SharedDispatcher,
    notifier: SharedNotifier,
    retry: SharedRetryScheduler,
    notify_policy: NotifyPolicy,
    events: SharedEventBus,
}

/// Response for an invocation whose timer fired first. The timer already
/// scheduled the retry or escalated.
fn timed_out_response(envelope: &RetryEnvelope, err: &AgentError) -> InvocationResponse {
    if envelope.exhausted() {
        InvocationResponse::failed(err)
    } else {
        InvocationResponse::retry_scheduled(err)
    }
}

fn update_failure(err: &UpdateError) -> AgentError {
    let error_type = match err {
        UpdateError::Store(StoreError::NotFound(_) | StoreError::StepNotFound { .. }) => {
            ErrorType::Other
        }
        UpdateError::Store(StoreError::Serialization(_)) => ErrorType::Other,
        _ => ErrorType::Database,
    };
    AgentError::new(error_type, err.to_string())
}

impl AgentRuntime {
    pub fn new(
        updater: SharedUpdater,
        sequencer: Arc<PhaseSequencer>,
        dispatcher: SharedDispatcher,
        notifier: SharedNotifier,
        events: SharedEventBus,
        notify_policy: NotifyPolicy,
    ) -> Self {
        let retry = RetryScheduler::new(
            Arc::clone(&updater),
            Arc::clone(&dispatcher),
            Arc::clone(&notifier),
            Arc::clone(&events),
            notify_policy,
        )
        .shared();
        Self {
            updater,
            sequencer,
            dispatcher,
            notifier,
            retry,
            notify_policy,
            events,
        }
    }

    pub fn shared(self) -> SharedAgentRuntime {
        Arc::new(self)
    }

    /// Run one invocation of `worker` end to end.
    pub async fn invoke(
        &self,
        worker: &dyn AgentWorker,
        request: InvocationRequest,
    ) -> InvocationResponse {
        let agent = worker.name().to_string();
        let run_id = request.run_id.clone();

        let Some(phase) = request.phase().or_else(|| self.sequencer.phase_of(&agent)) else {
            let err = AgentError::new(
                ErrorType::Other,
                format!("agent '{agent}' is not part of any phase"),
            );
            error!(run_id = %run_id, agent = %agent, "Invocation for unknown agent");
            return InvocationResponse::failed(&err);
        };
        let side = match self.sequencer.phase(phase) {
            Ok(spec) => spec.debate_side(&agent),
            Err(e) => {
                error!(
                    run_id = %run_id,
                    agent = %agent,
                    error = %e,
                    "Invocation for unknown phase"
                );
                let err = AgentError::new(ErrorType::Other, e.to_string());
                return InvocationResponse::failed(&err);
            }
        };
        let round = side.map(|_| request.round().unwrap_or(1));
        let envelope = request
            .retry_envelope
            .clone()
            .unwrap_or_else(|| RetryEnvelope::first(&agent, &request.settings));

        let target = GuardTarget {
            run_id: &run_id,
            phase,
            agent: &agent,
            debate: side.zip(round),
        };
        match guard::check(self.updater.store().as_ref(), &target).await {
            GuardDecision::Proceed => {}
            GuardDecision::AlreadyCompleted { .. } => {
                info!(run_id = %run_id, agent = %agent, ?round, "Already completed, skipping");
                return InvocationResponse::ok();
            }
            GuardDecision::Cancelled => {
                info!(run_id = %run_id, agent = %agent, "Run cancelled, skipping");
                return InvocationResponse::aborted("run cancelled");
            }
            GuardDecision::Stale { reason } => {
                info!(run_id = %run_id, agent = %agent, %reason, "Stale invocation, skipping");
                return InvocationResponse::aborted(reason);
            }
        }

        match self
            .updater
            .set_step_status(&run_id, phase, &agent, &StepUpdate::running())
            .await
        {
            Ok(StepChange::Rejected { current }) => {
                return InvocationResponse::aborted(format!("step is already {current}"));
            }
            Ok(_) => {}
            Err(e) => return self.fail(&agent, phase, &request, &envelope, update_failure(&e)),
        }

        info!(
            run_id = %run_id,
            %phase,
            agent = %agent,
            attempt = envelope.attempt,
            ?round,
            "Invoking agent"
        );
        let timer = self.retry.arm(&agent, phase, &request, &envelope);

        let ctx = match self.context(&agent, phase, side, round, &request).await {
            Ok(ctx) => ctx,
            Err(e) => {
                let fired = timer.disarm();
                let err = update_failure(&e);
                if fired {
                    return timed_out_response(&envelope, &err);
                }
                return self.fail(&agent, phase, &request, &envelope, err);
            }
        };
        let result = worker.analyze(&ctx).await;
        let fired = timer.disarm();

        let output = match result {
            Ok(output) => output,
            Err(err) if fired => {
                info!(
                    run_id = %run_id,
                    agent = %agent,
                    attempt = envelope.attempt,
                    error = %err,
                    "Late failure after timeout, already handled by the timer"
                );
                return timed_out_response(&envelope, &err);
            }
            Err(err) => {
                warn!(run_id = %run_id, agent = %agent, error = %err, "Agent failed");
                return self.fail(&agent, phase, &request, &envelope, err);
            }
        };

        // Cancellation may have landed during the external call.
        match self.updater.read(&run_id).await {
            Ok(run) if run.payload.is_cancelled() => {
                info!(
                    run_id = %run_id,
                    agent = %agent,
                    "Run cancelled during analysis, discarding result"
                );
                return InvocationResponse::aborted("run cancelled");
            }
            Ok(run) if run.payload.run_status.is_terminal() => {
                return InvocationResponse::aborted("run already finished");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    run_id = %run_id,
                    agent = %agent,
                    error = %e,
                    "Cancellation re-check failed, recording anyway"
                );
            }
        }

        let committed = match self
            .record(&agent, phase, side, round, &output, &request)
            .await
        {
            Ok(committed) => committed,
            Err(UpdateError::Rejected(reason)) => return InvocationResponse::aborted(reason),
            Err(e) => return self.fail(&agent, phase, &request, &envelope, update_failure(&e)),
        };
        if !committed {
            info!(
                run_id = %run_id,
                agent = %agent,
                ?round,
                "Completion already recorded by another invocation, not handing off"
            );
            return InvocationResponse::ok();
        }

        self.events.publish(PipelineEvent::AgentCompleted {
            run_id: run_id.clone(),
            phase,
            agent: agent.clone(),
            round,
            timestamp: Utc::now(),
        });

        self.hand_off(&agent, phase, side, round, &request).await;
        InvocationResponse::ok()
    }

    fn fail(
        &self,
        agent: &str,
        phase: PhaseId,
        request: &InvocationRequest,
        envelope: &RetryEnvelope,
        err: AgentError,
    ) -> InvocationResponse {
        if self
            .retry
            .retry_or_escalate(agent, phase, request, envelope, &err)
        {
            InvocationResponse::retry_scheduled(&err)
        } else {
            InvocationResponse::failed(&err)
        }
    }

    async fn context(
        &self,
        agent: &str,
        phase: PhaseId,
        side: Option<DebateSide>,
        round: Option<u32>,
        request: &InvocationRequest,
    ) -> Result<AgentContext, UpdateError> {
        let run = self.updater.read(&request.run_id).await?;
        debug!(run_id = %request.run_id, agent, version = %run.version, "Loaded context");
        Ok(AgentContext {
            run_id: request.run_id.clone(),
            subject: request.subject.clone(),
            owner: request.owner.clone(),
            phase,
            round,
            side,
            attempt: request.attempt(),
            settings: request.settings.clone(),
            insights: run.payload.agent_insights,
            degraded: run.payload.degraded_agents,
            debate_rounds: run.payload.debate_rounds,
        })
    }

    /// Persist the output. Returns whether this invocation committed the
    /// completion; only the committing invocation may hand off.
    async fn record(
        &self,
        agent: &str,
        phase: PhaseId,
        side: Option<DebateSide>,
        round: Option<u32>,
        output: &AgentOutput,
        request: &InvocationRequest,
    ) -> Result<bool, UpdateError> {
        let run_id = request.run_id.as_str();

        if let Some(side) = side {
            let round = round.unwrap_or(1);
            let merged = self
                .updater
                .merge_debate_round(run_id, round, side, &output.summary, &output.points)
                .await?;
            if !merged.applied {
                return Ok(false);
            }
            self.updater
                .append_message(
                    run_id,
                    Message::new(
                        agent,
                        format!("Round {round}: {}", output.summary),
                        MessageType::Debate,
                    ),
                )
                .await?;
            let progress =
                DebateController::new(request.settings.max_debate_rounds).progress(round);
            self.updater
                .set_step_status(run_id, phase, agent, &StepUpdate::progress(progress))
                .await?;
            return Ok(true);
        }

        self.updater
            .record_insight(run_id, agent, output.insight.clone())
            .await?;
        let kind = match &output.decision {
            Some(decision) => {
                self.updater
                    .set_decision(run_id, &decision.decision, decision.confidence)
                    .await?;
                MessageType::Decision
            }
            None => MessageType::Analysis,
        };
        self.updater
            .append_message(run_id, Message::new(agent, output.summary.clone(), kind))
            .await?;
        let change = self
            .updater
            .set_step_status(run_id, phase, agent, &StepUpdate::completed())
            .await?;
        Ok(change == StepChange::Applied)
    }

    async fn hand_off(
        &self,
        agent: &str,
        phase: PhaseId,
        side: Option<DebateSide>,
        round: Option<u32>,
        request: &InvocationRequest,
    ) {
        let pair = self
            .sequencer
            .phase(phase)
            .ok()
            .and_then(|spec| spec.debate.clone());

        if let (Some(side), Some(pair)) = (side, pair) {
            let round = round.unwrap_or(1);
            let settled = match self.updater.read(&request.run_id).await {
                Ok(run) => run.payload.debate_settled,
                Err(_) => false,
            };
            let controller = DebateController::new(request.settings.max_debate_rounds);
            match controller.after_turn(&pair, side, round, settled) {
                DebateStep::Turn {
                    agent: next,
                    round: next_round,
                } => {
                    self.dispatch_next(&next, phase, Some(next_round), request)
                        .await;
                    return;
                }
                DebateStep::Conclude { rounds } => {
                    info!(run_id = %request.run_id, rounds, settled, "Debate concluded");
                    for participant in [&pair.bull, &pair.bear] {
                        if let Err(e) = self
                            .updater
                            .set_step_status(
                                &request.run_id,
                                phase,
                                participant,
                                &StepUpdate::completed(),
                            )
                            .await
                        {
                            error!(
                                run_id = %request.run_id,
                                agent = %participant,
                                error = %e,
                                "Failed to close debate step"
                            );
                            self.report_handoff_failure(agent, phase, request, e.to_string());
                            return;
                        }
                    }
                }
            }
        }

        match self.sequencer.resolve_next(phase, agent) {
            Ok(Handoff::Next { agent: next }) => {
                self.dispatch_next(&next, phase, None, request).await;
            }
            Ok(Handoff::LastInPhase) => {
                info!(
                    run_id = %request.run_id,
                    %phase,
                    agent,
                    "Last in phase, notifying coordinator"
                );
                notify_detached(
                    Arc::clone(&self.notifier),
                    Notification::phase_complete(request.run_id.clone(), phase, agent),
                    self.notify_policy,
                );
            }
            Err(e) => {
                error!(
                    run_id = %request.run_id,
                    %phase,
                    agent,
                    error = %e,
                    "Handoff failed closed"
                );
                self.report_handoff_failure(agent, phase, request, e.to_string());
            }
        }
    }

    async fn dispatch_next(
        &self,
        next: &str,
        phase: PhaseId,
        round: Option<u32>,
        request: &InvocationRequest,
    ) {
        let next_request = request.handoff(phase, round);
        match self.dispatcher.dispatch(next, next_request.clone()).await {
            Ok(()) => debug!(run_id = %request.run_id, next, ?round, "Handed off"),
            Err(e) => {
                warn!(run_id = %request.run_id, next, error = %e, "Handoff dispatch failed");
                notify_detached(
                    Arc::clone(&self.notifier),
                    Notification::invocation_failed(phase, next, e.to_string(), next_request),
                    self.notify_policy,
                );
            }
        }
    }

    fn report_handoff_failure(
        &self,
        agent: &str,
        phase: PhaseId,
        request: &InvocationRequest,
        reason: String,
    ) {
        notify_detached(
            Arc::clone(&self.notifier),
            Notification::handoff_failed(request.run_id.clone(), phase, agent, reason),
            self.notify_policy,
        );
    }
}

/// Drains the work queue, running each invocation as a detached task.
pub struct WorkerPool {
    runtime: SharedAgentRuntime,
    workers: HashMap<String, SharedWorker>,
}

impl WorkerPool {
    pub fn new(
        runtime: SharedAgentRuntime,
        workers: impl IntoIterator<Item = SharedWorker>,
    ) -> Self {
        Self {
            runtime,
            workers: workers
                .into_iter()
                .map(|w| (w.name().to_string(), w))
                .collect(),
        }
    }

    pub fn agents(&self) -> impl Iterator<Item = &str> {
        self.workers.keys().map(String::as_str)
    }

    /// Run until the queue closes or `shutdown` fires.
    pub fn spawn(
        self,
        mut queue: mpsc::UnboundedReceiver<WorkItem>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    item = queue.recv() => match item {
                        Some(item) => self.launch(item),
                        None => break,
                    },
                }
            }
            debug!("Worker pool stopped");
        })
    }

    fn launch(&self, item: WorkItem) {
        let Some(worker) = self.workers.get(&item.agent).cloned() else {
            warn!(agent = %item.agent, "No worker for queued invocation");
            return;
        };
        let runtime = Arc::clone(&self.runtime);
        tokio::spawn(async move {
            let run_id = item.request.run_id.clone();
            let response = runtime.invoke(worker.as_ref(), item.request).await;
            debug!(
                run_id = %run_id,
                agent = %item.agent,
                success = response.success,
                "Invocation finished"
            );
        });
    }
}
