//! Coordinator: phase transitions and error escalation.
//!
//! # Decision Table
//!
//! ```text
//! notification        state check                       decision
//! ─────────────────── ───────────────────────────────── ─────────────────
//! PhaseComplete       phase current, run running        AdvancePhase | CompleteRun
//! AgentFailed         step not yet resolved             FailRun (required)
//!                                                       ContinueDegraded (optional)
//! InvocationFailed    step unresolved, budget left      Redispatch
//!                     budget spent                      → AgentFailed path
//! HandoffFailed       run not terminal                  FailRun
//! anything            state already moved on            Ignored
//! ```
//!
//! Every decision is derived from the stored run, so duplicate or late
//! notifications resolve to `Ignored`.

pub mod watchdog;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, CoordinationError, CoordinationResult, ErrorType};
use crate::events::{PipelineEvent, SharedEventBus};
use crate::invocation::{InvocationRequest, SharedDispatcher};
use crate::notify::{CompletionType, Notification};
use crate::phases::{Handoff, PhaseId, PhaseSequencer};
use crate::settings::CoordinationConfig;
use crate::state::{
    Message, MessageType, RunError, RunId, RunPayload, RunStatus, StepChange, StepUpdate,
};
use crate::update::SharedUpdater;

pub use watchdog::WatchedDispatcher;

/// What the coordinator did with a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinatorDecision {
    AdvancePhase { from: PhaseId, to: PhaseId },
    CompleteRun,
    ContinueDegraded { agent: String },
    FailRun { agent: String, error_type: ErrorType },
    Redispatch { agent: String, attempt: u32 },
    Ignored { reason: String },
}

impl CoordinatorDecision {
    fn ignored(reason: impl Into<String>) -> Self {
        Self::Ignored {
            reason: reason.into(),
        }
    }
}

/// Shared reference to the coordinator
pub type SharedCoordinator = Arc<Coordinator>;

pub struct Coordinator {
    updater: SharedUpdater,
    sequencer: Arc<PhaseSequencer>,
    dispatcher: SharedDispatcher,
    events: SharedEventBus,
    redispatch_budget: u32,
    redispatches: Mutex<HashMap<(RunId, String), u32>>,
}

impl Coordinator {
    pub fn new(
        updater: SharedUpdater,
        sequencer: Arc<PhaseSequencer>,
        dispatcher: SharedDispatcher,
        events: SharedEventBus,
        config: &CoordinationConfig,
    ) -> Self {
        Self {
            updater,
            sequencer,
            dispatcher,
            events,
            redispatch_budget: config.redispatch_budget,
            redispatches: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared(self) -> SharedCoordinator {
        Arc::new(self)
    }

    /// Move a pending run to running and dispatch the first agent.
    pub async fn start_run(&self, run_id: &str) -> CoordinationResult<PhaseId> {
        let first = self
            .sequencer
            .first_phase()
            .ok_or_else(|| CoordinationError::InvalidRunState {
                run_id: run_id.to_string(),
                status: "unconfigured".into(),
                action: "started".into(),
            })?;

        if !self.updater.start_run(run_id, first).await? {
            let run = self.updater.read(run_id).await?;
            return Err(CoordinationError::InvalidRunState {
                run_id: run_id.to_string(),
                status: run.payload.run_status.to_string(),
                action: "started".into(),
            });
        }

        let run = self.updater.read(run_id).await?;
        info!(run_id, subject = %run.payload.subject, phase = %first, "Run started");
        self.system_message(run_id, format!("Analysis of {} started", run.payload.subject))
            .await;
        self.events.publish(PipelineEvent::RunStarted {
            run_id: run_id.to_string(),
            subject: run.payload.subject.clone(),
            phase: first,
            timestamp: Utc::now(),
        });

        if let Err(e) = self.dispatch_first(run_id, &run.payload, first).await {
            self.fail_closed(run_id, first, "coordinator", e.to_string())
                .await?;
            return Err(e);
        }
        Ok(first)
    }

    /// Apply one notification.
    pub async fn handle(
        &self,
        notification: Notification,
    ) -> CoordinationResult<CoordinatorDecision> {
        debug!(
            run_id = %notification.run_id,
            phase = %notification.phase,
            agent = %notification.agent,
            kind = %notification.completion_type,
            "Coordinator received notification"
        );
        let decision = match notification.completion_type {
            CompletionType::PhaseComplete => {
                self.on_phase_complete(&notification.run_id, notification.phase)
                    .await?
            }
            CompletionType::AgentFailed => {
                self.on_agent_failed(
                    &notification.run_id,
                    notification.phase,
                    &notification.agent,
                    notification.agent_error(),
                )
                .await?
            }
            CompletionType::InvocationFailed => self.on_invocation_failed(&notification).await?,
            CompletionType::HandoffFailed => {
                let reason = notification.agent_error().message;
                self.fail_closed(
                    &notification.run_id,
                    notification.phase,
                    &notification.agent,
                    reason,
                )
                .await?
            }
        };
        info!(run_id = %notification.run_id, ?decision, "Coordinator decision");
        Ok(decision)
    }

    /// Cancel a run. Completed runs stay completed; returns the final status.
    pub async fn cancel_run(&self, run_id: &str) -> CoordinationResult<RunStatus> {
        let status = self.updater.cancel(run_id).await?;
        if status == RunStatus::Cancelled {
            info!(run_id, "Run cancelled");
            self.forget(run_id);
            self.system_message(run_id, "Analysis cancelled").await;
            self.events.publish(PipelineEvent::RunCancelled {
                run_id: run_id.to_string(),
                timestamp: Utc::now(),
            });
        } else {
            debug!(run_id, %status, "Cancel ignored for finished run");
        }
        Ok(status)
    }

    /// Drain notifications until the channel closes or `shutdown` fires.
    pub fn spawn(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<Notification>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    next = notifications.recv() => match next {
                        Some(notification) => {
                            let run_id = notification.run_id.clone();
                            if let Err(e) = self.handle(notification).await {
                                error!(
                                    run_id = %run_id,
                                    error = %e,
                                    "Coordinator failed to handle notification"
                                );
                            }
                        }
                        None => break,
                    },
                }
            }
            debug!("Coordinator loop stopped");
        })
    }

    async fn on_phase_complete(
        &self,
        run_id: &str,
        phase: PhaseId,
    ) -> CoordinationResult<CoordinatorDecision> {
        let run = self.updater.read(run_id).await?;
        if run.payload.run_status != RunStatus::Running {
            return Ok(CoordinatorDecision::ignored(format!(
                "run is {}",
                run.payload.run_status
            )));
        }
        if run.payload.current_phase != Some(phase) {
            return Ok(CoordinatorDecision::ignored(format!(
                "phase {phase} is not current"
            )));
        }

        let Some(next) = self.sequencer.next_phase(phase)? else {
            if !self.updater.complete_run(run_id, phase).await? {
                return Ok(CoordinatorDecision::ignored("run already completed"));
            }
            let final_run = self.updater.read(run_id).await?;
            let decision = final_run.payload.decision.clone();
            info!(run_id, decision = ?decision, "Run completed");
            self.system_message(
                run_id,
                format!(
                    "Analysis completed: {}",
                    decision.as_deref().unwrap_or("no decision")
                ),
            )
            .await;
            self.forget(run_id);
            self.events.publish(PipelineEvent::RunCompleted {
                run_id: run_id.to_string(),
                decision,
                timestamp: Utc::now(),
            });
            return Ok(CoordinatorDecision::CompleteRun);
        };

        if !self.updater.advance_phase(run_id, phase, next).await? {
            return Ok(CoordinatorDecision::ignored("phase already advanced"));
        }
        info!(run_id, from = %phase, to = %next, "Phase advanced");
        self.system_message(run_id, format!("Phase {phase} complete, starting {next}"))
            .await;
        self.events.publish(PipelineEvent::PhaseAdvanced {
            run_id: run_id.to_string(),
            from: phase,
            to: next,
            timestamp: Utc::now(),
        });

        if let Err(e) = self.dispatch_first(run_id, &run.payload, next).await {
            return self.fail_closed(run_id, next, "coordinator", e.to_string()).await;
        }
        Ok(CoordinatorDecision::AdvancePhase {
            from: phase,
            to: next,
        })
    }

    async fn on_agent_failed(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        err: AgentError,
    ) -> CoordinationResult<CoordinatorDecision> {
        let run = self.updater.read(run_id).await?;
        if run.payload.run_status != RunStatus::Running {
            return Ok(CoordinatorDecision::ignored(format!(
                "run is {}",
                run.payload.run_status
            )));
        }

        let change = self
            .updater
            .set_step_status(
                run_id,
                phase,
                agent,
                &StepUpdate::failed(err.error_type, err.message.clone()),
            )
            .await?;
        if change != StepChange::Applied {
            return Ok(CoordinatorDecision::ignored("step already resolved"));
        }

        self.append(
            run_id,
            Message::new(
                agent,
                format!("{agent} failed ({}): {}", err.error_type, err.message),
                MessageType::Error,
            ),
        )
        .await;

        let required = self
            .sequencer
            .agent_spec(phase, agent)
            .map(|spec| spec.required)
            .unwrap_or(true);

        if required {
            warn!(
                run_id,
                %phase,
                agent,
                error_type = %err.error_type,
                "Required agent failed, failing run"
            );
            self.fail(run_id, phase, agent, &err).await?;
            return Ok(CoordinatorDecision::FailRun {
                agent: agent.to_string(),
                error_type: err.error_type,
            });
        }

        warn!(
            run_id,
            %phase,
            agent,
            error_type = %err.error_type,
            "Optional agent failed, continuing degraded"
        );
        let placeholder = serde_json::json!({
            "degraded": true,
            "error_type": err.error_type,
            "error": err.message,
        });
        self.updater.mark_degraded(run_id, agent, placeholder).await?;
        self.events.publish(PipelineEvent::AgentDegraded {
            run_id: run_id.to_string(),
            phase,
            agent: agent.to_string(),
            error_type: err.error_type,
            timestamp: Utc::now(),
        });

        match self.sequencer.resolve_next(phase, agent) {
            Ok(Handoff::Next { agent: next }) => {
                let round = self.first_round(phase, &next);
                let request = request_for(run_id, &run.payload, phase, round);
                if let Err(e) = self.dispatcher.dispatch(&next, request).await {
                    return self.fail_closed(run_id, phase, &next, e.to_string()).await;
                }
            }
            Ok(Handoff::LastInPhase) => {
                self.on_phase_complete(run_id, phase).await?;
            }
            Err(e) => return self.fail_closed(run_id, phase, agent, e.to_string()).await,
        }
        Ok(CoordinatorDecision::ContinueDegraded {
            agent: agent.to_string(),
        })
    }

    async fn on_invocation_failed(
        &self,
        notification: &Notification,
    ) -> CoordinationResult<CoordinatorDecision> {
        let run_id = notification.run_id.as_str();
        let agent = notification.agent.as_str();
        let run = self.updater.read(run_id).await?;
        if run.payload.run_status != RunStatus::Running {
            return Ok(CoordinatorDecision::ignored(format!(
                "run is {}",
                run.payload.run_status
            )));
        }
        let resolved = run
            .payload
            .step(notification.phase, agent)
            .map_or(false, |s| s.status.is_resolved());
        if resolved {
            return Ok(CoordinatorDecision::ignored("step already resolved"));
        }

        if let Some(request) = notification.request.clone() {
            if let Some(attempt) = self.take_redispatch(run_id, agent) {
                match self.dispatcher.dispatch(agent, request).await {
                    Ok(()) => {
                        info!(run_id, agent, attempt, "Re-dispatched agent");
                        return Ok(CoordinatorDecision::Redispatch {
                            agent: agent.to_string(),
                            attempt,
                        });
                    }
                    Err(e) => warn!(run_id, agent, error = %e, "Re-dispatch failed"),
                }
            }
        }

        self.on_agent_failed(run_id, notification.phase, agent, notification.agent_error())
            .await
    }

    /// Terminal failure that does not depend on step state.
    async fn fail_closed(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        reason: String,
    ) -> CoordinationResult<CoordinatorDecision> {
        error!(run_id, %phase, agent, %reason, "Failing run closed");
        let err = AgentError::new(ErrorType::Other, reason);
        if !self.fail(run_id, phase, agent, &err).await? {
            return Ok(CoordinatorDecision::ignored("run already finished"));
        }
        Ok(CoordinatorDecision::FailRun {
            agent: agent.to_string(),
            error_type: ErrorType::Other,
        })
    }

    async fn fail(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        err: &AgentError,
    ) -> CoordinationResult<bool> {
        let failed = self
            .updater
            .fail_run(
                run_id,
                RunError {
                    error_type: err.error_type,
                    message: err.message.clone(),
                    agent: Some(agent.to_string()),
                    phase: Some(phase),
                    at: Utc::now(),
                },
            )
            .await?;
        if failed {
            self.forget(run_id);
            self.events.publish(PipelineEvent::RunFailed {
                run_id: run_id.to_string(),
                agent: agent.to_string(),
                error_type: err.error_type,
                message: err.message.clone(),
                timestamp: Utc::now(),
            });
        }
        Ok(failed)
    }

    async fn dispatch_first(
        &self,
        run_id: &str,
        payload: &RunPayload,
        phase: PhaseId,
    ) -> CoordinationResult<()> {
        let first = self.sequencer.first_agent(phase)?.name.clone();
        let round = self.first_round(phase, &first);
        let request = request_for(run_id, payload, phase, round);
        self.dispatcher.dispatch(&first, request).await?;
        debug!(run_id, %phase, agent = %first, "Dispatched first agent of phase");
        Ok(())
    }

    fn first_round(&self, phase: PhaseId, agent: &str) -> Option<u32> {
        self.sequencer
            .phase(phase)
            .ok()
            .and_then(|spec| spec.debate_side(agent))
            .map(|_| 1)
    }

    /// Next re-dispatch attempt number, if budget remains.
    fn take_redispatch(&self, run_id: &str, agent: &str) -> Option<u32> {
        let mut counts = self.redispatches.lock().ok()?;
        let used = counts
            .entry((run_id.to_string(), agent.to_string()))
            .or_insert(0);
        if *used >= self.redispatch_budget {
            return None;
        }
        *used += 1;
        Some(*used)
    }

    fn forget(&self, run_id: &str) {
        if let Ok(mut counts) = self.redispatches.lock() {
            counts.retain(|(id, _), _| id != run_id);
        }
    }

    async fn system_message(&self, run_id: &str, text: impl Into<String>) {
        self.append(run_id, Message::new("coordinator", text, MessageType::System))
            .await;
    }

    async fn append(&self, run_id: &str, message: Message) {
        if let Err(e) = self.updater.append_message(run_id, message).await {
            warn!(run_id, error = %e, "Failed to append coordinator message");
        }
    }
}

fn request_for(
    run_id: &str,
    payload: &RunPayload,
    phase: PhaseId,
    round: Option<u32>,
) -> InvocationRequest {
    InvocationRequest::new(
        run_id,
        payload.subject.clone(),
        payload.owner.clone(),
        payload.settings.clone(),
    )
    .in_phase(phase, round)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::invocation::{DispatchError, Dispatcher};
    use crate::phases::agents::*;
    use crate::settings::{CasPolicy, RunSettings};
    use crate::state::{InMemoryStore, StepStatus};
    use crate::update::AtomicUpdater;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<(String, InvocationRequest)>>,
        broken: AtomicBool,
    }

    impl Recorder {
        fn agents(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(a, _)| a.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Dispatcher for Recorder {
        async fn dispatch(
            &self,
            agent: &str,
            request: InvocationRequest,
        ) -> Result<(), DispatchError> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(DispatchError::Unavailable("offline".into()));
            }
            self.calls.lock().unwrap().push((agent.to_string(), request));
            Ok(())
        }
    }

    struct Fixture {
        updater: SharedUpdater,
        recorder: Arc<Recorder>,
        coordinator: Coordinator,
    }

    async fn fixture() -> Fixture {
        let store = InMemoryStore::new().shared();
        let updater = AtomicUpdater::new(store, CasPolicy::default()).shared();
        let sequencer = Arc::new(PhaseSequencer::standard());
        let payload = RunPayload::new(
            "NVDA",
            "user-1",
            RunSettings::default(),
            sequencer.initial_steps(),
        );
        updater.insert("r1", &payload).await.unwrap();
        let recorder = Arc::new(Recorder::default());
        let coordinator = Coordinator::new(
            updater.clone(),
            sequencer,
            recorder.clone(),
            EventBus::new().shared(),
            &CoordinationConfig::default(),
        );
        Fixture {
            updater,
            recorder,
            coordinator,
        }
    }

    async fn complete(updater: &AtomicUpdater, phase: PhaseId, agent: &str) {
        updater
            .set_step_status("r1", phase, agent, &StepUpdate::completed())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_start_dispatches_first_agent() {
        let f = fixture().await;
        assert_eq!(f.coordinator.start_run("r1").await.unwrap(), PhaseId::Analysis);
        assert_eq!(f.recorder.agents(), vec![MACRO_ANALYST.to_string()]);

        let run = f.updater.read("r1").await.unwrap();
        assert_eq!(run.payload.run_status, RunStatus::Running);
        assert_eq!(run.payload.current_phase, Some(PhaseId::Analysis));

        let again = f.coordinator.start_run("r1").await;
        assert!(matches!(again, Err(CoordinationError::InvalidRunState { .. })));
    }

    #[tokio::test]
    async fn test_phase_complete_is_idempotent() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();

        let n = Notification::phase_complete("r1", PhaseId::Analysis, FUNDAMENTALS_ANALYST);
        let first = f.coordinator.handle(n.clone()).await.unwrap();
        assert_eq!(
            first,
            CoordinatorDecision::AdvancePhase {
                from: PhaseId::Analysis,
                to: PhaseId::Research
            }
        );
        let second = f.coordinator.handle(n).await.unwrap();
        assert!(matches!(second, CoordinatorDecision::Ignored { .. }));

        assert_eq!(
            f.recorder.agents(),
            vec![MACRO_ANALYST.to_string(), BULL_RESEARCHER.to_string()]
        );
        let calls = f.recorder.calls.lock().unwrap();
        assert_eq!(calls[1].1.round(), Some(1));
    }

    #[tokio::test]
    async fn test_last_phase_completes_run() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        for (from, to) in [
            (PhaseId::Analysis, PhaseId::Research),
            (PhaseId::Research, PhaseId::Trading),
            (PhaseId::Trading, PhaseId::Risk),
            (PhaseId::Risk, PhaseId::Portfolio),
        ] {
            assert!(f.updater.advance_phase("r1", from, to).await.unwrap());
        }
        f.updater
            .set_decision("r1", "BUY", Some(0.7))
            .await
            .unwrap();

        let n = Notification::phase_complete("r1", PhaseId::Portfolio, PORTFOLIO_MANAGER);
        assert_eq!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::CompleteRun
        );
        let run = f.updater.read("r1").await.unwrap();
        assert_eq!(run.payload.run_status, RunStatus::Completed);
        assert_eq!(run.payload.decision.as_deref(), Some("BUY"));
    }

    #[tokio::test]
    async fn test_required_failure_fails_run() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        let err = AgentError::new(ErrorType::ApiKey, "invalid key");
        let n = Notification::agent_failed("r1", PhaseId::Analysis, MARKET_ANALYST, &err, 1);

        assert_eq!(
            f.coordinator.handle(n.clone()).await.unwrap(),
            CoordinatorDecision::FailRun {
                agent: MARKET_ANALYST.to_string(),
                error_type: ErrorType::ApiKey
            }
        );
        let run = f.updater.read("r1").await.unwrap();
        assert_eq!(run.payload.run_status, RunStatus::Error);
        let recorded = run.payload.error.clone().unwrap();
        assert_eq!(recorded.error_type, ErrorType::ApiKey);
        assert_eq!(recorded.agent.as_deref(), Some(MARKET_ANALYST));
        assert_eq!(
            run.payload
                .step(PhaseId::Analysis, MARKET_ANALYST)
                .unwrap()
                .status,
            StepStatus::Error
        );

        assert!(matches!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::Ignored { .. }
        ));
    }

    #[tokio::test]
    async fn test_optional_failure_continues_degraded() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        let err = AgentError::new(ErrorType::DataFetch, "no macro feed");
        let n = Notification::agent_failed("r1", PhaseId::Analysis, MACRO_ANALYST, &err, 3);

        assert_eq!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::ContinueDegraded {
                agent: MACRO_ANALYST.to_string()
            }
        );
        assert_eq!(
            f.recorder.agents(),
            vec![MACRO_ANALYST.to_string(), MARKET_ANALYST.to_string()]
        );
        let run = f.updater.read("r1").await.unwrap();
        assert_eq!(run.payload.run_status, RunStatus::Running);
        assert_eq!(run.payload.degraded_agents, vec![MACRO_ANALYST.to_string()]);
        assert_eq!(run.payload.agent_insights[MACRO_ANALYST]["degraded"], true);
    }

    #[tokio::test]
    async fn test_failures_after_run_error_are_ignored() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        let fatal = AgentError::new(ErrorType::ApiKey, "invalid key");
        f.coordinator
            .handle(Notification::agent_failed(
                "r1",
                PhaseId::Analysis,
                MARKET_ANALYST,
                &fatal,
                1,
            ))
            .await
            .unwrap();
        let dispatched = f.recorder.agents();

        let late = AgentError::new(ErrorType::DataFetch, "feed down");
        let n = Notification::agent_failed("r1", PhaseId::Analysis, NEWS_ANALYST, &late, 1);
        assert!(matches!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::Ignored { .. }
        ));

        let request = InvocationRequest::new("r1", "NVDA", "user-1", RunSettings::default())
            .in_phase(PhaseId::Analysis, None);
        let n =
            Notification::invocation_failed(PhaseId::Analysis, NEWS_ANALYST, "offline", request);
        assert!(matches!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::Ignored { .. }
        ));

        assert_eq!(f.recorder.agents(), dispatched);
        let run = f.updater.read("r1").await.unwrap();
        assert_eq!(run.payload.run_status, RunStatus::Error);
        assert!(run.payload.degraded_agents.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_last_agent_advances_phase() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        for (from, to) in [
            (PhaseId::Analysis, PhaseId::Research),
            (PhaseId::Research, PhaseId::Trading),
            (PhaseId::Trading, PhaseId::Risk),
        ] {
            f.updater.advance_phase("r1", from, to).await.unwrap();
        }
        complete(&f.updater, PhaseId::Risk, RISKY_ANALYST).await;
        complete(&f.updater, PhaseId::Risk, SAFE_ANALYST).await;

        let err = AgentError::new(ErrorType::AiError, "malformed output");
        let n = Notification::agent_failed("r1", PhaseId::Risk, NEUTRAL_ANALYST, &err, 1);
        f.coordinator.handle(n).await.unwrap();
        assert_eq!(f.recorder.agents().last().unwrap(), RISK_MANAGER);
    }

    #[tokio::test]
    async fn test_invocation_failure_redispatches_then_escalates() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        let request = InvocationRequest::new("r1", "NVDA", "user-1", RunSettings::default())
            .in_phase(PhaseId::Analysis, None);
        let n = Notification::invocation_failed(
            PhaseId::Analysis,
            MARKET_ANALYST,
            "queue full",
            request,
        );

        assert_eq!(
            f.coordinator.handle(n.clone()).await.unwrap(),
            CoordinatorDecision::Redispatch {
                agent: MARKET_ANALYST.to_string(),
                attempt: 1
            }
        );
        assert!(matches!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::FailRun { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispatch_failure_on_advance_fails_closed() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        f.recorder.broken.store(true, Ordering::SeqCst);

        let n = Notification::phase_complete("r1", PhaseId::Analysis, FUNDAMENTALS_ANALYST);
        assert!(matches!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::FailRun { .. }
        ));
        let run = f.updater.read("r1").await.unwrap();
        assert_eq!(run.payload.run_status, RunStatus::Error);
    }

    #[tokio::test]
    async fn test_cancel_never_overrides_completion() {
        let f = fixture().await;
        f.coordinator.start_run("r1").await.unwrap();
        assert_eq!(
            f.coordinator.cancel_run("r1").await.unwrap(),
            RunStatus::Cancelled
        );

        let n = Notification::phase_complete("r1", PhaseId::Analysis, FUNDAMENTALS_ANALYST);
        assert!(matches!(
            f.coordinator.handle(n).await.unwrap(),
            CoordinatorDecision::Ignored { .. }
        ));
        assert_eq!(f.recorder.agents().len(), 1);
    }
}
