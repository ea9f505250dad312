//! Atomic update layer. Every mutation of a run goes through here.
//!
//! # Update Paths
//!
//! ```text
//!              ┌──────────── procedure available ────────────┐
//! step/debate ─┤                                              ├─▶ merged row
//!              └─ ProcedureUnavailable ─▶ CAS loop ───────────┘
//!
//! CAS loop:  read {payload, v} ─▶ mutate fresh copy ─▶ write if version == v
//!                  ▲                                        │ 0 rows
//!                  └────────────── backoff(attempt) ◀───────┘
//! ```
//!
//! Each CAS attempt re-reads and re-applies the mutation to the freshly read
//! payload, never to a payload carried over from a failed attempt.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, warn};

use crate::phases::PhaseId;
use crate::settings::CasPolicy;
use crate::state::store::{merge_round, merge_step};
use crate::state::{
    AppendOutcome, DebateMerge, DebateSide, Message, RunError, RunPayload, RunStatus,
    SharedRunStore, StepChange, StepStatus, StepUpdate, StoreError, VersionToken, VersionedRun,
    WorkflowRun,
};

/// Errors from the update layer.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("gave up on run {run_id} after {attempts} conflicting writes")]
    ContentionExhausted { run_id: String, attempts: u32 },

    #[error("update rejected: {0}")]
    Rejected(String),
}

/// What a mutation closure decided after looking at the fresh payload.
#[derive(Debug)]
pub enum Mutation<T> {
    /// Persist the mutated payload and return the value.
    Write(T),
    /// Nothing to persist; return the value as-is.
    Skip(T),
    /// Stop without writing.
    Abort(UpdateError),
}

/// Shared reference to the updater
pub type SharedUpdater = Arc<AtomicUpdater>;

/// Conflict-safe mutations over a [`SharedRunStore`].
pub struct AtomicUpdater {
    store: SharedRunStore,
    cas: CasPolicy,
    dedup_window_secs: u64,
}

impl AtomicUpdater {
    pub fn new(store: SharedRunStore, cas: CasPolicy) -> Self {
        Self {
            store,
            cas,
            dedup_window_secs: 60,
        }
    }

    pub fn with_dedup_window(mut self, secs: u64) -> Self {
        self.dedup_window_secs = secs.max(1);
        self
    }

    pub fn shared(self) -> SharedUpdater {
        Arc::new(self)
    }

    pub fn store(&self) -> &SharedRunStore {
        &self.store
    }

    pub fn cas_policy(&self) -> CasPolicy {
        self.cas
    }

    pub async fn read(&self, run_id: &str) -> Result<VersionedRun, UpdateError> {
        Ok(self.store.read_run(run_id).await?)
    }

    /// Create a run record.
    pub async fn insert(
        &self,
        run_id: &str,
        payload: &RunPayload,
    ) -> Result<VersionToken, UpdateError> {
        Ok(self.store.insert_run(run_id, payload).await?)
    }

    /// Generic read-mutate-conditional-write loop.
    pub async fn update<T, F>(&self, run_id: &str, mut mutate: F) -> Result<T, UpdateError>
    where
        F: FnMut(&mut RunPayload) -> Mutation<T> + Send,
        T: Send,
    {
        let max_attempts = self.cas.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let current = self.store.read_run(run_id).await?;
            let mut payload = current.payload;
            let value = match mutate(&mut payload) {
                Mutation::Skip(value) => return Ok(value),
                Mutation::Abort(err) => return Err(err),
                Mutation::Write(value) => value,
            };

            let rows = self
                .store
                .conditional_write(run_id, &payload, current.version)
                .await?;
            if rows > 0 {
                return Ok(value);
            }

            debug!(
                run_id,
                attempt,
                expected = %current.version,
                "Version conflict, retrying"
            );
            if attempt < max_attempts {
                tokio::time::sleep(self.cas.backoff.delay(attempt)).await;
            }
        }

        warn!(run_id, attempts = max_attempts, "CAS retries exhausted");
        Err(UpdateError::ContentionExhausted {
            run_id: run_id.to_string(),
            attempts: max_attempts,
        })
    }

    /// Merge a step status, preferring the atomic procedure.
    pub async fn set_step_status(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        update: &StepUpdate,
    ) -> Result<StepChange, UpdateError> {
        match self
            .store
            .atomic_merge_step_status(run_id, phase, agent, update)
            .await
        {
            Ok(merge) => return Ok(merge.change),
            Err(StoreError::ProcedureUnavailable(reason)) => {
                warn!(run_id, agent, %reason, "Step procedure unavailable, falling back to CAS");
            }
            Err(e) => return Err(e.into()),
        }

        self.update(run_id, |payload| {
            match merge_step(payload, phase, agent, update, Utc::now()) {
                Ok(StepChange::Applied) => Mutation::Write(StepChange::Applied),
                Ok(change) => Mutation::Skip(change),
                Err(e) => Mutation::Abort(e.into()),
            }
        })
        .await
    }

    /// Merge one side of a debate round, preferring the atomic procedure.
    pub async fn merge_debate_round(
        &self,
        run_id: &str,
        round: u32,
        side: DebateSide,
        text: &str,
        points: &[String],
    ) -> Result<DebateMerge, UpdateError> {
        match self
            .store
            .atomic_merge_debate_round(run_id, round, side, text, points)
            .await
        {
            Ok(merged) => return Ok(merged),
            Err(StoreError::ProcedureUnavailable(reason)) => {
                warn!(
                    run_id,
                    round,
                    %side,
                    %reason,
                    "Debate procedure unavailable, falling back to CAS"
                );
            }
            Err(e) => return Err(e.into()),
        }

        self.update(run_id, |payload| {
            let merged = merge_round(payload, round, side, text, points, Utc::now());
            if merged.applied {
                Mutation::Write(merged)
            } else {
                Mutation::Skip(merged)
            }
        })
        .await
    }

    /// Append to the message log. Redelivered messages with the same
    /// fingerprint are dropped; transient store failures are retried.
    pub async fn append_message(
        &self,
        run_id: &str,
        message: Message,
    ) -> Result<AppendOutcome, UpdateError> {
        let message = if message.fingerprint.is_empty() {
            message.with_fingerprint(self.dedup_window_secs)
        } else {
            message
        };

        let max_attempts = self.cas.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.store.append_message(run_id, &message).await {
                Ok(outcome) => {
                    if outcome == AppendOutcome::Duplicate {
                        debug!(run_id, agent = %message.agent, "Dropped duplicate message");
                    }
                    return Ok(outcome);
                }
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    debug!(run_id, attempt, error = %e, "Message append failed, retrying");
                    tokio::time::sleep(self.cas.backoff.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Store an agent's insight. Returns `false` when one is already present.
    pub async fn record_insight(
        &self,
        run_id: &str,
        agent: &str,
        insight: serde_json::Value,
    ) -> Result<bool, UpdateError> {
        self.update(run_id, |payload| {
            if payload.is_cancelled() {
                return Mutation::Abort(UpdateError::Rejected(format!(
                    "run {run_id} is cancelled"
                )));
            }
            if payload.agent_insights.contains_key(agent) {
                return Mutation::Skip(false);
            }
            payload
                .agent_insights
                .insert(agent.to_string(), insight.clone());
            Mutation::Write(true)
        })
        .await
    }

    /// Record the final decision of the run.
    pub async fn set_decision(
        &self,
        run_id: &str,
        decision: &str,
        confidence: Option<f64>,
    ) -> Result<(), UpdateError> {
        self.update(run_id, |payload| {
            if payload.decision.as_deref() == Some(decision) && payload.confidence == confidence {
                return Mutation::Skip(());
            }
            payload.decision = Some(decision.to_string());
            payload.confidence = confidence;
            Mutation::Write(())
        })
        .await
    }

    /// Move `Pending → Running` and open the first phase. Returns `false`
    /// if the run had already left `Pending`.
    pub async fn start_run(&self, run_id: &str, first: PhaseId) -> Result<bool, UpdateError> {
        self.update(run_id, |payload| {
            if payload.run_status != RunStatus::Pending {
                return Mutation::Skip(false);
            }
            let now = Utc::now();
            payload.run_status = RunStatus::Running;
            payload.current_phase = Some(first);
            if let Some(phase) = payload.phase_mut(first) {
                phase.status = StepStatus::Running;
                phase.started_at = Some(now);
            }
            Mutation::Write(true)
        })
        .await
    }

    /// Close `from` and open `to`. Only applies while `from` is current, so
    /// a redelivered phase-complete notification is a no-op.
    pub async fn advance_phase(
        &self,
        run_id: &str,
        from: PhaseId,
        to: PhaseId,
    ) -> Result<bool, UpdateError> {
        self.update(run_id, |payload| {
            if payload.run_status != RunStatus::Running || payload.current_phase != Some(from) {
                return Mutation::Skip(false);
            }
            let now = Utc::now();
            if let Some(phase) = payload.phase_mut(from) {
                phase.status = StepStatus::Completed;
                phase.completed_at = Some(now);
            }
            if let Some(phase) = payload.phase_mut(to) {
                phase.status = StepStatus::Running;
                phase.started_at = Some(now);
            }
            payload.current_phase = Some(to);
            Mutation::Write(true)
        })
        .await
    }

    /// Close the last phase and complete the run.
    pub async fn complete_run(&self, run_id: &str, last: PhaseId) -> Result<bool, UpdateError> {
        self.update(run_id, |payload| {
            if payload.run_status != RunStatus::Running || payload.current_phase != Some(last) {
                return Mutation::Skip(false);
            }
            let now = Utc::now();
            if let Some(phase) = payload.phase_mut(last) {
                phase.status = StepStatus::Completed;
                phase.completed_at = Some(now);
            }
            payload.run_status = RunStatus::Completed;
            payload.finished_at = Some(now);
            Mutation::Write(true)
        })
        .await
    }

    /// Mark the run `ERROR`. Terminal runs and runs already in error are
    /// left alone; returns whether this call changed the status.
    pub async fn fail_run(&self, run_id: &str, error: RunError) -> Result<bool, UpdateError> {
        self.update(run_id, |payload| {
            if payload.run_status.is_terminal() || payload.run_status == RunStatus::Error {
                return Mutation::Skip(false);
            }
            if let Some(phase) = error.phase.and_then(|id| payload.phase_mut(id)) {
                phase.status = StepStatus::Error;
            }
            payload.run_status = RunStatus::Error;
            payload.finished_at = Some(error.at);
            payload.error = Some(error.clone());
            Mutation::Write(true)
        })
        .await
    }

    /// Cancel the run. Never overrides a completed run. Returns the status
    /// the run ends up in.
    pub async fn cancel(&self, run_id: &str) -> Result<RunStatus, UpdateError> {
        self.update(run_id, |payload| {
            if payload.run_status.is_terminal() {
                return Mutation::Skip(payload.run_status);
            }
            payload.run_status = RunStatus::Cancelled;
            payload.finished_at = Some(Utc::now());
            Mutation::Write(RunStatus::Cancelled)
        })
        .await
    }

    /// Record an optional agent as degraded with a placeholder insight.
    pub async fn mark_degraded(
        &self,
        run_id: &str,
        agent: &str,
        placeholder: serde_json::Value,
    ) -> Result<bool, UpdateError> {
        self.update(run_id, |payload| {
            if payload.degraded_agents.iter().any(|a| a == agent) {
                return Mutation::Skip(false);
            }
            payload.degraded_agents.push(agent.to_string());
            payload
                .agent_insights
                .entry(agent.to_string())
                .or_insert_with(|| placeholder.clone());
            Mutation::Write(true)
        })
        .await
    }

    /// Let an external synthesis step end the debate after the current round.
    pub async fn settle_debate(&self, run_id: &str) -> Result<(), UpdateError> {
        self.update(run_id, |payload| {
            if payload.debate_settled {
                return Mutation::Skip(());
            }
            payload.debate_settled = true;
            Mutation::Write(())
        })
        .await
    }

    /// Payload joined with the message side table.
    pub async fn snapshot(&self, run_id: &str) -> Result<WorkflowRun, UpdateError> {
        let run = self.store.read_run(run_id).await?;
        let messages = self.store.read_messages(run_id).await?;
        Ok(WorkflowRun {
            id: run.run_id,
            payload: run.payload,
            messages,
            version_token: run.version,
        })
    }
}
