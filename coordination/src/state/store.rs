//! State store interface.
//!
//! The store is a relational record per run plus an append-only message side
//! table. Besides plain reads and the optimistic conditional write it exposes
//! two atomic procedures for the highest-contention mutations: step-status
//! flips and debate-round merges.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{
    merge_debate_round, AppendOutcome, DebateMerge, DebateSide, Message, RunPayload, StepChange,
    StepUpdate, VersionToken, VersionedRun,
};
use crate::phases::PhaseId;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Run not found: {0}")]
    NotFound(String),

    #[error("Run already exists: {0}")]
    AlreadyExists(String),

    #[error("Step '{agent}' not found in phase {phase}")]
    StepNotFound { phase: PhaseId, agent: String },

    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Atomic procedure unavailable: {0}")]
    ProcedureUnavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[cfg(feature = "postgres")]
    #[error("Postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

impl StoreError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unavailable(_) | Self::ProcedureUnavailable(_) | Self::LockPoisoned => true,
            #[cfg(feature = "postgres")]
            Self::Postgres(e) => e.is_closed() || e.code().is_none(),
            _ => false,
        }
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a store
pub type SharedRunStore = Arc<dyn RunStore>;

/// Result of the step-status procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepMerge {
    pub change: StepChange,
    /// Version after the call (unchanged when nothing was written).
    pub version: VersionToken,
}

/// Persistence contract consumed by the atomic update layer.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Create a new run record.
    async fn insert_run(&self, run_id: &str, payload: &RunPayload) -> StoreResult<VersionToken>;

    /// Read `{payload, versionToken}`.
    async fn read_run(&self, run_id: &str) -> StoreResult<VersionedRun>;

    /// Write `payload` only if the stored token still equals `expected`.
    /// Returns rows affected (0 on a version conflict).
    async fn conditional_write(
        &self,
        run_id: &str,
        payload: &RunPayload,
        expected: VersionToken,
    ) -> StoreResult<u64>;

    /// Server-side read-merge-write of one agent step.
    async fn atomic_merge_step_status(
        &self,
        run_id: &str,
        phase: PhaseId,
        agent: &str,
        update: &StepUpdate,
    ) -> StoreResult<StepMerge>;

    /// Server-side merge of one side's contribution into a debate round.
    async fn atomic_merge_debate_round(
        &self,
        run_id: &str,
        round: u32,
        side: DebateSide,
        text: &str,
        points: &[String],
    ) -> StoreResult<DebateMerge>;

    /// Append to the message side table, skipping duplicate fingerprints.
    async fn append_message(&self, run_id: &str, message: &Message) -> StoreResult<AppendOutcome>;

    /// Messages in insertion order.
    async fn read_messages(&self, run_id: &str) -> StoreResult<Vec<Message>>;
}

/// Step merge shared by the procedure implementations and the CAS fallback.
///
/// Cancelled runs reject every step change.
pub fn merge_step(
    payload: &mut RunPayload,
    phase: PhaseId,
    agent: &str,
    update: &StepUpdate,
    now: DateTime<Utc>,
) -> StoreResult<StepChange> {
    let cancelled = payload.is_cancelled();
    let step = payload
        .step_mut(phase, agent)
        .ok_or_else(|| StoreError::StepNotFound {
            phase,
            agent: agent.to_string(),
        })?;
    if cancelled {
        return Ok(StepChange::Rejected {
            current: step.status,
        });
    }
    Ok(step.apply(update, now))
}

/// Debate merge shared by the procedure implementations and the CAS fallback.
pub fn merge_round(
    payload: &mut RunPayload,
    round: u32,
    side: DebateSide,
    text: &str,
    points: &[String],
    now: DateTime<Utc>,
) -> DebateMerge {
    merge_debate_round(&mut payload.debate_rounds, round, side, text, points, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::PhaseSequencer;
    use crate::settings::RunSettings;
    use crate::state::types::{RunStatus, StepStatus};

    fn payload() -> RunPayload {
        RunPayload::new(
            "MSFT",
            "user-1",
            RunSettings::default(),
            PhaseSequencer::standard().initial_steps(),
        )
    }

    #[test]
    fn test_merge_step_unknown_agent() {
        let mut p = payload();
        let err = merge_step(
            &mut p,
            PhaseId::Analysis,
            "ghost",
            &StepUpdate::running(),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, StoreError::StepNotFound { .. }));
    }

    #[test]
    fn test_merge_step_rejected_when_cancelled() {
        let mut p = payload();
        p.run_status = RunStatus::Cancelled;
        let change = merge_step(
            &mut p,
            PhaseId::Analysis,
            "market-analyst",
            &StepUpdate::running(),
            Utc::now(),
        )
        .unwrap();
        assert_eq!(
            change,
            StepChange::Rejected {
                current: StepStatus::Pending
            }
        );
    }

    #[test]
    fn test_store_error_transience() {
        assert!(StoreError::Unavailable("down".into()).is_transient());
        assert!(!StoreError::NotFound("r1".into()).is_transient());
    }
}
