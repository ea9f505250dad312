//! Pipeline events
//!
//! Published for observers (CLI progress, tests). They are not persisted:
//! recovery always re-reads the run record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorType;
use crate::phases::PhaseId;
use crate::state::RunId;

/// Every observable pipeline transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    RunStarted {
        run_id: RunId,
        subject: String,
        phase: PhaseId,
        timestamp: DateTime<Utc>,
    },

    PhaseAdvanced {
        run_id: RunId,
        from: PhaseId,
        to: PhaseId,
        timestamp: DateTime<Utc>,
    },

    AgentCompleted {
        run_id: RunId,
        phase: PhaseId,
        agent: String,
        /// Debate round, for bull/bear turns.
        round: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// An optional agent failed and the pipeline continued without it.
    AgentDegraded {
        run_id: RunId,
        phase: PhaseId,
        agent: String,
        error_type: ErrorType,
        timestamp: DateTime<Utc>,
    },

    RetryScheduled {
        run_id: RunId,
        agent: String,
        attempt: u32,
        error_type: ErrorType,
        timestamp: DateTime<Utc>,
    },

    /// The watchdog saw no write within the agent's window.
    StuckWorker {
        run_id: RunId,
        agent: String,
        waited_ms: u64,
        timestamp: DateTime<Utc>,
    },

    RunCompleted {
        run_id: RunId,
        decision: Option<String>,
        timestamp: DateTime<Utc>,
    },

    RunFailed {
        run_id: RunId,
        agent: String,
        error_type: ErrorType,
        message: String,
        timestamp: DateTime<Utc>,
    },

    RunCancelled {
        run_id: RunId,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::PhaseAdvanced { run_id, .. }
            | Self::AgentCompleted { run_id, .. }
            | Self::AgentDegraded { run_id, .. }
            | Self::RetryScheduled { run_id, .. }
            | Self::StuckWorker { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. } => run_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunStarted { timestamp, .. }
            | Self::PhaseAdvanced { timestamp, .. }
            | Self::AgentCompleted { timestamp, .. }
            | Self::AgentDegraded { timestamp, .. }
            | Self::RetryScheduled { timestamp, .. }
            | Self::StuckWorker { timestamp, .. }
            | Self::RunCompleted { timestamp, .. }
            | Self::RunFailed { timestamp, .. }
            | Self::RunCancelled { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run_started",
            Self::PhaseAdvanced { .. } => "phase_advanced",
            Self::AgentCompleted { .. } => "agent_completed",
            Self::AgentDegraded { .. } => "agent_degraded",
            Self::RetryScheduled { .. } => "retry_scheduled",
            Self::StuckWorker { .. } => "stuck_worker",
            Self::RunCompleted { .. } => "run_completed",
            Self::RunFailed { .. } => "run_failed",
            Self::RunCancelled { .. } => "run_cancelled",
        }
    }

    /// Whether the run ends with this event.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::RunCompleted { .. } | Self::RunFailed { .. } | Self::RunCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = PipelineEvent::PhaseAdvanced {
            run_id: "r1".into(),
            from: PhaseId::Analysis,
            to: PhaseId::Research,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "phase_advanced");
        assert_eq!(json["to"], "research");
        let back: PipelineEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_terminal_events() {
        let done = PipelineEvent::RunCancelled {
            run_id: "r1".into(),
            timestamp: Utc::now(),
        };
        assert!(done.is_terminal());
        assert_eq!(done.run_id(), "r1");
        let stuck = PipelineEvent::StuckWorker {
            run_id: "r1".into(),
            agent: "trader".into(),
            waited_ms: 1,
            timestamp: Utc::now(),
        };
        assert!(!stuck.is_terminal());
        assert_eq!(stuck.event_type(), "stuck_worker");
    }
}
