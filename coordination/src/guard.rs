//! Cancellation / completion guard run before any expensive work.
//!
//! The check fails open: if the run cannot be read, the invocation proceeds.
//! A wasted retry is cheaper than silently dropping needed work.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::phases::PhaseId;
use crate::state::{DebateSide, RunPayload, RunStatus, RunStore, StepStatus};

/// Outcome of the pre-flight check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardDecision {
    Proceed,
    /// This agent (or debate turn) already recorded its result.
    AlreadyCompleted { insight: Option<serde_json::Value> },
    Cancelled,
    /// Late or duplicate invocation that must not write.
    Stale { reason: String },
}

impl GuardDecision {
    pub fn should_proceed(&self) -> bool {
        matches!(self, Self::Proceed)
    }
}

/// Which invocation is being guarded.
#[derive(Debug, Clone, Copy)]
pub struct GuardTarget<'a> {
    pub run_id: &'a str,
    pub phase: PhaseId,
    pub agent: &'a str,
    /// Side and round, for debate turns.
    pub debate: Option<(DebateSide, u32)>,
}

/// Decide from an already-read payload.
pub fn evaluate(payload: &RunPayload, target: &GuardTarget<'_>) -> GuardDecision {
    match payload.run_status {
        RunStatus::Cancelled => return GuardDecision::Cancelled,
        RunStatus::Completed => {
            return GuardDecision::Stale {
                reason: "run already completed".into(),
            }
        }
        _ => {}
    }

    let Some(step) = payload.step(target.phase, target.agent) else {
        return GuardDecision::Stale {
            reason: format!("no step for {} in phase {}", target.agent, target.phase),
        };
    };

    match step.status {
        StepStatus::Completed => {
            return GuardDecision::AlreadyCompleted {
                insight: payload.agent_insights.get(target.agent).cloned(),
            }
        }
        StepStatus::Error => {
            return GuardDecision::Stale {
                reason: "step already failed".into(),
            }
        }
        StepStatus::Pending | StepStatus::Running => {}
    }

    if let Some((side, round)) = target.debate {
        if let Some(existing) = payload.debate_round(round) {
            if let Some(text) = existing.text(side) {
                return GuardDecision::AlreadyCompleted {
                    insight: Some(serde_json::Value::String(text.to_string())),
                };
            }
        }
    }

    GuardDecision::Proceed
}

/// Read the run and evaluate. Read errors proceed.
pub async fn check(store: &dyn RunStore, target: &GuardTarget<'_>) -> GuardDecision {
    match store.read_run(target.run_id).await {
        Ok(run) => {
            let decision = evaluate(&run.payload, target);
            if !decision.should_proceed() {
                debug!(
                    run_id = target.run_id,
                    agent = target.agent,
                    ?decision,
                    "Guard short-circuited invocation"
                );
            }
            decision
        }
        Err(e) => {
            warn!(
                run_id = target.run_id,
                agent = target.agent,
                error = %e,
                "Guard read failed, proceeding"
            );
            GuardDecision::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phases::PhaseSequencer;
    use crate::settings::RunSettings;
    use crate::state::types::merge_debate_round;
    use crate::state::{InMemoryStore, StepUpdate};
    use chrono::Utc;

    fn payload() -> RunPayload {
        RunPayload::new(
            "AMD",
            "user-1",
            RunSettings::default(),
            PhaseSequencer::standard().initial_steps(),
        )
    }

    fn target(agent: &str, phase: PhaseId) -> GuardTarget<'_> {
        GuardTarget {
            run_id: "r1",
            phase,
            agent,
            debate: None,
        }
    }

    #[test]
    fn test_pending_step_proceeds() {
        assert_eq!(
            evaluate(&payload(), &target("trader", PhaseId::Trading)),
            GuardDecision::Proceed
        );
    }

    #[test]
    fn test_completed_step_returns_cached_insight() {
        let mut p = payload();
        p.step_mut(PhaseId::Trading, "trader")
            .unwrap()
            .apply(&StepUpdate::completed(), Utc::now());
        p.agent_insights
            .insert("trader".into(), serde_json::json!({"action": "BUY"}));
        assert_eq!(
            evaluate(&p, &target("trader", PhaseId::Trading)),
            GuardDecision::AlreadyCompleted {
                insight: Some(serde_json::json!({"action": "BUY"}))
            }
        );
    }

    #[test]
    fn test_cancelled_and_completed_runs() {
        let mut p = payload();
        p.run_status = RunStatus::Cancelled;
        assert_eq!(
            evaluate(&p, &target("trader", PhaseId::Trading)),
            GuardDecision::Cancelled
        );
        p.run_status = RunStatus::Completed;
        assert!(matches!(
            evaluate(&p, &target("trader", PhaseId::Trading)),
            GuardDecision::Stale { .. }
        ));
    }

    #[test]
    fn test_error_run_still_proceeds() {
        let mut p = payload();
        p.run_status = RunStatus::Error;
        assert!(evaluate(&p, &target("trader", PhaseId::Trading)).should_proceed());
    }

    #[test]
    fn test_debate_turn_checked_per_round() {
        let mut p = payload();
        merge_debate_round(
            &mut p.debate_rounds,
            1,
            DebateSide::Bull,
            "growth",
            &[],
            Utc::now(),
        );
        let round_one = GuardTarget {
            debate: Some((DebateSide::Bull, 1)),
            ..target("bull-researcher", PhaseId::Research)
        };
        assert!(matches!(
            evaluate(&p, &round_one),
            GuardDecision::AlreadyCompleted { .. }
        ));
        let round_two = GuardTarget {
            debate: Some((DebateSide::Bull, 2)),
            ..round_one
        };
        assert!(evaluate(&p, &round_two).should_proceed());
        let bear = GuardTarget {
            debate: Some((DebateSide::Bear, 1)),
            ..target("bear-researcher", PhaseId::Research)
        };
        assert!(evaluate(&p, &bear).should_proceed());
    }

    #[tokio::test]
    async fn test_read_failure_fails_open() {
        let store = InMemoryStore::new();
        store.faults().set_available(false);
        assert_eq!(
            check(&store, &target("trader", PhaseId::Trading)).await,
            GuardDecision::Proceed
        );
    }
}
