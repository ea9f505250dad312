//! Debate round controller: bounded bull/bear loop for the research phase.
//!
//! # Debate Flow
//!
//! ```text
//! bull(r) ──▶ bear(r) ──▶ [round limit reached or settled?]
//!    ▲                        │
//!    │      no                │ yes
//!    └── bull(r+1) ◀──────────┤
//!                             ▼
//!                    synthesis step / phase end
//! ```
//!
//! Bull always precedes bear within a round and rounds never overlap. Both
//! contributions of a round are merged through the atomic debate-round
//! procedure, so neither side can clobber the other.

use serde::{Deserialize, Serialize};

use crate::phases::DebatePair;
use crate::state::types::{DebateRound, DebateSide};

/// What follows a debate turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateStep {
    /// Another turn: invoke `agent` for `round`.
    Turn { agent: String, round: u32 },
    /// The debate is over; continue with the phase's normal handoff.
    Conclude { rounds: u32 },
}

/// Decides whether another round starts after each turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebateController {
    max_rounds: u32,
}

impl DebateController {
    pub fn new(max_rounds: u32) -> Self {
        Self {
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Progress to report on a participant's step after `round`.
    pub fn progress(&self, round: u32) -> u8 {
        let pct = (u64::from(round.min(self.max_rounds)) * 100) / u64::from(self.max_rounds);
        // Held below 100 until the debate concludes and the step completes.
        pct.min(99) as u8
    }

    /// Next step after `side` finished its turn in `round`.
    ///
    /// `settled` lets an external synthesis step end the debate early; it is
    /// only honored after a bear turn so rounds always close on both sides.
    pub fn after_turn(
        &self,
        pair: &DebatePair,
        side: DebateSide,
        round: u32,
        settled: bool,
    ) -> DebateStep {
        match side {
            DebateSide::Bull => DebateStep::Turn {
                agent: pair.bear.clone(),
                round,
            },
            DebateSide::Bear if settled || round >= self.max_rounds => {
                DebateStep::Conclude { rounds: round }
            }
            DebateSide::Bear => DebateStep::Turn {
                agent: pair.bull.clone(),
                round: round + 1,
            },
        }
    }

    /// Number of rounds where both sides have spoken.
    pub fn completed_rounds(rounds: &[DebateRound]) -> u32 {
        rounds.iter().filter(|r| r.is_complete()).count() as u32
    }
}

impl Default for DebateController {
    fn default() -> Self {
        Self::new(2)
    }
}
