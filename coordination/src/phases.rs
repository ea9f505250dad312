//! Phase sequencer: the static phase → agents → next-phase table.
//!
//! Agents hand off to each other directly inside a phase. The only point
//! where normal (non-error) control returns to the coordinator is when the
//! sequencer answers [`Handoff::LastInPhase`].
//!
//! ```text
//! analysis ──▶ research ──▶ trading ──▶ risk ──▶ portfolio
//! [5 analysts]  [bull⇄bear]   [trader]   [3 analysts]  [portfolio manager]
//!               + manager                + manager
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::types::{DebateSide, PhaseState};

/// Phase identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseId {
    Analysis,
    Research,
    Trading,
    Risk,
    Portfolio,
}

impl PhaseId {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Analysis => "analysis",
            Self::Research => "research",
            Self::Trading => "trading",
            Self::Risk => "risk",
            Self::Portfolio => "portfolio",
        }
    }
}

impl fmt::Display for PhaseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseId {
    type Err = SequencerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analysis" => Ok(Self::Analysis),
            "research" => Ok(Self::Research),
            "trading" => Ok(Self::Trading),
            "risk" => Ok(Self::Risk),
            "portfolio" => Ok(Self::Portfolio),
            other => Err(SequencerError::UnknownPhase(other.to_string())),
        }
    }
}

/// Well-known agent names of the standard pipeline.
pub mod agents {
    pub const MACRO_ANALYST: &str = "macro-analyst";
    pub const MARKET_ANALYST: &str = "market-analyst";
    pub const NEWS_ANALYST: &str = "news-analyst";
    pub const SOCIAL_MEDIA_ANALYST: &str = "social-media-analyst";
    pub const FUNDAMENTALS_ANALYST: &str = "fundamentals-analyst";
    pub const BULL_RESEARCHER: &str = "bull-researcher";
    pub const BEAR_RESEARCHER: &str = "bear-researcher";
    pub const RESEARCH_MANAGER: &str = "research-manager";
    pub const TRADER: &str = "trader";
    pub const RISKY_ANALYST: &str = "risky-analyst";
    pub const SAFE_ANALYST: &str = "safe-analyst";
    pub const NEUTRAL_ANALYST: &str = "neutral-analyst";
    pub const RISK_MANAGER: &str = "risk-manager";
    pub const PORTFOLIO_MANAGER: &str = "portfolio-manager";
}

/// Errors from sequencer lookups. All of them fail closed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequencerError {
    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("agent '{agent}' is not part of phase {phase}")]
    UnknownAgent { phase: PhaseId, agent: String },

    #[error("phase {0} has no agents")]
    EmptyPhase(PhaseId),
}

/// One agent slot in a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub name: String,
    /// Load-bearing agents abort the run on failure; optional ones degrade.
    pub required: bool,
}

impl AgentSpec {
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
        }
    }
}

/// Debate participants of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebatePair {
    pub bull: String,
    pub bear: String,
}

/// A phase: ordered agents, optional synthesis agent, next phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSpec {
    pub id: PhaseId,
    pub agents: Vec<AgentSpec>,
    /// Synthesis step that runs after every agent in `agents`.
    pub final_agent: Option<AgentSpec>,
    pub next: Option<PhaseId>,
    /// When set, the bull/bear pair loops under the debate controller.
    pub debate: Option<DebatePair>,
}

impl PhaseSpec {
    pub fn new(id: PhaseId, agents: Vec<AgentSpec>) -> Self {
        Self {
            id,
            agents,
            final_agent: None,
            next: None,
            debate: None,
        }
    }

    pub fn with_final(mut self, agent: AgentSpec) -> Self {
        self.final_agent = Some(agent);
        self
    }

    pub fn then(mut self, next: PhaseId) -> Self {
        self.next = Some(next);
        self
    }

    pub fn with_debate(mut self, bull: impl Into<String>, bear: impl Into<String>) -> Self {
        self.debate = Some(DebatePair {
            bull: bull.into(),
            bear: bear.into(),
        });
        self
    }

    /// All agents in execution order, synthesis step last.
    pub fn ordered_agents(&self) -> impl Iterator<Item = &AgentSpec> {
        self.agents.iter().chain(self.final_agent.iter())
    }

    pub fn agent(&self, name: &str) -> Option<&AgentSpec> {
        self.ordered_agents().find(|a| a.name == name)
    }

    /// Debate side played by `agent`, if this phase debates.
    pub fn debate_side(&self, agent: &str) -> Option<DebateSide> {
        let pair = self.debate.as_ref()?;
        if pair.bull == agent {
            Some(DebateSide::Bull)
        } else if pair.bear == agent {
            Some(DebateSide::Bear)
        } else {
            None
        }
    }
}

/// What an agent does after durably recording its result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Handoff {
    /// Invoke this agent directly.
    Next { agent: String },
    /// Notify the coordinator instead of self-chaining.
    LastInPhase,
}

impl Handoff {
    pub fn is_last_in_phase(&self) -> bool {
        matches!(self, Self::LastInPhase)
    }
}

/// Static phase table with lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhaseSequencer {
    phases: Vec<PhaseSpec>,
}

impl PhaseSequencer {
    /// Build from an explicit table. The first entry is the starting phase.
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        Self { phases }
    }

    /// The standard five-phase investment analysis pipeline.
    pub fn standard() -> Self {
        use agents::*;
        Self::new(vec![
            PhaseSpec::new(
                PhaseId::Analysis,
                vec![
                    AgentSpec::optional(MACRO_ANALYST),
                    AgentSpec::required(MARKET_ANALYST),
                    AgentSpec::optional(NEWS_ANALYST),
                    AgentSpec::optional(SOCIAL_MEDIA_ANALYST),
                    AgentSpec::required(FUNDAMENTALS_ANALYST),
                ],
            )
            .then(PhaseId::Research),
            PhaseSpec::new(
                PhaseId::Research,
                vec![
                    AgentSpec::required(BULL_RESEARCHER),
                    AgentSpec::required(BEAR_RESEARCHER),
                ],
            )
            .with_debate(BULL_RESEARCHER, BEAR_RESEARCHER)
            .with_final(AgentSpec::required(RESEARCH_MANAGER))
            .then(PhaseId::Trading),
            PhaseSpec::new(PhaseId::Trading, vec![AgentSpec::required(TRADER)]).then(PhaseId::Risk),
            PhaseSpec::new(
                PhaseId::Risk,
                vec![
                    AgentSpec::optional(RISKY_ANALYST),
                    AgentSpec::optional(SAFE_ANALYST),
                    AgentSpec::optional(NEUTRAL_ANALYST),
                ],
            )
            .with_final(AgentSpec::required(RISK_MANAGER))
            .then(PhaseId::Portfolio),
            PhaseSpec::new(
                PhaseId::Portfolio,
                vec![AgentSpec::required(PORTFOLIO_MANAGER)],
            ),
        ])
    }

    pub fn phases(&self) -> &[PhaseSpec] {
        &self.phases
    }

    pub fn first_phase(&self) -> Option<PhaseId> {
        self.phases.first().map(|p| p.id)
    }

    pub fn phase(&self, id: PhaseId) -> Result<&PhaseSpec, SequencerError> {
        self.phases
            .iter()
            .find(|p| p.id == id)
            .ok_or_else(|| SequencerError::UnknownPhase(id.to_string()))
    }

    pub fn next_phase(&self, id: PhaseId) -> Result<Option<PhaseId>, SequencerError> {
        Ok(self.phase(id)?.next)
    }

    pub fn first_agent(&self, id: PhaseId) -> Result<&AgentSpec, SequencerError> {
        self.phase(id)?
            .ordered_agents()
            .next()
            .ok_or(SequencerError::EmptyPhase(id))
    }

    pub fn agent_spec(&self, id: PhaseId, agent: &str) -> Result<&AgentSpec, SequencerError> {
        self.phase(id)?
            .agent(agent)
            .ok_or_else(|| SequencerError::UnknownAgent {
                phase: id,
                agent: agent.to_string(),
            })
    }

    /// Phase an agent belongs to (first match).
    pub fn phase_of(&self, agent: &str) -> Option<PhaseId> {
        self.phases
            .iter()
            .find(|p| p.agent(agent).is_some())
            .map(|p| p.id)
    }

    /// Resolve who runs after `current` in `phase`.
    ///
    /// Unknown agents (e.g. after a rename) are an error, never a silent
    /// stall.
    pub fn resolve_next(&self, phase: PhaseId, current: &str) -> Result<Handoff, SequencerError> {
        let spec = self.phase(phase)?;

        if let Some(idx) = spec.agents.iter().position(|a| a.name == current) {
            if let Some(next) = spec.agents.get(idx + 1) {
                return Ok(Handoff::Next {
                    agent: next.name.clone(),
                });
            }
            return Ok(match &spec.final_agent {
                Some(final_agent) => Handoff::Next {
                    agent: final_agent.name.clone(),
                },
                None => Handoff::LastInPhase,
            });
        }

        match &spec.final_agent {
            Some(final_agent) if final_agent.name == current => Ok(Handoff::LastInPhase),
            _ => Err(SequencerError::UnknownAgent {
                phase,
                agent: current.to_string(),
            }),
        }
    }

    /// Fresh per-phase step state for a new run.
    pub fn initial_steps(&self) -> Vec<PhaseState> {
        self.phases
            .iter()
            .map(|p| PhaseState::new(p.id, p.ordered_agents().map(|a| a.name.clone())))
            .collect()
    }
}

impl Default for PhaseSequencer {
    fn default() -> Self {
        Self::standard()
    }
}
