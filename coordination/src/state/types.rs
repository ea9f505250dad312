//! Run record types persisted by the state store.
//!
//! A [`RunPayload`] is the versioned document every agent mutates through the
//! atomic update layer. Messages live in an append-only side table and are
//! only joined back in by [`WorkflowRun`] snapshots.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ErrorType;
use crate::phases::PhaseId;
use crate::settings::RunSettings;

/// Unique identifier for a workflow run.
pub type RunId = String;

/// Optimistic-concurrency compare key. Every successful write advances it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionToken(pub u64);

impl VersionToken {
    pub fn initial() -> Self {
        Self(1)
    }

    pub fn next(self) -> Self {
        Self(self.0.saturating_add(1))
    }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    /// Not always terminal: agents may still report while the coordinator
    /// decides whether the phase is recoverable.
    Error,
    Cancelled,
}

impl RunStatus {
    /// Completed and cancelled runs never change status again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Status of one agent step (or of a whole phase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl StepStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Running => 1,
            Self::Completed | Self::Error => 2,
        }
    }

    pub fn is_resolved(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Completed => write!(f, "completed"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Failure details recorded on an errored step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub error_type: ErrorType,
    pub message: String,
}

/// Requested change to a single agent step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepUpdate {
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
    /// The one allowed regression: `running → pending` after a self-retry
    /// dispatch never reached the runtime.
    #[serde(default)]
    pub reset_dispatch: bool,
}

impl StepUpdate {
    pub fn running() -> Self {
        Self {
            status: StepStatus::Running,
            progress: None,
            failure: None,
            reset_dispatch: false,
        }
    }

    pub fn progress(progress: u8) -> Self {
        Self {
            progress: Some(progress.min(100)),
            ..Self::running()
        }
    }

    pub fn completed() -> Self {
        Self {
            status: StepStatus::Completed,
            progress: Some(100),
            failure: None,
            reset_dispatch: false,
        }
    }

    pub fn failed(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Error,
            progress: None,
            failure: Some(StepFailure {
                error_type,
                message: message.into(),
            }),
            reset_dispatch: false,
        }
    }

    pub fn reset_dispatch() -> Self {
        Self {
            status: StepStatus::Pending,
            progress: Some(0),
            failure: None,
            reset_dispatch: true,
        }
    }
}

/// Result of merging a [`StepUpdate`] into a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepChange {
    /// The step changed.
    Applied,
    /// The update matched the current state; nothing to write.
    Unchanged,
    /// The transition would regress the step.
    Rejected { current: StepStatus },
}

/// One agent's slot inside a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStepState {
    pub name: String,
    pub status: StepStatus,
    pub progress: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<StepFailure>,
}

impl AgentStepState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: StepStatus::Pending,
            progress: 0,
            started_at: None,
            completed_at: None,
            error_at: None,
            failure: None,
        }
    }

    /// Merge an update, enforcing monotonic status transitions.
    pub fn apply(&mut self, update: &StepUpdate, now: DateTime<Utc>) -> StepChange {
        if update.reset_dispatch {
            return match self.status {
                StepStatus::Running => {
                    self.status = StepStatus::Pending;
                    self.progress = 0;
                    self.started_at = None;
                    StepChange::Applied
                }
                StepStatus::Pending => StepChange::Unchanged,
                current => StepChange::Rejected { current },
            };
        }

        if update.status == self.status {
            return match (update.status, update.progress) {
                (StepStatus::Running, Some(p)) if p > self.progress => {
                    self.progress = p;
                    StepChange::Applied
                }
                _ => StepChange::Unchanged,
            };
        }

        if update.status.rank() <= self.status.rank() {
            return StepChange::Rejected {
                current: self.status,
            };
        }

        self.status = update.status;
        match update.status {
            StepStatus::Running => {
                self.started_at = Some(now);
                self.progress = update.progress.unwrap_or(self.progress);
            }
            StepStatus::Completed => {
                self.completed_at = Some(now);
                self.progress = 100;
            }
            StepStatus::Error => {
                self.error_at = Some(now);
                self.failure = update.failure.clone();
            }
            StepStatus::Pending => {}
        }
        StepChange::Applied
    }
}

/// All agent steps of one phase, in sequencer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseState {
    pub phase: PhaseId,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub agents: Vec<AgentStepState>,
}

impl PhaseState {
    pub fn new(phase: PhaseId, agents: impl IntoIterator<Item = String>) -> Self {
        Self {
            phase,
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            agents: agents.into_iter().map(AgentStepState::new).collect(),
        }
    }

    pub fn agent(&self, name: &str) -> Option<&AgentStepState> {
        self.agents.iter().find(|a| a.name == name)
    }

    pub fn agent_mut(&mut self, name: &str) -> Option<&mut AgentStepState> {
        self.agents.iter_mut().find(|a| a.name == name)
    }
}

/// Kind of a log message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Info,
    Analysis,
    Debate,
    Decision,
    Error,
    System,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Analysis => "analysis",
            Self::Debate => "debate",
            Self::Decision => "decision",
            Self::Error => "error",
            Self::System => "system",
        };
        f.write_str(s)
    }
}

/// Immutable entry in the run's message log.
///
/// Ordering is the side table's insertion order; `timestamp` is advisory and
/// only feeds the dedup fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub agent: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub fingerprint: String,
}

impl Message {
    pub fn new(agent: impl Into<String>, text: impl Into<String>, kind: MessageType) -> Self {
        Self {
            agent: agent.into(),
            text: text.into(),
            timestamp: Utc::now(),
            kind,
            fingerprint: String::new(),
        }
    }

    /// Derive the dedup fingerprint from content and the wall-clock bucket.
    pub fn with_fingerprint(mut self, window_secs: u64) -> Self {
        let bucket = self.timestamp.timestamp().max(0) as u64 / window_secs.max(1);
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.agent.as_bytes());
        hasher.update(&[0]);
        hasher.update(self.kind.to_string().as_bytes());
        hasher.update(&[0]);
        hasher.update(self.text.as_bytes());
        hasher.update(&bucket.to_le_bytes());
        self.fingerprint = hasher.finalize().to_hex().to_string();
        self
    }
}

/// Outcome of appending to the message side table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendOutcome {
    Appended { seq: u64 },
    Duplicate,
}

/// Which side of the research debate a contribution belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebateSide {
    Bull,
    Bear,
}

impl fmt::Display for DebateSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bull => write!(f, "bull"),
            Self::Bear => write!(f, "bear"),
        }
    }
}

/// One bull/bear exchange. Each side's contribution is written independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebateRound {
    pub round: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bull_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bear_text: Option<String>,
    #[serde(default)]
    pub bull_points: Vec<String>,
    #[serde(default)]
    pub bear_points: Vec<String>,
    pub started_at: DateTime<Utc>,
}

impl DebateRound {
    pub fn new(round: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            round,
            bull_text: None,
            bear_text: None,
            bull_points: Vec::new(),
            bear_points: Vec::new(),
            started_at,
        }
    }

    pub fn text(&self, side: DebateSide) -> Option<&str> {
        match side {
            DebateSide::Bull => self.bull_text.as_deref(),
            DebateSide::Bear => self.bear_text.as_deref(),
        }
    }

    pub fn has_contribution(&self, side: DebateSide) -> bool {
        self.text(side).is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.bull_text.is_some() && self.bear_text.is_some()
    }

    /// Record `side`'s contribution unless it already has one. The other
    /// side is untouched. Returns whether anything was written.
    pub fn set_side(&mut self, side: DebateSide, text: &str, points: &[String]) -> bool {
        if self.has_contribution(side) {
            return false;
        }
        match side {
            DebateSide::Bull => {
                self.bull_text = Some(text.to_string());
                self.bull_points = points.to_vec();
            }
            DebateSide::Bear => {
                self.bear_text = Some(text.to_string());
                self.bear_points = points.to_vec();
            }
        }
        true
    }
}

/// Result of merging one side into a debate round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DebateMerge {
    pub round: DebateRound,
    /// False when the side was already recorded (a duplicate turn).
    pub applied: bool,
}

/// Merge one side's contribution into the round list, creating the round if
/// needed. Rounds stay sorted by number. The first contribution per side wins.
pub fn merge_debate_round(
    rounds: &mut Vec<DebateRound>,
    round: u32,
    side: DebateSide,
    text: &str,
    points: &[String],
    now: DateTime<Utc>,
) -> DebateMerge {
    let idx = match rounds.iter().position(|r| r.round == round) {
        Some(idx) => idx,
        None => {
            rounds.push(DebateRound::new(round, now));
            rounds.sort_by_key(|r| r.round);
            rounds
                .iter()
                .position(|r| r.round == round)
                .unwrap_or(rounds.len() - 1)
        }
    };
    let applied = rounds[idx].set_side(side, text, points);
    DebateMerge {
        round: rounds[idx].clone(),
        applied,
    }
}

/// Terminal error surfaced on a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunError {
    pub error_type: ErrorType,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PhaseId>,
    pub at: DateTime<Utc>,
}

/// The versioned run document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPayload {
    /// Ticker under analysis.
    pub subject: String,
    /// Requesting user.
    pub owner: String,
    pub run_status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_phase: Option<PhaseId>,
    pub workflow_steps: Vec<PhaseState>,
    /// Agent key → opaque structured result.
    #[serde(default)]
    pub agent_insights: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub debate_rounds: Vec<DebateRound>,
    /// Set by an external synthesis step to end the debate early.
    #[serde(default)]
    pub debate_settled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    /// Optional agents whose failure the coordinator tolerated.
    #[serde(default)]
    pub degraded_agents: Vec<String>,
    #[serde(default)]
    pub settings: RunSettings,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunPayload {
    pub fn new(
        subject: impl Into<String>,
        owner: impl Into<String>,
        settings: RunSettings,
        workflow_steps: Vec<PhaseState>,
    ) -> Self {
        Self {
            subject: subject.into(),
            owner: owner.into(),
            run_status: RunStatus::Pending,
            current_phase: None,
            workflow_steps,
            agent_insights: BTreeMap::new(),
            debate_rounds: Vec::new(),
            debate_settled: false,
            decision: None,
            confidence: None,
            error: None,
            degraded_agents: Vec::new(),
            settings,
            created_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn phase(&self, phase: PhaseId) -> Option<&PhaseState> {
        self.workflow_steps.iter().find(|p| p.phase == phase)
    }

    pub fn phase_mut(&mut self, phase: PhaseId) -> Option<&mut PhaseState> {
        self.workflow_steps.iter_mut().find(|p| p.phase == phase)
    }

    pub fn step(&self, phase: PhaseId, agent: &str) -> Option<&AgentStepState> {
        self.phase(phase).and_then(|p| p.agent(agent))
    }

    pub fn step_mut(&mut self, phase: PhaseId, agent: &str) -> Option<&mut AgentStepState> {
        self.phase_mut(phase).and_then(|p| p.agent_mut(agent))
    }

    pub fn debate_round(&self, round: u32) -> Option<&DebateRound> {
        self.debate_rounds.iter().find(|r| r.round == round)
    }

    pub fn is_cancelled(&self) -> bool {
        self.run_status == RunStatus::Cancelled
    }
}

/// A payload together with the version token it was read at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedRun {
    pub run_id: RunId,
    pub payload: RunPayload,
    pub version: VersionToken,
}

/// Full read model: payload plus the message side table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: RunId,
    #[serde(flatten)]
    pub payload: RunPayload,
    pub messages: Vec<Message>,
    pub version_token: VersionToken,
}
