//! Invocation contract and the work-queue dispatcher.
//!
//! A dispatch returns as soon as the invocation is queued. Nobody awaits the
//! outcome of the chain it starts: the worker pool runs each invocation as a
//! detached task, and results travel only through the run record and
//! coordinator notifications.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{AgentError, ErrorType};
use crate::phases::PhaseId;
use crate::retry::RetryEnvelope;
use crate::settings::RunSettings;
use crate::state::RunId;

/// Where in the pipeline an invocation belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseContext {
    pub phase: PhaseId,
    /// Debate round, for bull/bear turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
}

/// Inbound invocation payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationRequest {
    pub run_id: RunId,
    pub subject: String,
    pub owner: String,
    pub settings: RunSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase_context: Option<PhaseContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_envelope: Option<RetryEnvelope>,
}

impl InvocationRequest {
    pub fn new(
        run_id: impl Into<RunId>,
        subject: impl Into<String>,
        owner: impl Into<String>,
        settings: RunSettings,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            subject: subject.into(),
            owner: owner.into(),
            settings,
            phase_context: None,
            retry_envelope: None,
        }
    }

    pub fn in_phase(mut self, phase: PhaseId, round: Option<u32>) -> Self {
        self.phase_context = Some(PhaseContext { phase, round });
        self
    }

    pub fn with_envelope(mut self, envelope: RetryEnvelope) -> Self {
        self.retry_envelope = Some(envelope);
        self
    }

    pub fn phase(&self) -> Option<PhaseId> {
        self.phase_context.map(|c| c.phase)
    }

    pub fn round(&self) -> Option<u32> {
        self.phase_context.and_then(|c| c.round)
    }

    /// Attempt number carried by the envelope (0 for an original call).
    pub fn attempt(&self) -> u32 {
        self.retry_envelope.as_ref().map_or(0, |e| e.attempt)
    }

    /// Request for the next agent in a chain: same run, fresh retry budget.
    pub fn handoff(&self, phase: PhaseId, round: Option<u32>) -> Self {
        Self {
            phase_context: Some(PhaseContext { phase, round }),
            retry_envelope: None,
            ..self.clone()
        }
    }
}

/// Outbound invocation result.
///
/// `success: false` without `retry_scheduled` means the agent gave up and
/// has already escalated (or the run no longer accepts work). Callers must
/// not retry it themselves.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_scheduled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
}

impl InvocationResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            retry_scheduled: None,
            error: None,
            error_type: None,
        }
    }

    pub fn retry_scheduled(err: &AgentError) -> Self {
        Self {
            success: false,
            retry_scheduled: Some(true),
            error: Some(err.message.clone()),
            error_type: Some(err.error_type),
        }
    }

    pub fn failed(err: &AgentError) -> Self {
        Self {
            success: false,
            retry_scheduled: None,
            error: Some(err.message.clone()),
            error_type: Some(err.error_type),
        }
    }

    /// The run was cancelled or already finished; nothing was written.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            retry_scheduled: None,
            error: Some(reason.into()),
            error_type: None,
        }
    }
}

/// Errors from dispatching an invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("no worker registered for agent '{0}'")]
    UnknownAgent(String),

    #[error("work queue closed")]
    QueueClosed,

    #[error("dispatch unavailable: {0}")]
    Unavailable(String),
}

/// Starts an agent invocation without awaiting it.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, agent: &str, request: InvocationRequest) -> Result<(), DispatchError>;
}

/// Shared reference to a dispatcher
pub type SharedDispatcher = Arc<dyn Dispatcher>;

/// One queued invocation.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub agent: String,
    pub request: InvocationRequest,
}

/// Pushes invocations onto an unbounded work queue.
pub struct QueueDispatcher {
    tx: mpsc::UnboundedSender<WorkItem>,
    known: HashSet<String>,
}

impl QueueDispatcher {
    /// Create the dispatcher and the receiving end of its queue.
    pub fn new(
        known_agents: impl IntoIterator<Item = String>,
    ) -> (Self, mpsc::UnboundedReceiver<WorkItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            tx,
            known: known_agents.into_iter().collect(),
        };
        (dispatcher, rx)
    }
}

#[async_trait]
impl Dispatcher for QueueDispatcher {
    async fn dispatch(&self, agent: &str, request: InvocationRequest) -> Result<(), DispatchError> {
        if !self.known.contains(agent) {
            return Err(DispatchError::UnknownAgent(agent.to_string()));
        }
        debug!(
            run_id = %request.run_id,
            agent,
            attempt = request.attempt(),
            "Queued invocation"
        );
        self.tx
            .send(WorkItem {
                agent: agent.to_string(),
                request,
            })
            .map_err(|_| DispatchError::QueueClosed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> InvocationRequest {
        InvocationRequest::new("r1", "AAPL", "user-1", RunSettings::default())
    }

    #[tokio::test]
    async fn test_queue_dispatcher_rejects_unknown_agent() {
        let (dispatcher, mut rx) = QueueDispatcher::new(vec!["trader".to_string()]);
        let err = dispatcher.dispatch("oracle", request()).await.unwrap_err();
        assert_eq!(err, DispatchError::UnknownAgent("oracle".into()));

        dispatcher.dispatch("trader", request()).await.unwrap();
        let item = rx.recv().await.unwrap();
        assert_eq!(item.agent, "trader");
        assert_eq!(item.request.run_id, "r1");
    }

    #[tokio::test]
    async fn test_queue_dispatcher_closed() {
        let (dispatcher, rx) = QueueDispatcher::new(vec!["trader".to_string()]);
        drop(rx);
        assert_eq!(
            dispatcher.dispatch("trader", request()).await,
            Err(DispatchError::QueueClosed)
        );
    }

    #[test]
    fn test_handoff_resets_envelope() {
        let settings = RunSettings::default();
        let req = request()
            .in_phase(PhaseId::Research, Some(1))
            .with_envelope(RetryEnvelope::first("bull-researcher", &settings).next_attempt());
        assert_eq!(req.attempt(), 1);
        let next = req.handoff(PhaseId::Research, Some(2));
        assert_eq!(next.attempt(), 0);
        assert_eq!(next.round(), Some(2));
        assert_eq!(next.subject, "AAPL");
    }

    #[test]
    fn test_response_wire_format() {
        let err = AgentError::new(ErrorType::RateLimit, "slow down");
        let json = serde_json::to_value(InvocationResponse::retry_scheduled(&err)).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["retryScheduled"], true);
        assert_eq!(json["errorType"], "rate_limit");

        let json = serde_json::to_value(InvocationResponse::ok()).unwrap();
        assert!(json.get("retryScheduled").is_none());
    }
}
