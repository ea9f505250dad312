//! Coordinator notification channel.
//!
//! Agents notify the coordinator fire-and-forget: [`notify_detached`] spawns
//! the delivery with its own bounded retry so the notifying agent's response
//! path never blocks on it.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::error::{AgentError, ErrorType};
use crate::invocation::InvocationRequest;
use crate::phases::PhaseId;
use crate::settings::NotifyPolicy;
use crate::state::RunId;

/// Why the coordinator is being called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionType {
    /// Last agent of the phase recorded its result.
    PhaseComplete,
    /// An agent gave up (non-transient error or retry budget exhausted).
    AgentFailed,
    /// A self-retry could not be dispatched at all.
    InvocationFailed,
    /// The agent finished but could not resolve who runs next.
    HandoffFailed,
}

impl std::fmt::Display for CompletionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PhaseComplete => write!(f, "phase_complete"),
            Self::AgentFailed => write!(f, "agent_failed"),
            Self::InvocationFailed => write!(f, "invocation_failed"),
            Self::HandoffFailed => write!(f, "handoff_failed"),
        }
    }
}

/// Payload delivered to the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub run_id: RunId,
    pub phase: PhaseId,
    pub agent: String,
    pub completion_type: CompletionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<ErrorType>,
    /// Total invocation attempts, for failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    /// The invocation that could not be dispatched, for re-dispatch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<InvocationRequest>,
}

impl Notification {
    pub fn phase_complete(run_id: impl Into<RunId>, phase: PhaseId, agent: &str) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            agent: agent.to_string(),
            completion_type: CompletionType::PhaseComplete,
            error: None,
            error_type: None,
            attempts: None,
            request: None,
        }
    }

    pub fn agent_failed(
        run_id: impl Into<RunId>,
        phase: PhaseId,
        agent: &str,
        err: &AgentError,
        attempts: u32,
    ) -> Self {
        Self {
            completion_type: CompletionType::AgentFailed,
            error: Some(err.message.clone()),
            error_type: Some(err.error_type),
            attempts: Some(attempts),
            ..Self::phase_complete(run_id, phase, agent)
        }
    }

    pub fn invocation_failed(
        phase: PhaseId,
        agent: &str,
        reason: impl Into<String>,
        request: InvocationRequest,
    ) -> Self {
        let run_id = request.run_id.clone();
        Self {
            completion_type: CompletionType::InvocationFailed,
            error: Some(reason.into()),
            error_type: Some(ErrorType::Other),
            attempts: Some(request.attempt() + 1),
            request: Some(request),
            ..Self::phase_complete(run_id, phase, agent)
        }
    }

    pub fn handoff_failed(
        run_id: impl Into<RunId>,
        phase: PhaseId,
        agent: &str,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            completion_type: CompletionType::HandoffFailed,
            error: Some(reason.into()),
            error_type: Some(ErrorType::Other),
            ..Self::phase_complete(run_id, phase, agent)
        }
    }

    /// The failure this notification carries, if any.
    pub fn agent_error(&self) -> AgentError {
        AgentError::new(
            self.error_type.unwrap_or(ErrorType::Other),
            self.error.clone().unwrap_or_else(|| "unknown failure".into()),
        )
    }
}

/// Errors from delivering a notification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("coordinator channel closed")]
    Closed,

    #[error("coordinator unavailable: {0}")]
    Unavailable(String),
}

/// Delivery endpoint of the coordinator.
#[async_trait]
pub trait CoordinatorNotifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Shared reference to a notifier
pub type SharedNotifier = Arc<dyn CoordinatorNotifier>;

/// Delivers into the in-process coordinator loop.
pub struct QueueNotifier {
    tx: mpsc::UnboundedSender<Notification>,
}

impl QueueNotifier {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl CoordinatorNotifier for QueueNotifier {
    async fn deliver(&self, notification: &Notification) -> Result<(), NotifyError> {
        self.tx
            .send(notification.clone())
            .map_err(|_| NotifyError::Closed)
    }
}

/// Deliver with bounded retry. A closed channel is not retried.
pub async fn notify_with_retry(
    notifier: &dyn CoordinatorNotifier,
    notification: &Notification,
    policy: NotifyPolicy,
) -> Result<(), NotifyError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match notifier.deliver(notification).await {
            Ok(()) => {
                debug!(
                    run_id = %notification.run_id,
                    agent = %notification.agent,
                    kind = %notification.completion_type,
                    "Coordinator notified"
                );
                return Ok(());
            }
            Err(NotifyError::Closed) => return Err(NotifyError::Closed),
            Err(e) if attempt < max_attempts => {
                warn!(
                    run_id = %notification.run_id,
                    attempt,
                    error = %e,
                    "Notification failed, retrying"
                );
                tokio::time::sleep(policy.backoff.delay(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Fire-and-forget delivery on a detached task.
pub fn notify_detached(
    notifier: SharedNotifier,
    notification: Notification,
    policy: NotifyPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = notify_with_retry(notifier.as_ref(), &notification, policy).await {
            error!(
                run_id = %notification.run_id,
                agent = %notification.agent,
                kind = %notification.completion_type,
                error = %e,
                "Dropped coordinator notification"
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::Backoff;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures: AtomicU32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl CoordinatorNotifier for Flaky {
        async fn deliver(&self, _: &Notification) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Err(NotifyError::Unavailable("busy".into()));
            }
            Ok(())
        }
    }

    fn policy(max_attempts: u32) -> NotifyPolicy {
        NotifyPolicy {
            max_attempts,
            backoff: Backoff::exponential(10),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_delivered() {
        let flaky = Flaky {
            failures: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let n = Notification::phase_complete("r1", PhaseId::Analysis, "fundamentals-analyst");
        notify_with_retry(&flaky, &n, policy(3)).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_is_bounded() {
        let flaky = Flaky {
            failures: AtomicU32::new(10),
            calls: AtomicU32::new(0),
        };
        let n = Notification::phase_complete("r1", PhaseId::Analysis, "fundamentals-analyst");
        assert!(notify_with_retry(&flaky, &n, policy(3)).await.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_queue_notifier_delivers() {
        let (notifier, mut rx) = QueueNotifier::new();
        let err = AgentError::new(ErrorType::ApiKey, "bad key");
        let n = Notification::agent_failed("r1", PhaseId::Trading, "trader", &err, 1);
        notify_detached(Arc::new(notifier), n.clone(), NotifyPolicy::default())
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), n);
    }

    #[test]
    fn test_notification_wire_format() {
        let err = AgentError::new(ErrorType::Timeout, "no answer");
        let n = Notification::agent_failed("r1", PhaseId::Risk, "safe-analyst", &err, 3);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["completionType"], "agent_failed");
        assert_eq!(json["errorType"], "timeout");
        assert_eq!(json["attempts"], 3);
        assert_eq!(n.agent_error(), err);
    }
}
