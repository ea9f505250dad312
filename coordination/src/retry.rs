//! Retry/timeout subsystem.
//!
//! # Timer Lifecycle
//!
//! ```text
//! invoke ──▶ arm(timeout) ──▶ worker returns ──▶ disarm
//!                 │
//!                 └── fires first ──▶ attempt < maxRetries ?
//!                                       │ yes: sleep(delay × (attempt+1)), dispatch attempt+1
//!                                       │      dispatch failed → step running→pending,
//!                                       │                        notify InvocationFailed
//!                                       └ no:  notify AgentFailed (run status untouched)
//! ```
//!
//! Everything after the timer fires runs on detached tasks; nothing here can
//! fail the invocation that armed the timer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AgentError;
use crate::events::{PipelineEvent, SharedEventBus};
use crate::invocation::{InvocationRequest, SharedDispatcher};
use crate::notify::{notify_detached, notify_with_retry, Notification, SharedNotifier};
use crate::phases::PhaseId;
use crate::settings::{NotifyPolicy, RunSettings};
use crate::state::StepUpdate;
use crate::update::SharedUpdater;

/// Retry bookkeeping carried in the invocation payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEnvelope {
    pub attempt: u32,
    pub max_retries: u32,
    pub timeout_ms: u64,
    pub original_start_time: DateTime<Utc>,
    pub function_name: String,
}

impl RetryEnvelope {
    /// Envelope for an original invocation (`attempt = 0`).
    pub fn first(function_name: impl Into<String>, settings: &RunSettings) -> Self {
        Self {
            attempt: 0,
            max_retries: settings.max_retries,
            timeout_ms: settings.timeout_ms,
            original_start_time: Utc::now(),
            function_name: function_name.into(),
        }
    }

    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }

    /// No self-retries left.
    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_retries
    }

    /// Invocations made so far, counting this one.
    pub fn total_attempts(&self) -> u32 {
        self.attempt + 1
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Wall-clock time since the original invocation.
    pub fn elapsed(&self) -> Duration {
        (Utc::now() - self.original_start_time)
            .to_std()
            .unwrap_or_default()
    }
}

/// Armed timeout. Dropping or disarming it cancels the timer.
///
/// Exactly one of the timer and the invocation claims the outcome: whoever
/// flips `claimed` first owns retry and escalation.
#[derive(Debug)]
pub struct TimeoutGuard {
    token: CancellationToken,
    claimed: Arc<AtomicBool>,
}

impl TimeoutGuard {
    /// Cancel the timer. Returns true if it had already fired, in which case
    /// the timer owns retry and escalation for this attempt.
    pub fn disarm(self) -> bool {
        let fired = self.claimed.swap(true, Ordering::AcqRel);
        self.token.cancel();
        fired
    }
}

impl Drop for TimeoutGuard {
    fn drop(&mut self) {
        self.claimed.store(true, Ordering::Release);
        self.token.cancel();
    }
}

/// Shared reference to the retry scheduler
pub type SharedRetryScheduler = Arc<RetryScheduler>;

/// Schedules self-retries and final-failure escalations.
pub struct RetryScheduler {
    updater: SharedUpdater,
    dispatcher: SharedDispatcher,
    notifier: SharedNotifier,
    events: SharedEventBus,
    notify_policy: NotifyPolicy,
}

impl RetryScheduler {
    pub fn new(
        updater: SharedUpdater,
        dispatcher: SharedDispatcher,
        notifier: SharedNotifier,
        events: SharedEventBus,
        notify_policy: NotifyPolicy,
    ) -> Self {
        Self {
            updater,
            dispatcher,
            notifier,
            events,
            notify_policy,
        }
    }

    pub fn shared(self) -> SharedRetryScheduler {
        Arc::new(self)
    }

    /// Arm the invocation timer.
    pub fn arm(
        self: &Arc<Self>,
        agent: &str,
        phase: PhaseId,
        request: &InvocationRequest,
        envelope: &RetryEnvelope,
    ) -> TimeoutGuard {
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let claimed = Arc::new(AtomicBool::new(false));
        let timer_claim = Arc::clone(&claimed);
        let this = Arc::clone(self);
        let agent = agent.to_string();
        let request = request.clone();
        let envelope = envelope.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(envelope.timeout()) => {
                    if timer_claim.swap(true, Ordering::AcqRel) {
                        return;
                    }
                    warn!(
                        run_id = %request.run_id,
                        agent = %agent,
                        attempt = envelope.attempt,
                        timeout_ms = envelope.timeout_ms,
                        "Agent timed out"
                    );
                    let err = AgentError::timeout(format!(
                        "{agent} did not finish within {}ms",
                        envelope.timeout_ms
                    ));
                    this.retry_or_escalate(&agent, phase, &request, &envelope, &err);
                }
            }
        });

        TimeoutGuard { token, claimed }
    }

    /// Schedule a self-retry for transient errors with budget left, otherwise
    /// escalate. Returns whether a retry was scheduled.
    pub fn retry_or_escalate(
        self: &Arc<Self>,
        agent: &str,
        phase: PhaseId,
        request: &InvocationRequest,
        envelope: &RetryEnvelope,
        err: &AgentError,
    ) -> bool {
        if err.is_transient() && !envelope.exhausted() {
            self.schedule_retry(agent, phase, request, envelope, err);
            true
        } else {
            self.escalate(agent, phase, request, envelope, err);
            false
        }
    }

    fn schedule_retry(
        self: &Arc<Self>,
        agent: &str,
        phase: PhaseId,
        request: &InvocationRequest,
        envelope: &RetryEnvelope,
        err: &AgentError,
    ) {
        let next = envelope.next_attempt();
        let delay = request.settings.retry_backoff().delay(next.attempt);
        info!(
            run_id = %request.run_id,
            agent,
            attempt = next.attempt,
            max_retries = next.max_retries,
            delay_ms = delay.as_millis() as u64,
            error_type = %err.error_type,
            "Scheduling self-retry"
        );
        self.events.publish(PipelineEvent::RetryScheduled {
            run_id: request.run_id.clone(),
            agent: agent.to_string(),
            attempt: next.attempt,
            error_type: err.error_type,
            timestamp: Utc::now(),
        });

        let this = Arc::clone(self);
        let agent = agent.to_string();
        let retry_request = request.clone().with_envelope(next);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.dispatch_retry(&agent, phase, retry_request).await;
        });
    }

    async fn dispatch_retry(&self, agent: &str, phase: PhaseId, request: InvocationRequest) {
        let Err(dispatch_err) = self.dispatcher.dispatch(agent, request.clone()).await else {
            return;
        };
        warn!(
            run_id = %request.run_id,
            agent,
            attempt = request.attempt(),
            error = %dispatch_err,
            "Self-retry dispatch failed"
        );

        // The retry never started: make the step read as not in progress.
        if let Err(e) = self
            .updater
            .set_step_status(&request.run_id, phase, agent, &StepUpdate::reset_dispatch())
            .await
        {
            error!(
                run_id = %request.run_id,
                agent,
                error = %e,
                "Failed to reset step after dispatch failure"
            );
        }

        let notification =
            Notification::invocation_failed(phase, agent, dispatch_err.to_string(), request);
        if let Err(e) =
            notify_with_retry(self.notifier.as_ref(), &notification, self.notify_policy).await
        {
            error!(
                run_id = %notification.run_id,
                agent,
                error = %e,
                "Could not report dispatch failure"
            );
        }
    }

    /// Report a final failure. The coordinator decides what happens to the run.
    pub fn escalate(
        &self,
        agent: &str,
        phase: PhaseId,
        request: &InvocationRequest,
        envelope: &RetryEnvelope,
        err: &AgentError,
    ) {
        let attempts = envelope.total_attempts();
        let summary = AgentError::new(
            err.error_type,
            format!(
                "{agent} failed after {attempts} attempt(s) over {:.1}s: {}",
                envelope.elapsed().as_secs_f64(),
                err.message
            ),
        );
        warn!(
            run_id = %request.run_id,
            agent,
            attempts,
            error_type = %err.error_type,
            "Escalating agent failure to coordinator"
        );
        notify_detached(
            Arc::clone(&self.notifier),
            Notification::agent_failed(request.run_id.clone(), phase, agent, &summary, attempts),
            self.notify_policy,
        );
    }
}
