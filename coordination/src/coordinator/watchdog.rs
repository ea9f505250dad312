//! Stuck-worker watchdog.
//!
//! Wraps a dispatcher: every dispatch snapshots the run's version token, and
//! a detached timer checks after `timeout + grace` whether the token moved.
//! If it did not, the watchdog logs and publishes a warning. It never fails
//! the run; the per-agent retry timer is the primary safety net.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{PipelineEvent, SharedEventBus};
use crate::invocation::{DispatchError, Dispatcher, InvocationRequest, SharedDispatcher};
use crate::state::{RunStatus, SharedRunStore, VersionToken};

/// Dispatcher decorator that arms a watchdog per invocation.
pub struct WatchedDispatcher {
    inner: SharedDispatcher,
    store: SharedRunStore,
    events: SharedEventBus,
    grace: Duration,
    shutdown: CancellationToken,
}

impl WatchedDispatcher {
    pub fn new(
        inner: SharedDispatcher,
        store: SharedRunStore,
        events: SharedEventBus,
        grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner,
            store,
            events,
            grace,
            shutdown,
        }
    }
}

#[async_trait]
impl Dispatcher for WatchedDispatcher {
    async fn dispatch(&self, agent: &str, request: InvocationRequest) -> Result<(), DispatchError> {
        let baseline = match self.store.read_run(&request.run_id).await {
            Ok(run) => Some(run.version),
            Err(e) => {
                debug!(run_id = %request.run_id, agent, error = %e, "No watchdog baseline");
                None
            }
        };
        let window = request.settings.timeout() + self.grace;
        let run_id = request.run_id.clone();

        self.inner.dispatch(agent, request).await?;

        if let Some(baseline) = baseline {
            tokio::spawn(watch(
                self.store.clone(),
                self.events.clone(),
                self.shutdown.clone(),
                run_id,
                agent.to_string(),
                baseline,
                window,
            ));
        }
        Ok(())
    }
}

async fn watch(
    store: SharedRunStore,
    events: SharedEventBus,
    shutdown: CancellationToken,
    run_id: String,
    agent: String,
    baseline: VersionToken,
    window: Duration,
) {
    tokio::select! {
        _ = shutdown.cancelled() => return,
        _ = tokio::time::sleep(window) => {}
    }

    let run = match store.read_run(&run_id).await {
        Ok(run) => run,
        Err(e) => {
            debug!(run_id = %run_id, agent = %agent, error = %e, "Watchdog read failed");
            return;
        }
    };
    if run.version != baseline || run.payload.run_status != RunStatus::Running {
        return;
    }

    let waited_ms = window.as_millis() as u64;
    warn!(
        run_id = %run_id,
        agent = %agent,
        version = %baseline,
        waited_ms,
        "No progress since dispatch, worker may be stuck"
    );
    events.publish(PipelineEvent::StuckWorker {
        run_id,
        agent,
        waited_ms,
        timestamp: Utc::now(),
    });
}
