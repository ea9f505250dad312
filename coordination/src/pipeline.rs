//! In-process pipeline: store, coordinator loop and worker pool wired together.
//!
//! ```text
//!  create_run ─▶ RunStore ◀──────────────┐
//!  start_run  ─▶ Coordinator ─▶ WatchedDispatcher ─▶ work queue ─▶ WorkerPool
//!                   ▲                                                 │
//!                   └──────────── notification queue ◀───────────────┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::coordinator::{Coordinator, SharedCoordinator, WatchedDispatcher};
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{EventBus, RunEvents, SharedEventBus};
use crate::invocation::QueueDispatcher;
use crate::notify::QueueNotifier;
use crate::phases::PhaseSequencer;
use crate::runtime::{AgentRuntime, SharedWorker, WorkerPool};
use crate::settings::{CoordinationConfig, RunSettings};
use crate::state::{RunId, RunPayload, RunStatus, SharedRunStore, WorkflowRun};
use crate::update::{AtomicUpdater, SharedUpdater};

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    store: SharedRunStore,
    config: CoordinationConfig,
    sequencer: Option<PhaseSequencer>,
    workers: Vec<SharedWorker>,
    event_capacity: usize,
}

impl PipelineBuilder {
    pub fn sequencer(mut self, sequencer: PhaseSequencer) -> Self {
        self.sequencer = Some(sequencer);
        self
    }

    pub fn worker(mut self, worker: SharedWorker) -> Self {
        self.workers.push(worker);
        self
    }

    pub fn workers(mut self, workers: impl IntoIterator<Item = SharedWorker>) -> Self {
        self.workers.extend(workers);
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Wire everything and spawn the coordinator and worker loops.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Pipeline {
        let sequencer = Arc::new(self.sequencer.unwrap_or_else(PhaseSequencer::standard));
        let events = EventBus::with_capacity(self.event_capacity).shared();
        let shutdown = CancellationToken::new();

        let updater = AtomicUpdater::new(Arc::clone(&self.store), self.config.cas)
            .with_dedup_window(self.config.message_dedup_window_secs)
            .shared();

        let known = self.workers.iter().map(|w| w.name().to_string());
        let (queue, work_rx) = QueueDispatcher::new(known);
        let dispatcher = Arc::new(WatchedDispatcher::new(
            Arc::new(queue),
            Arc::clone(&self.store),
            Arc::clone(&events),
            self.config.watchdog_grace(),
            shutdown.clone(),
        ));
        let (notifier, notify_rx) = QueueNotifier::new();

        let runtime = AgentRuntime::new(
            Arc::clone(&updater),
            Arc::clone(&sequencer),
            dispatcher.clone(),
            Arc::new(notifier),
            Arc::clone(&events),
            self.config.notify,
        )
        .shared();
        let pool = WorkerPool::new(runtime, self.workers);
        let agents: Vec<String> = pool.agents().map(str::to_string).collect();

        let coordinator = Coordinator::new(
            Arc::clone(&updater),
            Arc::clone(&sequencer),
            dispatcher,
            Arc::clone(&events),
            &self.config,
        )
        .shared();

        let tasks = vec![
            Arc::clone(&coordinator).spawn(notify_rx, shutdown.clone()),
            pool.spawn(work_rx, shutdown.clone()),
        ];
        info!(agents = agents.len(), "Pipeline started");
        debug!(?agents, "Registered workers");

        Pipeline {
            updater,
            coordinator,
            sequencer,
            events,
            config: self.config,
            shutdown,
            tasks,
        }
    }
}

/// A running pipeline.
pub struct Pipeline {
    updater: SharedUpdater,
    coordinator: SharedCoordinator,
    sequencer: Arc<PhaseSequencer>,
    events: SharedEventBus,
    config: CoordinationConfig,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    pub fn builder(store: SharedRunStore, config: CoordinationConfig) -> PipelineBuilder {
        PipelineBuilder {
            store,
            config,
            sequencer: None,
            workers: Vec::new(),
            event_capacity: 1024,
        }
    }

    /// Persist a new pending run. `None` settings use the configured defaults.
    pub async fn create_run(
        &self,
        subject: &str,
        owner: &str,
        settings: Option<RunSettings>,
    ) -> CoordinationResult<RunId> {
        let settings = match settings {
            Some(s) => s.validated()?,
            None => self.config.default_settings.clone(),
        };
        let run_id = Uuid::new_v4().to_string();
        let payload = RunPayload::new(subject, owner, settings, self.sequencer.initial_steps());
        self.updater.insert(&run_id, &payload).await?;
        info!(run_id = %run_id, subject, owner, "Run created");
        Ok(run_id)
    }

    pub async fn start_run(&self, run_id: &str) -> CoordinationResult<()> {
        self.coordinator.start_run(run_id).await.map(|_| ())
    }

    /// Create and start in one step.
    pub async fn submit(
        &self,
        subject: &str,
        owner: &str,
        settings: Option<RunSettings>,
    ) -> CoordinationResult<RunId> {
        let run_id = self.create_run(subject, owner, settings).await?;
        self.start_run(&run_id).await?;
        Ok(run_id)
    }

    pub async fn cancel_run(&self, run_id: &str) -> CoordinationResult<RunStatus> {
        self.coordinator.cancel_run(run_id).await
    }

    /// End the debate after the round in progress.
    pub async fn settle_debate(&self, run_id: &str) -> CoordinationResult<()> {
        Ok(self.updater.settle_debate(run_id).await?)
    }

    pub async fn snapshot(&self, run_id: &str) -> CoordinationResult<WorkflowRun> {
        Ok(self.updater.snapshot(run_id).await?)
    }

    pub fn events(&self) -> SharedEventBus {
        Arc::clone(&self.events)
    }

    pub fn subscribe_run(&self, run_id: &str) -> RunEvents {
        RunEvents::new(self.events.subscribe(), run_id)
    }

    /// Wait until the run is completed, cancelled or failed.
    pub async fn wait_for_terminal(
        &self,
        run_id: &str,
        timeout: Duration,
    ) -> CoordinationResult<WorkflowRun> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut events = self.subscribe_run(run_id);
        loop {
            let run = self.snapshot(run_id).await?;
            if matches!(
                run.payload.run_status,
                RunStatus::Completed | RunStatus::Cancelled | RunStatus::Error
            ) {
                return Ok(run);
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) | Err(_) => {
                    return Err(CoordinationError::WaitTimedOut {
                        run_id: run_id.to_string(),
                        waited_ms: timeout.as_millis() as u64,
                    })
                }
            }
        }
    }

    /// Stop the coordinator and worker loops. In-flight invocations finish
    /// on their own tasks.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for result in join_all(self.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
        info!("Pipeline stopped");
    }
}
