//! Coordination layer for the multi-agent investment analysis pipeline.
//!
//! This library provides:
//! - Versioned run state with optimistic-concurrency and atomic-procedure writes
//! - Phase sequencing and the bull/bear debate loop
//! - The shared agent runtime: guard, self-retrying timeout, handoff
//! - The coordinator that advances phases and escalates failures
//!
//! # Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use coordination::{CoordinationConfig, InMemoryStore, Pipeline};
//!
//! # async fn demo(workers: Vec<coordination::SharedWorker>) -> coordination::CoordinationResult<()> {
//! let pipeline = Pipeline::builder(InMemoryStore::new().shared(), CoordinationConfig::default())
//!     .workers(workers)
//!     .build();
//! let run_id = pipeline.submit("AAPL", "user-1", None).await?;
//! let run = pipeline.wait_for_terminal(&run_id, Duration::from_secs(600)).await?;
//! println!("{:?}", run.payload.decision);
//! pipeline.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod coordinator;
pub mod debate;
pub mod error;
pub mod events;
pub mod guard;
pub mod invocation;
pub mod notify;
pub mod phases;
pub mod pipeline;
pub mod retry;
pub mod runtime;
pub mod settings;
pub mod state;
pub mod update;

pub use backoff::{Backoff, BackoffCurve};
pub use coordinator::{Coordinator, CoordinatorDecision, SharedCoordinator, WatchedDispatcher};
pub use debate::{DebateController, DebateStep};
pub use error::{AgentError, CoordinationError, CoordinationResult, ErrorType};
pub use events::{EventBus, PipelineEvent, RunEvents, SharedEventBus};
pub use guard::{GuardDecision, GuardTarget};
pub use invocation::{
    DispatchError, Dispatcher, InvocationRequest, InvocationResponse, PhaseContext,
    QueueDispatcher, SharedDispatcher, WorkItem,
};
pub use notify::{
    CompletionType, CoordinatorNotifier, Notification, NotifyError, QueueNotifier, SharedNotifier,
};
pub use phases::{agents, AgentSpec, Handoff, PhaseId, PhaseSequencer, PhaseSpec, SequencerError};
pub use pipeline::{Pipeline, PipelineBuilder};
pub use retry::{RetryEnvelope, RetryScheduler, SharedRetryScheduler, TimeoutGuard};
pub use runtime::{
    AgentContext, AgentOutput, AgentRuntime, AgentWorker, FinalDecision, SharedAgentRuntime,
    SharedWorker, WorkerPool,
};
pub use settings::{CasPolicy, ConfigError, CoordinationConfig, NotifyPolicy, RunSettings};
pub use state::{
    InMemoryStore, Message, MessageType, RunId, RunPayload, RunStatus, RunStore, SharedRunStore,
    StepStatus, StoreError, VersionToken, WorkflowRun,
};
#[cfg(feature = "postgres")]
pub use state::PostgresStore;
pub use update::{AtomicUpdater, Mutation, SharedUpdater, UpdateError};
