//! Run state persistence.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   read / conditional write   ┌──────────────────┐
//! │ AtomicUpdater │─────────────────────────────▶│  RunStore trait  │
//! │ (update.rs)   │   step + debate procedures   │                  │
//! └───────────────┘─────────────────────────────▶└────────┬─────────┘
//!                                                         │
//!                                       ┌─────────────────┴─────────────┐
//!                                       ▼                               ▼
//!                               InMemoryStore                  PostgresStore
//!                               (tests, single node)           (feature "postgres")
//! ```
//!
//! Every successful write, including a message append, advances the run's
//! [`VersionToken`].

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod schema;
pub mod store;
pub mod types;

pub use memory::{InMemoryStore, SharedInMemoryStore, StoreFaults};
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;
pub use store::{RunStore, SharedRunStore, StepMerge, StoreError, StoreResult};
pub use types::{
    AgentStepState, AppendOutcome, DebateMerge, DebateRound, DebateSide, Message, MessageType,
    PhaseState, RunError, RunId, RunPayload, RunStatus, StepChange, StepFailure, StepStatus,
    StepUpdate, VersionToken, VersionedRun, WorkflowRun,
};
