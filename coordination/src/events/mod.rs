//! Pipeline event stream.
//!
//! ```text
//! ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//! │ Coordinator  │────▶│  Event Bus   │────▶│  Subscribers │
//! │ Agent runtime│     │  (broadcast) │     │  (RunEvents) │
//! └──────────────┘     └──────────────┘     └──────────────┘
//! ```

pub mod bus;
pub mod types;

pub use bus::{EventBus, RunEvents, SharedEventBus};
pub use types::PipelineEvent;
