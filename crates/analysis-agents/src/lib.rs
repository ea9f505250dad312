//! Analysis agent workers.
//!
//! Concrete [`coordination::AgentWorker`]s for the standard phase table. Each
//! role sends a role-specific system prompt plus the run's upstream findings
//! to an OpenAI-compatible chat endpoint.

pub mod config;
pub mod llm;
pub mod prompts;
pub mod roles;

pub use config::{check_endpoint, AgentsConfig};
pub use llm::{ChatModel, ClientBuildError, OpenAiChat, SharedChatModel};
pub use roles::{parse_decision, parse_points, workers_for, RoleWorker};
