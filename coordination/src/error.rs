//! Error taxonomy for agent failures and the coordination layer.
//!
//! Every escalation that reaches the coordinator carries an [`ErrorType`].
//! The taxonomy decides the propagation policy:
//!
//! | Type         | Transient | Policy                                  |
//! |--------------|-----------|-----------------------------------------|
//! | `rate_limit` | yes       | retried locally, then escalated         |
//! | `timeout`    | yes       | retried locally, then escalated         |
//! | `database`   | yes       | retried locally, then escalated         |
//! | `api_key`    | no        | escalated immediately, no retry budget  |
//! | `ai_error`   | no        | escalated immediately                   |
//! | `data_fetch` | no        | escalated immediately                   |
//! | `other`      | no        | escalated immediately                   |

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::invocation::DispatchError;
use crate::notify::NotifyError;
use crate::phases::SequencerError;
use crate::settings::ConfigError;
use crate::state::StoreError;
use crate::update::UpdateError;

/// Classification attached to every agent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Provider throttled the request (HTTP 429 and friends).
    RateLimit,
    /// Credentials missing or rejected. Retrying cannot help.
    ApiKey,
    /// Upstream market/news data source failed.
    DataFetch,
    /// Model returned empty or malformed output.
    AiError,
    /// State store unavailable.
    Database,
    /// Agent exceeded its execution window.
    Timeout,
    /// Anything else.
    Other,
}

impl ErrorType {
    /// Transient classes are retried locally before escalation.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimit | Self::Timeout | Self::Database)
    }

    /// Best-effort mapping of a free-text provider error onto the taxonomy.
    pub fn classify(message: &str) -> Self {
        let patterns = classifier_patterns();
        patterns
            .iter()
            .find(|(re, _)| re.is_match(message))
            .map(|(_, ty)| *ty)
            .unwrap_or(Self::Other)
    }

    /// All variants, in taxonomy order.
    pub fn all() -> &'static [ErrorType] {
        &[
            Self::RateLimit,
            Self::ApiKey,
            Self::DataFetch,
            Self::AiError,
            Self::Database,
            Self::Timeout,
            Self::Other,
        ]
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RateLimit => write!(f, "rate_limit"),
            Self::ApiKey => write!(f, "api_key"),
            Self::DataFetch => write!(f, "data_fetch"),
            Self::AiError => write!(f, "ai_error"),
            Self::Database => write!(f, "database"),
            Self::Timeout => write!(f, "timeout"),
            Self::Other => write!(f, "other"),
        }
    }
}

// Order matters: the first matching pattern wins.
fn classifier_patterns() -> &'static [(Regex, ErrorType)] {
    static PATTERNS: OnceLock<Vec<(Regex, ErrorType)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let table: [(&str, ErrorType); 6] = [
            (
                r"(?i)\b429\b|rate[ _-]?limit|too many requests|quota exceeded",
                ErrorType::RateLimit,
            ),
            (
                r"(?i)\b40[13]\b|api[ _-]?key|unauthori[sz]ed|invalid (auth|credential)|forbidden",
                ErrorType::ApiKey,
            ),
            (
                r"(?i)timed? ?out|deadline exceeded|\b504\b",
                ErrorType::Timeout,
            ),
            (
                r"(?i)database|postgres|connection (refused|reset)|pool (exhausted|timeout)|store unavailable",
                ErrorType::Database,
            ),
            (
                r"(?i)market data|news (api|feed)|fetch(ing)? (data|quotes|prices)|data source|upstream data",
                ErrorType::DataFetch,
            ),
            (
                r"(?i)empty (response|completion|content)|malformed|invalid json|failed to parse|no choices",
                ErrorType::AiError,
            ),
        ];
        table
            .into_iter()
            .filter_map(|(pattern, ty)| Regex::new(pattern).ok().map(|re| (re, ty)))
            .collect()
    })
}

/// A failure reported by an agent's external computation.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{error_type}: {message}")]
pub struct AgentError {
    pub error_type: ErrorType,
    pub message: String,
}

impl AgentError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        Self {
            error_type,
            message: message.into(),
        }
    }

    /// Build an error whose type is inferred from the message text.
    pub fn classified(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            error_type: ErrorType::classify(&message),
            message,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Timeout, message)
    }

    pub fn is_transient(&self) -> bool {
        self.error_type.is_transient()
    }
}

/// Top-level error for coordination operations.
#[derive(Debug, Error)]
pub enum CoordinationError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("update error: {0}")]
    Update(#[from] UpdateError),

    #[error("sequencer error: {0}")]
    Sequencer(#[from] SequencerError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("run {run_id} is {status} and cannot be {action}")]
    InvalidRunState {
        run_id: String,
        status: String,
        action: String,
    },

    #[error("run {run_id} did not finish within {waited_ms}ms")]
    WaitTimedOut { run_id: String, waited_ms: u64 },
}

impl CoordinationError {
    /// Taxonomy bucket used when this error escalates to the coordinator.
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::Store(_) => ErrorType::Database,
            Self::Update(UpdateError::Store(_)) => ErrorType::Database,
            Self::Update(UpdateError::ContentionExhausted { .. }) => ErrorType::Database,
            _ => ErrorType::Other,
        }
    }
}

/// Result alias for coordination operations.
pub type CoordinationResult<T> = Result<T, CoordinationError>;
