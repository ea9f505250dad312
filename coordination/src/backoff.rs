//! Backoff curves shared by the CAS retry loop, the agent self-retry loop and
//! coordinator notification delivery.
//!
//! Both the curve and its base are configuration, not constants: the CAS loop
//! defaults to exponential (100ms base), agent self-retries default to linear
//! (`retry_delay × attempt`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Shape of the delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffCurve {
    /// `base × attempt`
    Linear,
    /// `base × 2^(attempt - 1)`
    Exponential,
}

/// A backoff schedule. Attempts are 1-indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    pub curve: BackoffCurve,
    /// Base delay in milliseconds.
    pub base_ms: u64,
    /// Upper bound on any single delay, in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_ms: Option<u64>,
}

impl Backoff {
    pub fn linear(base_ms: u64) -> Self {
        Self {
            curve: BackoffCurve::Linear,
            base_ms,
            max_ms: None,
        }
    }

    pub fn exponential(base_ms: u64) -> Self {
        Self {
            curve: BackoffCurve::Exponential,
            base_ms,
            max_ms: None,
        }
    }

    pub fn with_max(mut self, max_ms: u64) -> Self {
        self.max_ms = Some(max_ms);
        self
    }

    /// Delay to wait before `attempt`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        let ms = match self.curve {
            BackoffCurve::Linear => self.base_ms.saturating_mul(u64::from(attempt)),
            BackoffCurve::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.base_ms.saturating_mul(factor)
            }
        };
        let ms = match self.max_ms {
            Some(cap) => ms.min(cap),
            None => ms,
        };
        Duration::from_millis(ms)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::exponential(100)
    }
}
