//! Run settings and coordination configuration.
//!
//! The invocation `settings` bag is opaque to the core except for the retry
//! and timeout numbers declared in [`RunSettings`]; everything else rides
//! along in [`RunSettings::extra`] untouched.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::{Backoff, BackoffCurve};

/// Hard execution ceiling of the hosting function runtime. Agent timeouts are
/// clamped below it so the self-retry timer always fires first.
pub const HOST_EXECUTION_CEILING_MS: u64 = 400_000;

/// Margin kept between the agent timeout and the host ceiling.
const CEILING_MARGIN_MS: u64 = 10_000;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Typed view of the fields the core reads from the invocation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSettings {
    /// Per-invocation timeout before a self-retry is scheduled.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Self-retries allowed after the original invocation.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for the self-retry backoff.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Growth of the self-retry delay between attempts.
    #[serde(default = "default_retry_curve")]
    pub retry_curve: BackoffCurve,
    /// Bull/bear rounds in the research debate.
    #[serde(default = "default_debate_rounds")]
    pub max_debate_rounds: u32,
    /// Everything else (model provider, token budgets, ...), passed through.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_timeout_ms() -> u64 {
    180_000
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    3_000
}

fn default_retry_curve() -> BackoffCurve {
    BackoffCurve::Linear
}

fn default_debate_rounds() -> u32 {
    2
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_curve: default_retry_curve(),
            max_debate_rounds: default_debate_rounds(),
            extra: serde_json::Map::new(),
        }
    }
}

impl RunSettings {
    /// Validate and clamp the timeout below the host ceiling.
    pub fn validated(mut self) -> Result<Self, ConfigError> {
        if self.timeout_ms == 0 {
            return Err(ConfigError::invalid("timeoutMs", "must be positive"));
        }
        if self.max_debate_rounds == 0 {
            return Err(ConfigError::invalid("maxDebateRounds", "must be at least 1"));
        }
        let ceiling = HOST_EXECUTION_CEILING_MS - CEILING_MARGIN_MS;
        if self.timeout_ms > ceiling {
            tracing::warn!(
                requested = self.timeout_ms,
                ceiling,
                "agent timeout exceeds host ceiling, clamping"
            );
            self.timeout_ms = ceiling;
        }
        Ok(self)
    }

    /// Parse from the opaque JSON settings bag.
    pub fn from_value(value: serde_json::Value) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_value(value)
            .map_err(|e| ConfigError::invalid("settings", e.to_string()))?;
        settings.validated()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Backoff used between self-retries (`retry_delay × attempt` by default).
    pub fn retry_backoff(&self) -> Backoff {
        Backoff {
            curve: self.retry_curve,
            base_ms: self.retry_delay_ms,
            max_ms: None,
        }
    }

    /// Look up a pass-through setting.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(|v| v.as_str())
    }
}

/// CAS retry policy for the optimistic update path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CasPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for CasPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            backoff: Backoff::exponential(100),
        }
    }
}

/// Coordinator notification delivery policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for NotifyPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::exponential(250),
        }
    }
}

/// Top-level coordination configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    /// Optimistic-concurrency retry policy.
    pub cas: CasPolicy,
    /// Coordinator notification delivery policy.
    pub notify: NotifyPolicy,
    /// Extra time the watchdog waits beyond the agent timeout.
    pub watchdog_grace_ms: u64,
    /// Wall-clock bucket used for message deduplication.
    pub message_dedup_window_secs: u64,
    /// How many times the coordinator re-dispatches an agent whose
    /// self-retry dispatch failed before treating it as an agent failure.
    pub redispatch_budget: u32,
    /// Settings applied when a run does not supply its own.
    pub default_settings: RunSettings,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        let mut settings = RunSettings::default();
        if let Some(v) = env_parse("COORD_MAX_RETRIES") {
            settings.max_retries = v;
        }
        if let Some(v) = env_parse("COORD_TIMEOUT_MS") {
            settings.timeout_ms = v;
        }
        if let Some(v) = env_parse("COORD_RETRY_DELAY_MS") {
            settings.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("COORD_DEBATE_ROUNDS") {
            settings.max_debate_rounds = v;
        }
        Self {
            cas: CasPolicy::default(),
            notify: NotifyPolicy::default(),
            watchdog_grace_ms: 30_000,
            message_dedup_window_secs: 60,
            redispatch_budget: 1,
            default_settings: settings,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

impl CoordinationConfig {
    /// Parse a TOML document. Missing sections fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(raw)?;
        config.default_settings = config.default_settings.validated()?;
        if config.cas.max_attempts == 0 {
            return Err(ConfigError::invalid("cas.max_attempts", "must be at least 1"));
        }
        if config.notify.max_attempts == 0 {
            return Err(ConfigError::invalid(
                "notify.max_attempts",
                "must be at least 1",
            ));
        }
        Ok(config)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&raw)
            .with_context(|| format!("invalid coordination config {}", path.display()))
    }

    pub fn watchdog_grace(&self) -> Duration {
        Duration::from_millis(self.watchdog_grace_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.message_dedup_window_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_settings_extra_passthrough() {
        let value = serde_json::json!({
            "timeoutMs": 5000,
            "maxRetries": 2,
            "aiProvider": "openai",
            "analysisMaxTokens": 1200
        });
        let settings = RunSettings::from_value(value).unwrap();
        assert_eq!(settings.timeout_ms, 5000);
        assert_eq!(settings.max_retries, 2);
        assert_eq!(settings.retry_delay_ms, 3000);
        assert_eq!(settings.extra_str("aiProvider"), Some("openai"));
        assert_eq!(settings.extra["analysisMaxTokens"], 1200);
    }

    #[test]
    fn test_timeout_clamped_below_ceiling() {
        let settings = RunSettings {
            timeout_ms: 10_000_000,
            ..RunSettings::default()
        }
        .validated()
        .unwrap();
        assert!(settings.timeout_ms < HOST_EXECUTION_CEILING_MS);
    }

    #[test]
    fn test_zero_rounds_rejected() {
        let err = RunSettings {
            max_debate_rounds: 0,
            ..RunSettings::default()
        }
        .validated()
        .unwrap_err();
        assert!(err.to_string().contains("maxDebateRounds"));
    }

    #[test]
    fn test_retry_backoff_is_linear() {
        let settings = RunSettings {
            retry_delay_ms: 200,
            ..RunSettings::default()
        };
        assert_eq!(settings.retry_backoff().delay(3), Duration::from_millis(600));
    }

    #[test]
    fn test_retry_curve_from_toml() {
        let raw = r#"
            [default_settings]
            retryDelayMs = 100
            retryCurve = "exponential"
        "#;
        let config = CoordinationConfig::from_toml_str(raw).unwrap();
        let settings = &config.default_settings;
        assert_eq!(settings.retry_curve, BackoffCurve::Exponential);
        assert_eq!(settings.retry_backoff(), Backoff::exponential(100));
        assert_eq!(settings.retry_backoff().delay(3), Duration::from_millis(400));
        assert!(!settings.extra.contains_key("retryCurve"));
    }

    #[test]
    fn test_config_from_toml() {
        let raw = r#"
            watchdog_grace_ms = 5000
            redispatch_budget = 2

            [cas]
            max_attempts = 8
            backoff = { curve = "linear", base_ms = 50 }

            [default_settings]
            timeoutMs = 60000
            maxDebateRounds = 3
        "#;
        let config = CoordinationConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.cas.max_attempts, 8);
        assert_eq!(config.cas.backoff, Backoff::linear(50));
        assert_eq!(config.watchdog_grace_ms, 5000);
        assert_eq!(config.redispatch_budget, 2);
        assert_eq!(config.default_settings.timeout_ms, 60_000);
        assert_eq!(config.default_settings.max_debate_rounds, 3);
        assert_eq!(config.message_dedup_window_secs, 60);
    }

    #[test]
    fn test_config_rejects_zero_cas_attempts() {
        let raw = r#"
            [cas]
            max_attempts = 0
            backoff = { curve = "exponential", base_ms = 100 }
        "#;
        assert!(CoordinationConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_config_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "message_dedup_window_secs = 15").unwrap();
        let config = CoordinationConfig::load(file.path()).unwrap();
        assert_eq!(config.message_dedup_window_secs, 15);
    }

    #[test]
    fn test_config_load_missing_file() {
        let err = CoordinationConfig::load("/nonexistent/coordination.toml").unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }
}
