//! Shared fixtures for the coordination integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coordination::agents::*;
use coordination::{AgentContext, AgentError, AgentOutput, AgentWorker, ErrorType, SharedWorker};
use tokio::sync::Notify;

/// Invocation order across all workers: `agent` or `agent@round`.
#[derive(Clone, Default)]
pub struct InvocationLog(Arc<Mutex<Vec<String>>>);

impl InvocationLog {
    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, agent: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.split('@').next() == Some(agent))
            .count()
    }

    fn push(&self, ctx: &AgentContext, agent: &str) {
        let entry = match ctx.round {
            Some(round) => format!("{agent}@{round}"),
            None => agent.to_string(),
        };
        self.0.lock().unwrap().push(entry);
    }
}

/// Lets a test hold a worker inside its external call.
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

pub enum Behavior {
    Succeed,
    Decide(&'static str, f64),
    Fail(ErrorType),
    /// Fail with the given type for the first `n` calls, then succeed.
    FailTimes(u32, ErrorType),
    Hang,
    Gated(Arc<Gate>),
    /// Sleep, then fail with the given type.
    FailAfter(Duration, ErrorType),
}

pub struct ScriptedWorker {
    name: String,
    behavior: Behavior,
    calls: AtomicU32,
    log: InvocationLog,
}

impl ScriptedWorker {
    pub fn new(name: &str, behavior: Behavior, log: &InvocationLog) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            calls: AtomicU32::new(0),
            log: log.clone(),
        })
    }

    fn output(&self, ctx: &AgentContext) -> AgentOutput {
        AgentOutput::new(format!("{} on {}", self.name, ctx.subject))
            .with_points(vec![format!("point from {}", self.name)])
    }
}

#[async_trait]
impl AgentWorker for ScriptedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.push(ctx, &self.name);
        match &self.behavior {
            Behavior::Succeed => Ok(self.output(ctx)),
            Behavior::Decide(decision, confidence) => {
                Ok(self.output(ctx).with_decision(*decision, Some(*confidence)))
            }
            Behavior::Fail(error_type) => Err(AgentError::new(*error_type, "scripted failure")),
            Behavior::FailTimes(n, error_type) if call < *n => {
                Err(AgentError::new(*error_type, "scripted failure"))
            }
            Behavior::FailTimes(..) => Ok(self.output(ctx)),
            Behavior::Hang => std::future::pending().await,
            Behavior::FailAfter(delay, error_type) => {
                tokio::time::sleep(*delay).await;
                Err(AgentError::new(*error_type, "late scripted failure"))
            }
            Behavior::Gated(gate) => {
                gate.entered.notify_one();
                gate.release.notified().await;
                Ok(self.output(ctx))
            }
        }
    }
}

pub const ALL_AGENTS: [&str; 14] = [
    MACRO_ANALYST,
    MARKET_ANALYST,
    NEWS_ANALYST,
    SOCIAL_MEDIA_ANALYST,
    FUNDAMENTALS_ANALYST,
    BULL_RESEARCHER,
    BEAR_RESEARCHER,
    RESEARCH_MANAGER,
    TRADER,
    RISKY_ANALYST,
    SAFE_ANALYST,
    NEUTRAL_ANALYST,
    RISK_MANAGER,
    PORTFOLIO_MANAGER,
];

/// Workers for the standard pipeline. The portfolio manager decides BUY
/// unless `overrides` says otherwise.
pub fn standard_workers(
    log: &InvocationLog,
    mut overrides: Vec<(&str, Behavior)>,
) -> Vec<SharedWorker> {
    ALL_AGENTS
        .iter()
        .map(|&name| {
            let behavior = match overrides.iter().position(|(n, _)| *n == name) {
                Some(idx) => overrides.remove(idx).1,
                None if name == PORTFOLIO_MANAGER => Behavior::Decide("BUY", 0.8),
                None => Behavior::Succeed,
            };
            ScriptedWorker::new(name, behavior, log) as SharedWorker
        })
        .collect()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
