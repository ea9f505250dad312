//! LLM-backed role workers for every agent in the standard phase table.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use coordination::agents::PORTFOLIO_MANAGER;
use coordination::{
    AgentContext, AgentError, AgentOutput, AgentWorker, ErrorType, FinalDecision, PhaseSequencer,
    SharedWorker,
};
use regex::Regex;
use tracing::debug;

use crate::llm::SharedChatModel;
use crate::prompts::{self, PROMPT_VERSION};

/// One analysis role backed by a chat model.
pub struct RoleWorker {
    name: String,
    system: String,
    model: SharedChatModel,
}

impl RoleWorker {
    /// `None` when no prompt exists for `name`.
    pub fn new(name: &str, model: SharedChatModel) -> Option<Self> {
        Some(Self {
            name: name.to_string(),
            system: prompts::system_prompt(name)?,
            model,
        })
    }

    fn decides(&self) -> bool {
        self.name == PORTFOLIO_MANAGER
    }
}

#[async_trait]
impl AgentWorker for RoleWorker {
    fn name(&self) -> &str {
        &self.name
    }

    async fn analyze(&self, ctx: &AgentContext) -> Result<AgentOutput, AgentError> {
        let user = prompts::user_prompt(ctx);
        debug!(
            run_id = %ctx.run_id,
            agent = %self.name,
            attempt = ctx.attempt,
            prompt_chars = user.len(),
            "Requesting completion"
        );
        let text = self.model.complete(&self.system, &user).await?;

        let points = parse_points(&text);
        let summary = summary_of(&text);
        let mut insight = serde_json::json!({
            "summary": summary,
            "points": points,
            "promptVersion": PROMPT_VERSION,
        });

        let mut output = AgentOutput::new(summary).with_points(points);
        if self.decides() {
            let decision = parse_decision(&text).ok_or_else(|| {
                AgentError::new(
                    ErrorType::AiError,
                    "portfolio manager response has no DECISION line",
                )
            })?;
            insight["decision"] = serde_json::json!(decision.decision);
            insight["confidence"] = serde_json::json!(decision.confidence);
            output = output.with_decision(decision.decision, decision.confidence);
        }
        Ok(output.with_insight(insight))
    }
}

/// Workers for every agent in `sequencer`, sharing one model.
pub fn workers_for(sequencer: &PhaseSequencer, model: SharedChatModel) -> Vec<SharedWorker> {
    sequencer
        .phases()
        .iter()
        .flat_map(|phase| phase.ordered_agents())
        .filter_map(|spec| RoleWorker::new(&spec.name, Arc::clone(&model)))
        .map(|worker| Arc::new(worker) as SharedWorker)
        .collect()
}

/// Bullet lines (`- ` or `* `), without the marker.
pub fn parse_points(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter_map(|line| line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")))
        .map(|point| point.trim().to_string())
        .filter(|point| !point.is_empty())
        .collect()
}

/// Prose before the first bullet or decision line.
pub fn summary_of(text: &str) -> String {
    let prose: Vec<&str> = text
        .lines()
        .map(str::trim)
        .take_while(|line| {
            !line.starts_with("- ")
                && !line.starts_with("* ")
                && !decision_re().is_some_and(|re| re.is_match(line))
        })
        .filter(|line| !line.is_empty())
        .collect();
    if prose.is_empty() {
        text.trim().to_string()
    } else {
        prose.join(" ")
    }
}

fn decision_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?im)^\s*\**DECISION\**\s*:\s*\**\s*(BUY|SELL|HOLD)\b").ok())
        .as_ref()
}

fn confidence_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?im)^\s*\**CONFIDENCE\**\s*:\s*\**\s*([0-9]*\.?[0-9]+)\s*(%)?").ok()
    })
    .as_ref()
}

/// `DECISION:` and optional `CONFIDENCE:` lines. Percentages are scaled to
/// `0..=1`; out-of-range confidences are dropped.
pub fn parse_decision(text: &str) -> Option<FinalDecision> {
    let decision = decision_re()?
        .captures(text)?
        .get(1)?
        .as_str()
        .to_uppercase();
    let confidence = confidence_re().and_then(|re| re.captures(text)).and_then(|caps| {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        let value = if caps.get(2).is_some() { value / 100.0 } else { value };
        (0.0..=1.0).contains(&value).then_some(value)
    });
    Some(FinalDecision {
        decision,
        confidence,
    })
}
