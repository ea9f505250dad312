//! System prompts for each analysis role and the user-prompt builder.
//!
//! Prompt versioning: bump `PROMPT_VERSION` whenever a system prompt changes
//! so recorded insights can be traced back to the prompt that produced them.

use std::fmt::Write as _;

use coordination::agents::*;
use coordination::AgentContext;

/// Prompt version. Bump on any system prompt change.
pub const PROMPT_VERSION: &str = "1.2.0";

const ANALYST_FORMAT: &str = "\
Answer with a short summary paragraph followed by your key findings as \
bullet lines starting with \"- \".";

const RESEARCHER_FORMAT: &str = "\
Argue your side in one paragraph, then list your strongest arguments as \
bullet lines starting with \"- \". Rebut the other side's latest points \
directly when a transcript is provided.";

const MANAGER_FORMAT: &str = "\
Summarise the evidence in one paragraph, then give your recommendation \
as bullet lines starting with \"- \".";

const PORTFOLIO_FORMAT: &str = "\
Summarise your reasoning in one paragraph. End with exactly two lines:\n\
DECISION: BUY | SELL | HOLD\n\
CONFIDENCE: a number between 0 and 1";

/// System prompt for `agent`, or `None` for unknown roles.
pub fn system_prompt(agent: &str) -> Option<String> {
    let (role, format) = match agent {
        MACRO_ANALYST => (
            "You are a macroeconomic analyst. Assess rates, inflation, growth and \
             policy conditions relevant to the company.",
            ANALYST_FORMAT,
        ),
        MARKET_ANALYST => (
            "You are a technical market analyst. Assess price trend, momentum, \
             volatility and volume.",
            ANALYST_FORMAT,
        ),
        NEWS_ANALYST => (
            "You are a news analyst. Assess recent company and sector news and \
             its likely market impact.",
            ANALYST_FORMAT,
        ),
        SOCIAL_MEDIA_ANALYST => (
            "You are a sentiment analyst. Assess retail and social media sentiment \
             toward the company.",
            ANALYST_FORMAT,
        ),
        FUNDAMENTALS_ANALYST => (
            "You are a fundamentals analyst. Assess revenue, margins, balance sheet, \
             cash flow and valuation.",
            ANALYST_FORMAT,
        ),
        BULL_RESEARCHER => (
            "You are the bull researcher in an investment debate. Build the \
             strongest evidence-based case for investing.",
            RESEARCHER_FORMAT,
        ),
        BEAR_RESEARCHER => (
            "You are the bear researcher in an investment debate. Build the \
             strongest evidence-based case against investing.",
            RESEARCHER_FORMAT,
        ),
        RESEARCH_MANAGER => (
            "You are the research manager. Judge the bull/bear debate and produce \
             an investment plan.",
            MANAGER_FORMAT,
        ),
        TRADER => (
            "You are the trader. Turn the investment plan into a concrete trade \
             proposal with entry, sizing and exit.",
            MANAGER_FORMAT,
        ),
        RISKY_ANALYST => (
            "You are the aggressive risk analyst. Argue for upside capture in the \
             trade proposal.",
            ANALYST_FORMAT,
        ),
        SAFE_ANALYST => (
            "You are the conservative risk analyst. Argue for capital preservation \
             in the trade proposal.",
            ANALYST_FORMAT,
        ),
        NEUTRAL_ANALYST => (
            "You are the neutral risk analyst. Weigh upside against downside in \
             the trade proposal.",
            ANALYST_FORMAT,
        ),
        RISK_MANAGER => (
            "You are the risk manager. Reconcile the risk analysts' views and \
             adjust the trade proposal.",
            MANAGER_FORMAT,
        ),
        PORTFOLIO_MANAGER => (
            "You are the portfolio manager. Make the final investment decision.",
            PORTFOLIO_FORMAT,
        ),
        _ => return None,
    };
    Some(format!("{role}\n\n{format}"))
}

/// User prompt: subject, upstream insights and, for debate turns, the
/// transcript so far.
pub fn user_prompt(ctx: &AgentContext) -> String {
    let mut prompt = format!("Company: {}\nPhase: {}\n", ctx.subject, ctx.phase);

    if !ctx.insights.is_empty() {
        prompt.push_str("\n## Findings so far\n");
        for (agent, insight) in &ctx.insights {
            if ctx.is_degraded(agent) {
                let _ = writeln!(prompt, "- {agent}: unavailable (analysis failed)");
                continue;
            }
            let summary = insight
                .get("summary")
                .and_then(|s| s.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| insight.to_string());
            let _ = writeln!(prompt, "- {agent}: {summary}");
        }
    }

    if ctx.side.is_some() && !ctx.debate_rounds.is_empty() {
        prompt.push_str("\n## Debate transcript\n");
        for round in &ctx.debate_rounds {
            if let Some(bull) = &round.bull_text {
                let _ = writeln!(prompt, "Round {} bull: {bull}", round.round);
            }
            if let Some(bear) = &round.bear_text {
                let _ = writeln!(prompt, "Round {} bear: {bear}", round.round);
            }
        }
    }

    if let (Some(side), Some(round)) = (ctx.side, ctx.round) {
        let _ = writeln!(prompt, "\nYou argue the {side} side in round {round}.");
    }
    prompt
}
