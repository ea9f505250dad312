use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Chat endpoint configuration for the agent workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentsConfig {
    /// OpenAI-compatible base URL, e.g. `http://localhost:8000/v1`.
    pub llm_url: String,
    pub model: String,
    /// Sent as a bearer token when present.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    /// HTTP timeout for one completion request.
    pub request_timeout_secs: u64,
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            llm_url: std::env::var("ANALYSIS_LLM_URL")
                .unwrap_or_else(|_| "http://localhost:8000/v1".into()),
            model: std::env::var("ANALYSIS_LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".into()),
            api_key: std::env::var("ANALYSIS_LLM_API_KEY")
                .ok()
                .filter(|k| !k.trim().is_empty()),
            max_tokens: env_parse("ANALYSIS_LLM_MAX_TOKENS").unwrap_or(1_500),
            temperature: env_parse("ANALYSIS_LLM_TEMPERATURE").unwrap_or(0.3),
            request_timeout_secs: env_parse("ANALYSIS_LLM_TIMEOUT_SECS").unwrap_or(170),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

impl AgentsConfig {
    pub fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.llm_url.trim_end_matches('/'))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Check if the chat endpoint is reachable (GET /models).
pub async fn check_endpoint(url: &str) -> bool {
    let models_url = format!("{}/models", url.trim_end_matches('/'));
    match reqwest::Client::new()
        .get(&models_url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(_) => false,
    }
}
