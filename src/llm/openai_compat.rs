//! OpenAI-compatible chat-completions backend (LM Studio and friends)

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::{check_status, http_client, AnalysisBackend, BackendError, BackendProfile};
use crate::config::{defaults, BackendConfig};
use crate::types::BackendId;

pub struct OpenAiCompatBackend {
    id: BackendId,
    profile: BackendProfile,
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    configured_model: Option<String>,
    detected_model: OnceCell<String>,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ModelList {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    /// Reasoning models sometimes put everything here and leave `content` empty.
    #[serde(default, alias = "reasoning_content")]
    reasoning: Option<String>,
}

impl OpenAiCompatBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let profile = BackendProfile::from_config(config);
        Ok(Self {
            id: BackendId::new(&config.id),
            http: http_client(profile.timeout)?,
            profile,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| defaults::LMSTUDIO_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key().filter(|k| !k.is_empty()),
            configured_model: config.model.clone(),
            detected_model: OnceCell::new(),
            max_tokens: config.max_tokens.unwrap_or(defaults::MAX_TOKENS),
        })
    }

    /// Configured model, else the first one the server lists, else a placeholder.
    async fn model(&self) -> &str {
        if let Some(m) = &self.configured_model {
            return m;
        }
        self.detected_model
            .get_or_init(|| async {
                match self.list_models().await {
                    Ok(Some(m)) => {
                        info!(backend = %self.id, model = %m, "Detected local model");
                        m
                    }
                    Ok(None) => defaults::FALLBACK_LOCAL_MODEL.to_string(),
                    Err(e) => {
                        warn!(backend = %self.id, error = %e, "Model detection failed, using fallback name");
                        defaults::FALLBACK_LOCAL_MODEL.to_string()
                    }
                }
            })
            .await
    }

    async fn list_models(&self) -> Result<Option<String>, BackendError> {
        let mut req = self.http.get(format!("{}/models", self.base_url));
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = check_status(req.send().await?).await?;
        let list: ModelList = resp.json().await?;
        Ok(list.data.into_iter().next().map(|m| m.id))
    }
}

/// Local models choke on long prompts; keep the head, which holds the ranking.
fn shorten_prompt(prompt: &str) -> String {
    let limit = defaults::LOCAL_PROMPT_LIMIT;
    if prompt.chars().count() <= limit {
        return prompt.to_string();
    }
    let head = super::truncate(prompt, limit);
    format!("{head}\n\n[context truncated]")
}

#[async_trait]
impl AnalysisBackend for OpenAiCompatBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn analyze(&self, system: &str, prompt: &str) -> Result<String, BackendError> {
        let model = self.model().await.to_string();
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": shorten_prompt(prompt)},
            ],
            "max_tokens": self.max_tokens,
            "temperature": 0.2,
        });

        let mut req = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }

        let resp = check_status(req.send().await?).await?;
        let parsed: ChatResponse = resp.json().await?;
        let message = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or(BackendError::EmptyResponse)?;

        match (message.content, message.reasoning) {
            (Some(c), _) if !c.trim().is_empty() => Ok(c),
            (_, Some(r)) if !r.trim().is_empty() => {
                debug!(backend = %self.id, "Using reasoning field, content was empty");
                Ok(r)
            }
            _ => Err(BackendError::EmptyResponse),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_prompt_untouched() {
        assert_eq!(shorten_prompt("hello"), "hello");
    }

    #[test]
    fn test_long_prompt_shortened() {
        let long = "x".repeat(defaults::LOCAL_PROMPT_LIMIT + 500);
        let short = shorten_prompt(&long);
        assert!(short.ends_with("[context truncated]"));
        assert!(short.len() < long.len());
    }

    #[test]
    fn test_reasoning_field_alias_parses() {
        let raw = r#"{"choices":[{"message":{"content":"","reasoning_content":"valve stuck"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let msg = &parsed.choices[0].message;
        assert_eq!(msg.reasoning.as_deref(), Some("valve stuck"));
    }
}
