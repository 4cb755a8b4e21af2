//! Anthropic Messages API backend

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{check_status, http_client, AnalysisBackend, BackendError, BackendProfile};
use crate::config::{defaults, BackendConfig};
use crate::types::BackendId;

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicBackend {
    id: BackendId,
    profile: BackendProfile,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
}

impl AnthropicBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let profile = BackendProfile::from_config(config);
        Ok(Self {
            id: BackendId::new(&config.id),
            http: http_client(profile.timeout)?,
            profile,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| defaults::ANTHROPIC_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key().unwrap_or_default(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| defaults::ANTHROPIC_MODEL.to_string()),
            max_tokens: config.max_tokens.unwrap_or(defaults::MAX_TOKENS),
        })
    }
}

#[async_trait]
impl AnalysisBackend for AnthropicBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn analyze(&self, system: &str, prompt: &str) -> Result<String, BackendError> {
        if self.api_key.is_empty() {
            return Err(BackendError::transport("API key not configured", false));
        }

        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "system": system,
            "messages": [{"role": "user", "content": prompt}],
        });

        let resp = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .json(&body)
            .send()
            .await?;
        let parsed: MessagesResponse = check_status(resp).await?.json().await?;

        let text = parsed
            .content
            .into_iter()
            .filter(|b| b.kind == "text")
            .filter_map(|b| b.text)
            .collect::<Vec<_>>()
            .join("\n");
        if text.trim().is_empty() {
            Err(BackendError::EmptyResponse)
        } else {
            Ok(text)
        }
    }
}
