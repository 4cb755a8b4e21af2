//! Gemini `generateContent` backend

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::{check_status, http_client, AnalysisBackend, BackendError, BackendProfile};
use crate::config::{defaults, BackendConfig};
use crate::types::BackendId;

pub struct GeminiBackend {
    id: BackendId,
    profile: BackendProfile,
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
}

impl GeminiBackend {
    pub fn new(config: &BackendConfig) -> anyhow::Result<Self> {
        let profile = BackendProfile::from_config(config);
        Ok(Self {
            id: BackendId::new(&config.id),
            http: http_client(profile.timeout)?,
            profile,
            base_url: config
                .base_url
                .clone()
                .unwrap_or_else(|| defaults::GEMINI_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            api_key: config.api_key().unwrap_or_default(),
            model: config
                .model
                .clone()
                .unwrap_or_else(|| defaults::GEMINI_MODEL.to_string()),
            max_tokens: config.max_tokens.unwrap_or(defaults::MAX_TOKENS),
        })
    }
}

#[async_trait]
impl AnalysisBackend for GeminiBackend {
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

        // generateContent has no separate system slot on every model; prepend it.
        let body = json!({
            "contents": [{
                "role": "user",
                "parts": [{"text": format!("{system}\n\n{prompt}")}],
            }],
            "generationConfig": {"maxOutputTokens": self.max_tokens, "temperature": 0.2},
        });

        let resp = self
            .http
            .post(format!(
                "{}/v1beta/models/{}:generateContent",
                self.base_url, self.model
            ))
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await?;
        let parsed: GenerateResponse = check_status(resp).await?.json().await?;

        let text = parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
        if text.trim().is_empty() {
            Err(BackendError::EmptyResponse)
        } else {
            Ok(text)
        }
    }
}
