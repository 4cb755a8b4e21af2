//! Analysis Backend Module
//!
//! Provides a unified interface over the text-generating services that turn a
//! feature-comparison prompt into a diagnostic explanation.
//!
//! ## Backends
//!
//! - **OpenAiCompatBackend**: local OpenAI-compatible server (LM Studio), free
//! - **AnthropicBackend**: Claude Messages API, hosted and session-gated
//! - **GeminiBackend**: Gemini `generateContent`, hosted and session-gated
//! - **ScriptedBackend**: canned replies and failures for dry runs and tests
//!
//! Each backend declares a [`BackendProfile`] (timeout ceiling, retry budget,
//! display duration, tier). The orchestrator and the per-backend lifecycle
//! actors both read timing from that one profile.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{BackendConfig, BackendKind, BackendTier};
use crate::types::BackendId;

mod anthropic;
mod gemini;
mod openai_compat;
pub mod registry;
pub mod scripted;

pub use anthropic::AnthropicBackend;
pub use gemini::GeminiBackend;
pub use openai_compat::OpenAiCompatBackend;
pub use registry::{BackendRegistry, BackendStatusView, RegistryError, UsageStats};
pub use scripted::{ScriptStep, ScriptedBackend};

/// Failure of a single backend call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {message}")]
    Transport { message: String, transient: bool },

    #[error("backend returned an empty response")]
    EmptyResponse,
}

impl BackendError {
    pub fn transport(message: impl Into<String>, transient: bool) -> Self {
        Self::Transport {
            message: message.into(),
            transient,
        }
    }

    /// Worth one retry. Timeouts never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transport { transient: true, .. })
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return BackendError::Timeout;
        }
        let transient = e.is_connect()
            || e.is_request()
            || e
                .status()
                .is_some_and(|s| s.is_server_error() || s.as_u16() == 429);
        BackendError::transport(e.to_string(), transient)
    }
}

/// Timing and cost characteristics of one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendProfile {
    /// Ceiling for the whole call, retries included.
    pub timeout: Duration,
    /// 0 or 1.
    pub retry_budget: u32,
    pub retry_delay: Duration,
    /// How long a manual-query result stays on display.
    pub display_duration: Duration,
    pub tier: BackendTier,
}

impl BackendProfile {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            timeout: config.timeout(),
            retry_budget: config.retry_budget(),
            retry_delay: config.retry_delay(),
            display_duration: config.display_duration(),
            tier: config.tier(),
        }
    }
}

/// A text-generating analysis service.
#[async_trait]
pub trait AnalysisBackend: Send + Sync + 'static {
    fn id(&self) -> &BackendId;

    fn profile(&self) -> &BackendProfile;

    /// One attempt. Timeouts and retries are applied by the caller.
    async fn analyze(&self, system: &str, prompt: &str) -> Result<String, BackendError>;
}

/// Build the backend described by `config`.
pub fn build_backend(config: &BackendConfig) -> anyhow::Result<Arc<dyn AnalysisBackend>> {
    let backend: Arc<dyn AnalysisBackend> = match config.kind {
        BackendKind::OpenaiCompat => Arc::new(OpenAiCompatBackend::new(config)?),
        BackendKind::Anthropic => Arc::new(AnthropicBackend::new(config)?),
        BackendKind::Gemini => Arc::new(GeminiBackend::new(config)?),
        BackendKind::DryRun => Arc::new(ScriptedBackend::dry_run(config)),
    };
    Ok(backend)
}

/// Shared HTTP client builder; the orchestrator enforces the real ceiling,
/// this only stops sockets from lingering after it.
pub(crate) fn http_client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout + Duration::from_secs(5))
        .build()
        .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {e}"))
}

/// Turn a non-success HTTP status into a transport error carrying the body.
pub(crate) async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    let transient = status.is_server_error() || status.as_u16() == 429;
    Err(BackendError::transport(
        format!("HTTP {}: {}", status.as_u16(), truncate(&body, 300)),
        transient,
    ))
}

/// Cut `text` to at most `max` chars on a char boundary.
pub(crate) fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_transient_transport_errors_retry() {
        assert!(BackendError::transport("reset", true).is_transient());
        assert!(!BackendError::transport("401", false).is_transient());
        assert!(!BackendError::Timeout.is_transient());
        assert!(!BackendError::EmptyResponse.is_transient());
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("ΔΔΔΔ", 2), "ΔΔ");
        assert_eq!(truncate("abc", 10), "abc");
    }

    #[test]
    fn test_profile_from_config_caps_retry_budget() {
        let mut cfg = BackendConfig::new("x", BackendKind::OpenaiCompat);
        cfg.retry_budget = Some(5);
        let profile = BackendProfile::from_config(&cfg);
        assert_eq!(profile.retry_budget, 1);
        assert_eq!(profile.timeout, Duration::from_secs(45));
    }
}
