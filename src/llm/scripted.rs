//! Deterministic backend driven by a script of delays and outcomes.
//!
//! Used for `kind = "dry_run"` deployments (no network, no cost) and as the
//! workhorse of the orchestration tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use super::{AnalysisBackend, BackendError, BackendProfile};
use crate::config::{BackendConfig, BackendTier};
use crate::types::BackendId;

/// One scripted call: wait `delay`, then produce `outcome`.
#[derive(Debug, Clone)]
pub struct ScriptStep {
    pub delay: Duration,
    pub outcome: Result<String, BackendError>,
}

impl ScriptStep {
    pub fn reply(delay: Duration, text: impl Into<String>) -> Self {
        Self {
            delay,
            outcome: Ok(text.into()),
        }
    }

    pub fn fail(delay: Duration, error: BackendError) -> Self {
        Self {
            delay,
            outcome: Err(error),
        }
    }
}

pub struct ScriptedBackend {
    id: BackendId,
    profile: BackendProfile,
    script: Mutex<VecDeque<ScriptStep>>,
    /// Used once the script runs dry. `None` echoes the prompt size.
    fallback: Option<ScriptStep>,
    calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(id: impl Into<String>, profile: BackendProfile) -> Self {
        Self {
            id: BackendId::new(id),
            profile,
            script: Mutex::new(VecDeque::new()),
            fallback: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Profile suitable for tests: 5s ceiling, one retry after 100ms.
    pub fn test_profile(timeout: Duration) -> BackendProfile {
        BackendProfile {
            timeout,
            retry_budget: 1,
            retry_delay: Duration::from_millis(100),
            display_duration: Duration::from_secs(7),
            tier: BackendTier::Local,
        }
    }

    pub fn dry_run(config: &BackendConfig) -> Self {
        let delay = Duration::from_millis(config.dry_run_delay_ms.unwrap_or(500));
        let mut backend = Self::new(&config.id, BackendProfile::from_config(config));
        backend.fallback = Some(ScriptStep {
            delay,
            outcome: Ok(String::new()),
        });
        backend
    }

    pub fn then(self, step: ScriptStep) -> Self {
        self.script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(step);
        self
    }

    pub fn then_reply(self, delay: Duration, text: impl Into<String>) -> Self {
        self.then(ScriptStep::reply(delay, text))
    }

    pub fn then_fail(self, delay: Duration, error: BackendError) -> Self {
        self.then(ScriptStep::fail(delay, error))
    }

    pub fn otherwise(mut self, step: ScriptStep) -> Self {
        self.fallback = Some(step);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AnalysisBackend for ScriptedBackend {
    fn id(&self) -> &BackendId {
        &self.id
    }

    fn profile(&self) -> &BackendProfile {
        &self.profile
    }

    async fn analyze(&self, _system: &str, prompt: &str) -> Result<String, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .or_else(|| self.fallback.clone());

        let Some(step) = step else {
            return Ok(format!("[{}] received {} chars of context", self.id, prompt.len()));
        };

        tokio::time::sleep(step.delay).await;
        match step.outcome {
            Ok(text) if text.is_empty() && self.fallback.is_some() => {
                let first = prompt.lines().nth(1).unwrap_or("no features ranked");
                Ok(format!(
                    "[dry run: {}] Leading deviation {}. No backend was contacted.",
                    self.id,
                    first.trim()
                ))
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_script_plays_in_order() {
        let backend = ScriptedBackend::new("s", ScriptedBackend::test_profile(Duration::from_secs(5)))
            .then_fail(Duration::from_millis(10), BackendError::transport("reset", true))
            .then_reply(Duration::from_millis(10), "ok");

        assert!(backend.analyze("", "").await.is_err());
        assert_eq!(backend.analyze("", "").await.unwrap(), "ok");
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_mentions_top_feature() {
        let mut cfg = BackendConfig::new("dry", crate::config::BackendKind::DryRun);
        cfg.dry_run_delay_ms = Some(1);
        let backend = ScriptedBackend::dry_run(&cfg);
        let text = backend
            .analyze("sys", "Top 1 Contributing Features:\n1. Reactor Pressure: Fault=1")
            .await
            .unwrap();
        assert!(text.contains("Reactor Pressure"));
    }
}
