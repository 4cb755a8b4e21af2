//! Backend registry: configured backends, runtime toggles, usage counters

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use super::AnalysisBackend;
use crate::config::BackendTier;
use crate::types::{BackendId, BackendResult, BackendStatus};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown backend '{0}'")]
    Unknown(String),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UsageStats {
    pub calls: u64,
    pub successes: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub total_elapsed_ms: u64,
    pub last_used: Option<DateTime<Utc>>,
}

impl UsageStats {
    fn record(&mut self, result: &BackendResult) {
        self.calls += 1;
        self.total_elapsed_ms += result.elapsed_ms;
        self.last_used = Some(Utc::now());
        match result.status {
            BackendStatus::Success => self.successes += 1,
            BackendStatus::Error => self.errors += 1,
            BackendStatus::Timeout => self.timeouts += 1,
        }
    }

    pub fn average_ms(&self) -> Option<u64> {
        (self.calls > 0).then(|| self.total_elapsed_ms / self.calls)
    }
}

/// Snapshot row for `/backends`.
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatusView {
    pub id: BackendId,
    pub tier: BackendTier,
    pub active: bool,
    pub timeout_secs: u64,
    pub usage: UsageStats,
}

struct Entry {
    backend: Arc<dyn AnalysisBackend>,
    active: bool,
    usage: UsageStats,
}

/// Config-enabled backends plus their runtime on/off state.
///
/// Local backends start active; hosted ones start inactive and are switched
/// on explicitly, which opens a premium session.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    inner: Arc<RwLock<BTreeMap<BackendId, Entry>>>,
}

impl BackendRegistry {
    pub fn new(backends: Vec<Arc<dyn AnalysisBackend>>) -> Self {
        let entries = backends
            .into_iter()
            .map(|b| {
                let active = b.profile().tier == BackendTier::Local;
                (
                    b.id().clone(),
                    Entry {
                        backend: b,
                        active,
                        usage: UsageStats::default(),
                    },
                )
            })
            .collect();
        Self {
            inner: Arc::new(RwLock::new(entries)),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<BackendId, Entry>> {
        self.inner.read().unwrap_or_else(|e| {
            tracing::warn!("Backend registry lock poisoned, recovering");
            e.into_inner()
        })
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<BackendId, Entry>> {
        self.inner.write().unwrap_or_else(|e| {
            tracing::warn!("Backend registry lock poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn ids(&self) -> Vec<BackendId> {
        self.read().keys().cloned().collect()
    }

    pub fn get(&self, id: &BackendId) -> Option<Arc<dyn AnalysisBackend>> {
        self.read().get(id).map(|e| e.backend.clone())
    }

    pub fn all(&self) -> Vec<Arc<dyn AnalysisBackend>> {
        self.read().values().map(|e| e.backend.clone()).collect()
    }

    /// Backends taking part in the next dispatch.
    pub fn active(&self) -> Vec<Arc<dyn AnalysisBackend>> {
        self.read()
            .values()
            .filter(|e| e.active)
            .map(|e| e.backend.clone())
            .collect()
    }

    pub fn tier(&self, id: &BackendId) -> Option<BackendTier> {
        self.read().get(id).map(|e| e.backend.profile().tier)
    }

    /// Switch a backend on or off. Returns the previous state.
    pub fn set_active(&self, id: &BackendId, active: bool) -> Result<bool, RegistryError> {
        let mut entries = self.write();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| RegistryError::Unknown(id.to_string()))?;
        let previous = entry.active;
        entry.active = active;
        if previous != active {
            info!(backend = %id, active, "Backend toggled");
        }
        Ok(previous)
    }

    /// Turn every hosted backend off; returns the ones that were on.
    pub fn deactivate_hosted(&self) -> Vec<BackendId> {
        let mut entries = self.write();
        entries
            .iter_mut()
            .filter(|(_, e)| e.active && e.backend.profile().tier == BackendTier::Hosted)
            .map(|(id, e)| {
                e.active = false;
                id.clone()
            })
            .collect()
    }

    pub fn hosted_active(&self) -> Vec<BackendId> {
        self.read()
            .iter()
            .filter(|(_, e)| e.active && e.backend.profile().tier == BackendTier::Hosted)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn record<'a>(&self, results: impl IntoIterator<Item = &'a BackendResult>) {
        let mut entries = self.write();
        for result in results {
            if let Some(entry) = entries.get_mut(&result.backend_id) {
                entry.usage.record(result);
            }
        }
    }

    pub fn statuses(&self) -> Vec<BackendStatusView> {
        self.read()
            .iter()
            .map(|(id, e)| BackendStatusView {
                id: id.clone(),
                tier: e.backend.profile().tier,
                active: e.active,
                timeout_secs: e.backend.profile().timeout.as_secs(),
                usage: e.usage.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BackendProfile, ScriptedBackend};
    use crate::types::ErrorKind;
    use std::time::Duration;

    fn backend(id: &str, tier: BackendTier) -> Arc<dyn AnalysisBackend> {
        let profile = BackendProfile {
            tier,
            ..ScriptedBackend::test_profile(Duration::from_secs(5))
        };
        Arc::new(ScriptedBackend::new(id, profile))
    }

    fn registry() -> BackendRegistry {
        BackendRegistry::new(vec![
            backend("local", BackendTier::Local),
            backend("claude", BackendTier::Hosted),
        ])
    }

    #[test]
    fn test_hosted_backends_start_inactive() {
        let reg = registry();
        let active: Vec<_> = reg.active().iter().map(|b| b.id().to_string()).collect();
        assert_eq!(active, vec!["local"]);
    }

    #[test]
    fn test_toggle_and_deactivate_hosted() {
        let reg = registry();
        assert_eq!(reg.set_active(&"claude".into(), true), Ok(false));
        assert_eq!(reg.active().len(), 2);
        assert_eq!(reg.hosted_active(), vec![BackendId::from("claude")]);

        let stopped = reg.deactivate_hosted();
        assert_eq!(stopped, vec![BackendId::from("claude")]);
        assert_eq!(reg.active().len(), 1);
    }

    #[test]
    fn test_unknown_backend_toggle() {
        let reg = registry();
        assert!(matches!(
            reg.set_active(&"nope".into(), true),
            Err(RegistryError::Unknown(_))
        ));
    }

    #[test]
    fn test_usage_recording() {
        let reg = registry();
        reg.record(&[
            BackendResult::success("local".into(), "ok".into(), 100, 1),
            BackendResult::failure("local".into(), ErrorKind::Timeout, "slow", 300, 1),
        ]);
        let view = reg
            .statuses()
            .into_iter()
            .find(|s| s.id.as_str() == "local")
            .unwrap();
        assert_eq!(view.usage.calls, 2);
        assert_eq!(view.usage.timeouts, 1);
        assert_eq!(view.usage.average_ms(), Some(200));
    }
}
