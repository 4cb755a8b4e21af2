//! Hot-reloadable runtime knobs for aggregation and gating.
//!
//! The active [`RuntimeConfig`] lives behind an `ArcSwap` so readers on the
//! ingest path never block; writers (API, file watcher) publish a whole new
//! snapshot after validating it.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::defaults;
use super::ConfigError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Raw rows averaged into one aggregated row (N).
    pub decimation: usize,
    /// Sliding-window capacity (W).
    pub window_size: usize,
    pub required_consecutive: u32,
    /// Rows needed in the window before a trigger. `None` means `max(5, W/2)`.
    pub min_context: Option<usize>,
    pub min_interval_secs: u64,
    /// Jaccard similarity below which a feature set is a new signature.
    pub divergence_threshold: f64,
    /// Time since the last trigger before a divergent signature may fire.
    pub divergence_cooldown_secs: u64,
    pub top_k: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            decimation: defaults::DECIMATION,
            window_size: defaults::WINDOW_SIZE,
            required_consecutive: defaults::REQUIRED_CONSECUTIVE,
            min_context: None,
            min_interval_secs: defaults::MIN_INTERVAL_SECS,
            divergence_threshold: defaults::DIVERGENCE_THRESHOLD,
            divergence_cooldown_secs: defaults::DIVERGENCE_COOLDOWN_SECS,
            top_k: defaults::TOP_K,
        }
    }
}

impl RuntimeConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_secs(self.min_interval_secs)
    }

    pub fn divergence_cooldown(&self) -> Duration {
        Duration::from_secs(self.divergence_cooldown_secs)
    }

    /// Context requirement actually applied, never larger than the window.
    pub fn effective_min_context(&self) -> usize {
        let wanted = self
            .min_context
            .unwrap_or_else(|| defaults::MIN_CONTEXT_FLOOR.max(self.window_size / 2));
        wanted.min(self.window_size).max(1)
    }

    pub(crate) fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.decimation == 0 {
            errors.push("runtime.decimation must be >= 1".to_string());
        }
        if self.window_size == 0 {
            errors.push("runtime.window_size must be >= 1".to_string());
        }
        if self.required_consecutive == 0 {
            errors.push("runtime.required_consecutive must be >= 1".to_string());
        }
        if self.min_context == Some(0) {
            errors.push("runtime.min_context must be >= 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.divergence_threshold) {
            errors.push(format!(
                "runtime.divergence_threshold ({}) must be in [0, 1]",
                self.divergence_threshold
            ));
        }
        if self.top_k == 0 {
            errors.push("runtime.top_k must be >= 1".to_string());
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        self.collect_errors(&mut errors);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Field-by-field differences from `self` to `other`.
    pub fn diff(&self, other: &RuntimeConfig) -> Vec<ConfigChange> {
        let mut changes = Vec::new();
        macro_rules! field {
            ($name:ident) => {
                if self.$name != other.$name {
                    changes.push(ConfigChange {
                        key: concat!("runtime.", stringify!($name)).to_string(),
                        old: format!("{:?}", self.$name),
                        new: format!("{:?}", other.$name),
                    });
                }
            };
        }
        field!(decimation);
        field!(window_size);
        field!(required_consecutive);
        field!(min_context);
        field!(min_interval_secs);
        field!(divergence_threshold);
        field!(divergence_cooldown_secs);
        field!(top_k);
        changes
    }
}

/// One applied change, reported back to API callers and the watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigChange {
    pub key: String,
    pub old: String,
    pub new: String,
}

/// Partial update; absent fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeUpdate {
    pub decimation: Option<usize>,
    pub window_size: Option<usize>,
    pub required_consecutive: Option<u32>,
    /// `Some(0)` resets to the automatic `max(5, W/2)` rule.
    pub min_context: Option<usize>,
    pub min_interval_secs: Option<u64>,
    pub divergence_threshold: Option<f64>,
    pub divergence_cooldown_secs: Option<u64>,
    pub top_k: Option<usize>,
}

impl RuntimeUpdate {
    pub fn apply_to(&self, base: &RuntimeConfig) -> RuntimeConfig {
        let mut next = base.clone();
        if let Some(v) = self.decimation {
            next.decimation = v;
        }
        if let Some(v) = self.window_size {
            next.window_size = v;
        }
        if let Some(v) = self.required_consecutive {
            next.required_consecutive = v;
        }
        if let Some(v) = self.min_context {
            next.min_context = (v > 0).then_some(v);
        }
        if let Some(v) = self.min_interval_secs {
            next.min_interval_secs = v;
        }
        if let Some(v) = self.divergence_threshold {
            next.divergence_threshold = v;
        }
        if let Some(v) = self.divergence_cooldown_secs {
            next.divergence_cooldown_secs = v;
        }
        if let Some(v) = self.top_k {
            next.top_k = v;
        }
        next
    }
}

/// Shared, lock-free handle to the active runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfigHandle {
    inner: Arc<ArcSwap<RuntimeConfig>>,
}

impl RuntimeConfigHandle {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(config)),
        }
    }

    pub fn load(&self) -> Arc<RuntimeConfig> {
        self.inner.load_full()
    }

    /// Validate and publish a partial update. Nothing changes on error.
    pub fn update(&self, update: &RuntimeUpdate) -> Result<Vec<ConfigChange>, ConfigError> {
        let current = self.load();
        let next = update.apply_to(&current);
        self.replace(next)
    }

    /// Validate and publish a full replacement.
    pub fn replace(&self, next: RuntimeConfig) -> Result<Vec<ConfigChange>, ConfigError> {
        next.validate()?;
        let current = self.load();
        let changes = current.diff(&next);
        if !changes.is_empty() {
            self.inner.store(Arc::new(next));
            for c in &changes {
                info!(key = %c.key, old = %c.old, new = %c.new, "Runtime config changed");
            }
        }
        Ok(changes)
    }
}
