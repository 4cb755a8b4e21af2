//! Service configuration: TOML schema, loading, validation

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::defaults;
use super::runtime::RuntimeConfig;

/// Tennessee Eastman process measurements and manipulated variables.
const DEFAULT_FEATURES: &[&str] = &[
    "A Feed",
    "D Feed",
    "E Feed",
    "A and C Feed",
    "Recycle Flow",
    "Reactor Feed Rate",
    "Reactor Pressure",
    "Reactor Level",
    "Reactor Temperature",
    "Purge Rate",
    "Product Sep Temp",
    "Product Sep Level",
    "Product Sep Pressure",
    "Product Sep Underflow",
    "Stripper Level",
    "Stripper Pressure",
    "Stripper Underflow",
    "Stripper Temp",
    "Stripper Steam Flow",
    "Compressor Work",
    "Reactor Coolant Temp",
    "Separator Coolant Temp",
    "D feed load",
    "E feed load",
    "A feed load",
    "A and C feed load",
    "Compressor recycle valve",
    "Purge valve",
    "Separator liquid load",
    "Stripper liquid load",
    "Stripper steam valve",
    "Reactor coolant load",
    "Condenser coolant load",
];

// ============================================================================
// Top-level Config
// ============================================================================

/// Root configuration. Every section falls back to defaults when omitted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerConfig,
    pub features: FeatureConfig,
    pub detector: DetectorConfig,
    pub runtime: RuntimeConfig,
    pub broadcast: BroadcastConfig,
    pub history: HistoryConfig,
    pub session: SessionConfig,
    pub prompt: PromptConfig,
    pub backends: Vec<BackendConfig>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            features: FeatureConfig::default(),
            detector: DetectorConfig::default(),
            runtime: RuntimeConfig::default(),
            broadcast: BroadcastConfig::default(),
            history: HistoryConfig::default(),
            session: SessionConfig::default(),
            prompt: PromptConfig::default(),
            backends: default_backends(),
        }
    }
}

impl ServiceConfig {
    /// Load using the standard search order:
    ///
    /// 1. `FAULT_EXPLAINER_CONFIG` environment variable
    /// 2. `./fault_explainer.toml`
    /// 3. Built-in defaults
    pub fn load() -> Self {
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded config from {}", defaults::CONFIG_ENV_VAR);
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from env path, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{} points to non-existent file, falling back", defaults::CONFIG_ENV_VAR);
            }
        }

        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded config from ./{}", defaults::LOCAL_CONFIG_FILE);
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{}, using defaults", defaults::LOCAL_CONFIG_FILE);
                }
            }
        }

        info!("No config file found, using built-in defaults");
        Self::default()
    }

    /// Path the watcher should follow, if any file is in play.
    pub fn resolved_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(defaults::CONFIG_ENV_VAR) {
            let p = PathBuf::from(path);
            if p.exists() {
                return Some(p);
            }
        }
        let local = PathBuf::from(defaults::LOCAL_CONFIG_FILE);
        local.exists().then_some(local)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let mut config: Self = toml::from_str(contents)?;
        for backend in &mut config.backends {
            backend.resolve_secrets();
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate every section, collecting all problems rather than stopping at the first.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        if self.features.columns.is_empty() {
            errors.push("features.columns must list at least one feature".to_string());
        }
        if !(self.detector.alpha > 0.0 && self.detector.alpha < 1.0) {
            errors.push(format!(
                "detector.alpha ({}) must be in (0, 1)",
                self.detector.alpha
            ));
        }
        self.runtime.collect_errors(&mut errors);

        if self.broadcast.heartbeat_secs == 0 {
            errors.push("broadcast.heartbeat_secs must be > 0".to_string());
        }
        if self.broadcast.subscriber_queue == 0 {
            errors.push("broadcast.subscriber_queue must be > 0".to_string());
        }
        if self.session.duration_minutes == 0 {
            errors.push("session.duration_minutes must be > 0".to_string());
        }

        let mut seen = std::collections::BTreeSet::new();
        for backend in &self.backends {
            if backend.id.trim().is_empty() {
                errors.push("backends[].id must not be empty".to_string());
            } else if !seen.insert(backend.id.as_str()) {
                errors.push(format!("backend id '{}' is defined more than once", backend.id));
            }
            if backend.retry_budget.unwrap_or(defaults::RETRY_BUDGET) > 1 {
                errors.push(format!(
                    "backend '{}': retry_budget must be 0 or 1",
                    backend.id
                ));
            }
            if backend.timeout_secs == Some(0) {
                errors.push(format!("backend '{}': timeout_secs must be > 0", backend.id));
            }
        }
        if !self.backends.iter().any(|b| b.enabled) {
            errors.push("at least one backend must be enabled".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Error Type
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "Config I/O error ({}): {}", path.display(), e),
            ConfigError::Parse(path, e) => {
                write!(f, "Config parse error ({}): {}", path.display(), e)
            }
            ConfigError::Serialize(e) => write!(f, "Config serialization error: {}", e),
            ConfigError::Validation(errors) => {
                writeln!(f, "Config validation failed:")?;
                for e in errors {
                    writeln!(f, "  - {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConfigError {
    /// Individual messages, for API responses.
    pub fn messages(&self) -> Vec<String> {
        match self {
            ConfigError::Validation(errors) => errors.clone(),
            other => vec![other.to_string()],
        }
    }
}

// ============================================================================
// Sections
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: defaults::SERVER_ADDR.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    /// Feature columns, in display order.
    pub columns: Vec<String>,
    /// CSV with `feature,mean,std` rows describing normal operation.
    pub baseline_path: PathBuf,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            columns: DEFAULT_FEATURES.iter().map(|s| (*s).to_string()).collect(),
            baseline_path: PathBuf::from(defaults::BASELINE_PATH),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub alpha: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            alpha: defaults::DETECTOR_ALPHA,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    pub heartbeat_secs: u64,
    pub subscriber_queue: usize,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            heartbeat_secs: defaults::HEARTBEAT_SECS,
            subscriber_queue: defaults::SUBSCRIBER_QUEUE,
        }
    }
}

impl BroadcastConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Keep bundles in memory only (nothing written to disk).
    pub in_memory: bool,
    pub db_path: PathBuf,
    pub memory_capacity: usize,
    /// Directory for daily Markdown journals. Disabled when unset.
    pub markdown_dir: Option<PathBuf>,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            db_path: PathBuf::from(defaults::HISTORY_DB_PATH),
            memory_capacity: defaults::MEMORY_HISTORY_CAPACITY,
            markdown_dir: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub duration_minutes: u64,
    /// Stop the row source when a premium session ends.
    pub stop_source_on_shutdown: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            duration_minutes: defaults::SESSION_MINUTES,
            stop_source_on_shutdown: true,
        }
    }
}

impl SessionConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_minutes * 60)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptMode {
    /// Describe how the deviating features relate to a fault.
    #[default]
    Explain,
    /// Ask for ranked root-cause hypotheses.
    RootCause,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptConfig {
    pub mode: PromptMode,
    /// Replaces the built-in system message when set.
    pub system_message: Option<String>,
}

// ============================================================================
// Backends
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// OpenAI-compatible chat completions (LM Studio, llama.cpp server, ...).
    OpenaiCompat,
    Anthropic,
    Gemini,
    /// Canned responses, no network.
    DryRun,
}

/// Local backends run for free; hosted ones are billed and session-gated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    Local,
    Hosted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub id: String,
    pub kind: BackendKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Literal key or `${ENV_VAR}`.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry_budget: Option<u32>,
    #[serde(default)]
    pub retry_delay_ms: Option<u64>,
    #[serde(default)]
    pub display_secs: Option<u64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub tier: Option<BackendTier>,
    /// Simulated latency for `dry_run` backends.
    #[serde(default)]
    pub dry_run_delay_ms: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_backends() -> Vec<BackendConfig> {
    vec![
        BackendConfig::new("lmstudio", BackendKind::OpenaiCompat),
        BackendConfig {
            api_key: Some("${ANTHROPIC_API_KEY}".to_string()),
            ..BackendConfig::new("claude", BackendKind::Anthropic)
        },
        BackendConfig {
            api_key: Some("${GEMINI_API_KEY}".to_string()),
            ..BackendConfig::new("gemini", BackendKind::Gemini)
        },
    ]
}

impl BackendConfig {
    pub fn new(id: impl Into<String>, kind: BackendKind) -> Self {
        Self {
            id: id.into(),
            kind,
            enabled: true,
            base_url: None,
            model: None,
            api_key: None,
            timeout_secs: None,
            retry_budget: None,
            retry_delay_ms: None,
            display_secs: None,
            max_tokens: None,
            tier: None,
            dry_run_delay_ms: None,
        }
    }

    pub fn tier(&self) -> BackendTier {
        self.tier.unwrap_or(match self.kind {
            BackendKind::OpenaiCompat | BackendKind::DryRun => BackendTier::Local,
            BackendKind::Anthropic | BackendKind::Gemini => BackendTier::Hosted,
        })
    }

    pub fn timeout(&self) -> Duration {
        let secs = self.timeout_secs.unwrap_or(match self.kind {
            BackendKind::OpenaiCompat => defaults::LOCAL_TIMEOUT_SECS,
            BackendKind::Anthropic => defaults::ANTHROPIC_TIMEOUT_SECS,
            BackendKind::Gemini => defaults::GEMINI_TIMEOUT_SECS,
            BackendKind::DryRun => defaults::DRY_RUN_TIMEOUT_SECS,
        });
        Duration::from_secs(secs)
    }

    pub fn display_duration(&self) -> Duration {
        let secs = self.display_secs.unwrap_or(match self.tier() {
            BackendTier::Local => defaults::LOCAL_DISPLAY_SECS,
            BackendTier::Hosted => defaults::HOSTED_DISPLAY_SECS,
        });
        Duration::from_secs(secs)
    }

    pub fn retry_budget(&self) -> u32 {
        self.retry_budget.unwrap_or(defaults::RETRY_BUDGET).min(1)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms.unwrap_or(defaults::RETRY_DELAY_MS))
    }

    /// Expand `${VAR}` in `api_key` from the environment.
    ///
    /// An unset variable leaves the key empty; the backend then reports
    /// transport errors rather than blocking startup.
    fn resolve_secrets(&mut self) {
        if let Some(key) = &self.api_key {
            if let Some(var) = key.strip_prefix("${").and_then(|k| k.strip_suffix('}')) {
                let resolved = std::env::var(var).unwrap_or_default();
                if resolved.is_empty() {
                    warn!(backend = %self.id, var, "API key variable is not set");
                }
                self.api_key = Some(resolved);
            }
        }
    }

    /// Key after `${VAR}` expansion, reading the environment lazily when the
    /// config was built in code rather than parsed.
    pub fn api_key(&self) -> Option<String> {
        let key = self.api_key.as_deref()?;
        match key.strip_prefix("${").and_then(|k| k.strip_suffix('}')) {
            Some(var) => std::env::var(var).ok(),
            None => Some(key.to_string()),
        }
    }
}
