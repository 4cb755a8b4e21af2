//! System-wide default constants.
//!
//! Grouped by subsystem. Config structs use these for their `Default` impls.

// ============================================================================
// Server
// ============================================================================

pub const SERVER_ADDR: &str = "0.0.0.0:8000";

/// Config file looked up in the working directory when no path is given.
pub const LOCAL_CONFIG_FILE: &str = "fault_explainer.toml";

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "FAULT_EXPLAINER_CONFIG";

// ============================================================================
// Runtime Gate & Aggregation
// ============================================================================

/// Raw rows averaged into one aggregated row.
pub const DECIMATION: usize = 1;

/// Sliding-window capacity (aggregated rows).
pub const WINDOW_SIZE: usize = 20;

/// Anomalous rows in a row before a trigger is considered.
pub const REQUIRED_CONSECUTIVE: u32 = 1;

/// Floor of the default minimum context (`max(5, W/2)`).
pub const MIN_CONTEXT_FLOOR: usize = 5;

/// Minimum spacing between two analyses with the same signature (seconds).
pub const MIN_INTERVAL_SECS: u64 = 30;

/// Jaccard similarity below which a feature set counts as a new fault signature.
pub const DIVERGENCE_THRESHOLD: f64 = 0.6;

/// Minimum time since the last trigger before a divergent signature may fire (seconds).
pub const DIVERGENCE_COOLDOWN_SECS: u64 = 5;

/// Features ranked when building fingerprints and the comparison text.
pub const TOP_K: usize = 6;

// ============================================================================
// Detector
// ============================================================================

/// Significance level of the chi-squared threshold.
pub const DETECTOR_ALPHA: f64 = 0.01;

pub const BASELINE_PATH: &str = "stats/features_mean_std.csv";

// ============================================================================
// Broadcast
// ============================================================================

pub const HEARTBEAT_SECS: u64 = 15;

/// Events buffered per subscriber before it is considered too slow and dropped.
pub const SUBSCRIBER_QUEUE: usize = 64;

// ============================================================================
// History
// ============================================================================

pub const HISTORY_DB_PATH: &str = "./data/analysis_history.db";

/// Bundles retained by the in-memory recorder.
pub const MEMORY_HISTORY_CAPACITY: usize = 100;

/// Default `limit` for history queries.
pub const HISTORY_QUERY_LIMIT: usize = 6;

// ============================================================================
// Backends
// ============================================================================

pub const LOCAL_TIMEOUT_SECS: u64 = 45;
pub const ANTHROPIC_TIMEOUT_SECS: u64 = 30;
pub const GEMINI_TIMEOUT_SECS: u64 = 60;
pub const DRY_RUN_TIMEOUT_SECS: u64 = 10;

/// Retries allowed for transient transport failures. Never more than one.
pub const RETRY_BUDGET: u32 = 1;
pub const RETRY_DELAY_MS: u64 = 2_000;

/// How long a local backend's result stays on display (seconds).
pub const LOCAL_DISPLAY_SECS: u64 = 10;
/// How long a hosted backend's result stays on display (seconds).
pub const HOSTED_DISPLAY_SECS: u64 = 7;

pub const LMSTUDIO_BASE_URL: &str = "http://localhost:1234/v1";
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";
pub const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const ANTHROPIC_MODEL: &str = "claude-3-5-sonnet-20241022";
pub const GEMINI_MODEL: &str = "gemini-1.5-flash";

/// Model name used when a local server does not list one.
pub const FALLBACK_LOCAL_MODEL: &str = "local-model";

/// Local prompts longer than this are shortened before sending (chars).
pub const LOCAL_PROMPT_LIMIT: usize = 1_500;

pub const MAX_TOKENS: u32 = 2_000;

// ============================================================================
// Premium Session
// ============================================================================

pub const SESSION_MINUTES: u64 = 30;

/// How often the session monitor checks for expiry.
pub const SESSION_POLL_MS: u64 = 1_000;

// ============================================================================
// Sources
// ============================================================================

/// Pending commands the ingest actor will queue before callers wait.
pub const INGEST_QUEUE: usize = 256;

/// Progress log cadence for the processing loop (rows).
pub const PROGRESS_EVERY: u64 = 100;

/// Synthetic rows before a fault is injected.
pub const SYNTHETIC_FAULT_AFTER: u64 = 60;
