//! Analysis output types: per-backend results and merged bundles

use std::collections::BTreeMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{FeatureContribution, TriggerReason};

// ============================================================================
// Backend Identity & Results
// ============================================================================

/// Stable identifier of an analysis backend (`"lmstudio"`, `"claude"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackendId(String);

impl BackendId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BackendId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Success,
    Error,
    Timeout,
}

/// Finer-grained failure classification carried alongside `BackendStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Transport,
    EmptyResponse,
    /// The call task itself died (panic or cancellation).
    Internal,
}

/// Settled outcome of one backend call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendResult {
    pub backend_id: BackendId,
    /// Analysis text on success, error description otherwise.
    pub text: String,
    pub status: BackendStatus,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default = "one")]
    pub attempts: u32,
}

fn one() -> u32 {
    1
}

impl BackendResult {
    pub fn success(backend_id: BackendId, text: String, elapsed_ms: u64, attempts: u32) -> Self {
        Self {
            backend_id,
            text,
            status: BackendStatus::Success,
            elapsed_ms,
            error_kind: None,
            attempts,
        }
    }

    pub fn failure(
        backend_id: BackendId,
        kind: ErrorKind,
        message: impl Into<String>,
        elapsed_ms: u64,
        attempts: u32,
    ) -> Self {
        let status = match kind {
            ErrorKind::Timeout => BackendStatus::Timeout,
            _ => BackendStatus::Error,
        };
        Self {
            backend_id,
            text: message.into(),
            status,
            elapsed_ms,
            error_kind: Some(kind),
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BackendStatus::Success
    }

    pub fn word_count(&self) -> usize {
        if self.is_success() {
            self.text.split_whitespace().count()
        } else {
            0
        }
    }
}

// ============================================================================
// Analysis Bundle
// ============================================================================

/// Per-backend line of the performance summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceEntry {
    pub backend_id: BackendId,
    pub status: BackendStatus,
    pub response_time_ms: u64,
    pub word_count: usize,
}

/// Merged result of one triggered analysis cycle. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisBundle {
    /// Unique, issued in creation order by the history recorder.
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    /// Sequence index of the aggregated row that fired the trigger.
    pub sequence_index: u64,
    pub trigger_reason: TriggerReason,
    pub feature_comparison: String,
    pub top_features: Vec<FeatureContribution>,
    pub results: BTreeMap<BackendId, BackendResult>,
}

impl AnalysisBundle {
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    /// Some, but not all, backends failed.
    pub fn is_partial_failure(&self) -> bool {
        let ok = self.succeeded();
        ok > 0 && ok < self.results.len()
    }

    pub fn all_failed(&self) -> bool {
        !self.results.is_empty() && self.succeeded() == 0
    }

    pub fn performance_summary(&self) -> Vec<PerformanceEntry> {
        self.results
            .values()
            .map(|r| PerformanceEntry {
                backend_id: r.backend_id.clone(),
                status: r.status,
                response_time_ms: r.elapsed_ms,
                word_count: r.word_count(),
            })
            .collect()
    }

    /// Lightweight view pushed to stream subscribers.
    pub fn summary(&self) -> AnalysisSummary {
        AnalysisSummary {
            id: self.id,
            timestamp: self.timestamp,
            sequence_index: self.sequence_index,
            trigger_reason: self.trigger_reason,
            top_features: self.top_features.iter().map(|f| f.name.clone()).collect(),
            statuses: self
                .results
                .iter()
                .map(|(id, r)| (id.clone(), r.status))
                .collect(),
        }
    }

    /// Render the bundle as a Markdown report section.
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();
        let _ = writeln!(
            md,
            "## Analysis #{} ({})\n",
            self.id,
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        );
        let _ = writeln!(
            md,
            "- Trigger: `{}` at row {}",
            self.trigger_reason, self.sequence_index
        );
        let _ = writeln!(
            md,
            "- Backends: {} succeeded of {}\n",
            self.succeeded(),
            self.results.len()
        );
        let _ = writeln!(md, "### Feature Comparison\n");
        let _ = writeln!(md, "```\n{}\n```\n", self.feature_comparison.trim_end());

        for result in self.results.values() {
            let _ = writeln!(
                md,
                "### {} ({:?}, {:.1}s)\n",
                result.backend_id,
                result.status,
                result.elapsed_ms as f64 / 1000.0
            );
            let _ = writeln!(md, "{}\n", result.text.trim());
        }
        md
    }
}

/// Stream-friendly digest of a bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisSummary {
    pub id: u64,
    pub timestamp: DateTime<Utc>,
    pub sequence_index: u64,
    pub trigger_reason: TriggerReason,
    pub top_features: Vec<String>,
    pub statuses: BTreeMap<BackendId, BackendStatus>,
}
