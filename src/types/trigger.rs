//! Trigger decisions made by the anomaly gate

use serde::{Deserialize, Serialize};

/// One feature's contribution to the current anomaly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureContribution {
    pub name: String,
    /// Value on the most recent aggregated row.
    pub latest: f64,
    /// Mean over the sliding window (latest row included).
    pub window_mean: f64,
    /// `latest - window_mean`; ranking uses the absolute value.
    pub deviation: f64,
}

/// Why the gate did or did not fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerReason {
    /// No analysis has run yet.
    FirstDetection,
    /// The contributing-feature set diverged from the last triggered one.
    StateChanged,
    /// Same signature, but the minimum interval has passed.
    IntervalElapsed,
    RateLimited,
    AlreadyInFlight,
    InsufficientContext,
    NotAnomalous,
    /// Anomalous, but the consecutive run is still too short.
    AwaitingConsecutive,
}

impl TriggerReason {
    pub fn is_eligible(self) -> bool {
        matches!(
            self,
            TriggerReason::FirstDetection
                | TriggerReason::StateChanged
                | TriggerReason::IntervalElapsed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TriggerReason::FirstDetection => "first_detection",
            TriggerReason::StateChanged => "state_changed",
            TriggerReason::IntervalElapsed => "interval_elapsed",
            TriggerReason::RateLimited => "rate_limited",
            TriggerReason::AlreadyInFlight => "already_in_flight",
            TriggerReason::InsufficientContext => "insufficient_context",
            TriggerReason::NotAnomalous => "not_anomalous",
            TriggerReason::AwaitingConsecutive => "awaiting_consecutive",
        }
    }
}

impl std::fmt::Display for TriggerReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating one aggregated row against the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerDecision {
    pub eligible: bool,
    pub reason: TriggerReason,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub top_features: Vec<FeatureContribution>,
}

impl TriggerDecision {
    pub fn refused(reason: TriggerReason, detail: impl Into<Option<String>>) -> Self {
        Self {
            eligible: false,
            reason,
            detail: detail.into(),
            top_features: Vec::new(),
        }
    }

    pub fn triggered(reason: TriggerReason, top_features: Vec<FeatureContribution>) -> Self {
        Self {
            eligible: true,
            reason,
            detail: None,
            top_features,
        }
    }
}
