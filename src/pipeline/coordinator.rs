//! Ingest Coordinator - per-row processing sequence
//!
//! ```text
//! STEP 1: Runtime config sync (decimation, window size)
//! STEP 2: Projection + decimation (N raw rows -> 1 aggregated row)
//! STEP 3: Detector scoring
//! STEP 4: Sequence assignment + stream broadcast
//! STEP 5: Anomaly gate (consecutive, context, single-flight, interval/divergence)
//! STEP 6: Commit + hand-off to the trigger sink (ONLY if eligible)
//! ```
//!
//! Every step is synchronous; the coordinator never waits for analysis. It is
//! owned by the ingest actor, which is the only writer of gate state.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::aggregator::{AggregateOutcome, SampleAggregator};
use super::features::comparison_text;
use super::gate::{AnomalyGate, GateOutcome, GateStats};
use crate::analysis::{AnalysisJob, TriggerSink};
use crate::baseline::{BaselineStats, Detector};
use crate::broadcast::StreamBroadcaster;
use crate::config::{RuntimeConfig, RuntimeConfigHandle};
use crate::types::{
    AggregatedRow, FeatureContribution, FeatureSchema, IngestError, RawRow, TriggerDecision,
    TriggerReason,
};

/// Immediate answer to one ingested row.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum IngestAck {
    Aggregating {
        have: usize,
        need: usize,
    },
    Processed {
        sequence_index: u64,
        anomaly_score: f64,
        is_anomaly: bool,
        threshold: f64,
        consecutive: u32,
        decision: TriggerDecision,
    },
}

impl IngestAck {
    pub fn decision(&self) -> Option<&TriggerDecision> {
        match self {
            IngestAck::Processed { decision, .. } => Some(decision),
            IngestAck::Aggregating { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestMetrics {
    pub raw_rows: u64,
    pub rejected_rows: u64,
    pub aggregated_rows: u64,
    pub anomalous_rows: u64,
    pub buffered_samples: usize,
    pub decimation: usize,
    pub window_len: usize,
    pub window_capacity: usize,
    pub consecutive: u32,
    pub in_flight: bool,
    pub gate: GateStats,
}

/// Current top contributors and their comparison text, without side effects.
#[derive(Debug, Clone, Serialize)]
pub struct FeaturePreview {
    pub window_len: usize,
    pub top_features: Vec<FeatureContribution>,
    pub comparison: String,
}

pub struct IngestCoordinator {
    aggregator: SampleAggregator,
    detector: Arc<dyn Detector>,
    gate: AnomalyGate,
    runtime: RuntimeConfigHandle,
    applied: Arc<RuntimeConfig>,
    broadcaster: StreamBroadcaster,
    sink: Arc<dyn TriggerSink>,
    baseline: Option<Arc<BaselineStats>>,
    next_sequence: u64,
    raw_rows: u64,
    rejected_rows: u64,
    anomalous_rows: u64,
}

impl IngestCoordinator {
    pub fn new(
        schema: FeatureSchema,
        detector: Arc<dyn Detector>,
        runtime: RuntimeConfigHandle,
        broadcaster: StreamBroadcaster,
        sink: Arc<dyn TriggerSink>,
    ) -> Self {
        let applied = runtime.load();
        Self {
            aggregator: SampleAggregator::new(schema, applied.decimation),
            detector,
            gate: AnomalyGate::new(applied.window_size),
            runtime,
            applied,
            broadcaster,
            sink,
            baseline: None,
            next_sequence: 1,
            raw_rows: 0,
            rejected_rows: 0,
            anomalous_rows: 0,
        }
    }

    /// Baseline used for the "Normal" column of comparison text.
    pub fn with_baseline(mut self, baseline: Arc<BaselineStats>) -> Self {
        self.baseline = Some(baseline);
        self
    }

    /// Pick up a new runtime snapshot if one was published.
    pub fn sync_runtime(&mut self) -> Arc<RuntimeConfig> {
        let current = self.runtime.load();
        if !Arc::ptr_eq(&current, &self.applied) {
            if current.decimation != self.applied.decimation {
                self.aggregator.set_group_size(current.decimation);
            }
            if current.window_size != self.applied.window_size {
                self.gate.resize_window(current.window_size);
            }
            debug!(decimation = current.decimation, window = current.window_size, "Runtime config applied");
            self.applied = current.clone();
        }
        current
    }

    /// Process one raw row. Never waits on analysis.
    pub fn ingest(&mut self, raw: &RawRow, now: Instant) -> Result<IngestAck, IngestError> {
        let cfg = self.sync_runtime();
        self.raw_rows += 1;

        let features = match self.aggregator.submit(raw) {
            Ok(AggregateOutcome::Accumulating { have, need }) => {
                return Ok(IngestAck::Aggregating { have, need });
            }
            Ok(AggregateOutcome::Emitted { row }) => row,
            Err(e) => {
                self.rejected_rows += 1;
                return Err(e);
            }
        };

        let verdict = self.detector.score(&features).map_err(|e| {
            self.rejected_rows += 1;
            IngestError::from(e)
        })?;

        let sequence_index = self.next_sequence;
        self.next_sequence += 1;
        if verdict.is_anomaly {
            self.anomalous_rows += 1;
        }
        let row = Arc::new(AggregatedRow::new(sequence_index, features, verdict));
        self.broadcaster.publish_row(row.clone());

        let decision = match self.gate.evaluate(row, now, &cfg) {
            GateOutcome::Refused(decision) => decision,
            GateOutcome::Eligible(candidate) => {
                let ticket = self.gate.commit(&candidate);
                let job = AnalysisJob {
                    cycle_id: ticket.cycle_id,
                    sequence_index,
                    reason: candidate.reason,
                    top_features: candidate.top_features.clone(),
                    comparison: comparison_text(&candidate.top_features, self.baseline.as_deref()),
                };
                match self.sink.schedule(job) {
                    Ok(()) => candidate.decision(),
                    Err(e) => {
                        warn!(cycle_id = ticket.cycle_id, error = %e, "Analysis hand-off failed, trigger rolled back");
                        self.gate.rollback(ticket);
                        TriggerDecision::refused(
                            TriggerReason::RateLimited,
                            format!("analysis could not be scheduled: {e}"),
                        )
                    }
                }
            }
        };

        Ok(IngestAck::Processed {
            sequence_index,
            anomaly_score: verdict.score,
            is_anomaly: verdict.is_anomaly,
            threshold: verdict.threshold,
            consecutive: self.gate.consecutive(),
            decision,
        })
    }

    /// Analysis cycle finished (in any way).
    pub fn complete(&mut self, cycle_id: u64) -> bool {
        self.gate.complete(cycle_id)
    }

    pub fn in_flight(&self) -> bool {
        self.gate.in_flight()
    }

    pub fn preview(&self) -> FeaturePreview {
        let top = self.gate.preview(self.applied.top_k);
        FeaturePreview {
            window_len: self.gate.window().len(),
            comparison: comparison_text(&top, self.baseline.as_deref()),
            top_features: top,
        }
    }

    pub fn metrics(&self) -> IngestMetrics {
        IngestMetrics {
            raw_rows: self.raw_rows,
            rejected_rows: self.rejected_rows,
            aggregated_rows: self.aggregator.emitted(),
            anomalous_rows: self.anomalous_rows,
            buffered_samples: self.aggregator.buffered(),
            decimation: self.aggregator.group_size(),
            window_len: self.gate.window().len(),
            window_capacity: self.gate.window().capacity(),
            consecutive: self.gate.consecutive(),
            in_flight: self.gate.in_flight(),
            gate: self.gate.stats().clone(),
        }
    }
}
