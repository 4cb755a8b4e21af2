//! Anomaly gate: decides when an aggregated row earns an analysis cycle.
//!
//! Owns the sliding window, the consecutive-anomaly counter and the
//! single-flight / rate-limit state. Evaluation is synchronous and only ever
//! driven from the ingest actor, so no locking is needed here.
//!
//! A trigger is a two-step affair: [`AnomalyGate::evaluate`] returns a
//! [`TriggerCandidate`], the caller [`commit`](AnomalyGate::commit)s it and
//! tries to schedule the analysis. If scheduling fails the ticket is
//! [`rollback`](AnomalyGate::rollback)ed, restoring the exact prior state.

use std::sync::Arc;

use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info};

use super::features::{top_contributors, FeatureFingerprint};
use super::window::SlidingWindow;
use crate::config::RuntimeConfig;
use crate::types::{AggregatedRow, FeatureContribution, TriggerDecision, TriggerReason};

/// An eligible trigger that has not been committed yet.
#[derive(Debug, Clone)]
pub struct TriggerCandidate {
    pub reason: TriggerReason,
    pub row: Arc<AggregatedRow>,
    pub top_features: Vec<FeatureContribution>,
    pub fingerprint: FeatureFingerprint,
    pub detected_at: Instant,
}

impl TriggerCandidate {
    pub fn decision(&self) -> TriggerDecision {
        TriggerDecision::triggered(self.reason, self.top_features.clone())
    }
}

#[derive(Debug)]
pub enum GateOutcome {
    Refused(TriggerDecision),
    Eligible(TriggerCandidate),
}

#[derive(Debug, Clone)]
struct PriorState {
    last_trigger: Option<Instant>,
    last_fingerprint: Option<FeatureFingerprint>,
    consecutive: u32,
}

/// Proof of a committed trigger; needed to roll it back.
#[derive(Debug)]
pub struct CycleTicket {
    pub cycle_id: u64,
    prior: PriorState,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GateStats {
    pub evaluated: u64,
    pub anomalous: u64,
    pub triggers: u64,
    pub rollbacks: u64,
    pub completions: u64,
}

#[derive(Debug)]
pub struct AnomalyGate {
    window: SlidingWindow,
    consecutive: u32,
    last_trigger: Option<Instant>,
    last_fingerprint: Option<FeatureFingerprint>,
    in_flight: Option<u64>,
    next_cycle: u64,
    stats: GateStats,
}

impl AnomalyGate {
    pub fn new(window_size: usize) -> Self {
        Self {
            window: SlidingWindow::new(window_size),
            consecutive: 0,
            last_trigger: None,
            last_fingerprint: None,
            in_flight: None,
            next_cycle: 1,
            stats: GateStats::default(),
        }
    }

    /// Feed one row and decide. Never blocks.
    pub fn evaluate(
        &mut self,
        row: Arc<AggregatedRow>,
        now: Instant,
        cfg: &RuntimeConfig,
    ) -> GateOutcome {
        if self.window.capacity() != cfg.window_size {
            self.window.resize(cfg.window_size);
        }
        let anomalous = row.is_anomaly;
        self.window.push(row.clone());
        self.stats.evaluated += 1;

        if !anomalous {
            self.consecutive = 0;
            return GateOutcome::Refused(TriggerDecision::refused(TriggerReason::NotAnomalous, None));
        }
        self.consecutive = self.consecutive.saturating_add(1);
        self.stats.anomalous += 1;

        if self.consecutive < cfg.required_consecutive {
            return GateOutcome::Refused(TriggerDecision::refused(
                TriggerReason::AwaitingConsecutive,
                format!("{}/{} consecutive anomalies", self.consecutive, cfg.required_consecutive),
            ));
        }

        let min_context = cfg.effective_min_context();
        if self.window.len() < min_context {
            return GateOutcome::Refused(TriggerDecision::refused(
                TriggerReason::InsufficientContext,
                format!("window has {}/{} rows", self.window.len(), min_context),
            ));
        }

        if let Some(cycle) = self.in_flight {
            return GateOutcome::Refused(TriggerDecision::refused(
                TriggerReason::AlreadyInFlight,
                format!("analysis cycle {cycle} still running"),
            ));
        }

        let top = top_contributors(&self.window, cfg.top_k);
        let fingerprint = FeatureFingerprint::from_contributions(&top);

        let reason = match (self.last_trigger, &self.last_fingerprint) {
            (Some(last), Some(prev)) => {
                let elapsed = now.saturating_duration_since(last);
                let similarity = fingerprint.similarity(prev);
                let diverged = similarity < cfg.divergence_threshold;

                if elapsed >= cfg.min_interval() {
                    if diverged {
                        TriggerReason::StateChanged
                    } else {
                        TriggerReason::IntervalElapsed
                    }
                } else if diverged && elapsed >= cfg.divergence_cooldown() {
                    TriggerReason::StateChanged
                } else {
                    let mut decision = TriggerDecision::refused(
                        TriggerReason::RateLimited,
                        format!(
                            "{:.1}s since last trigger (min {}s), similarity {:.2}",
                            elapsed.as_secs_f64(),
                            cfg.min_interval_secs,
                            similarity
                        ),
                    );
                    decision.top_features = top;
                    return GateOutcome::Refused(decision);
                }
            }
            _ => TriggerReason::FirstDetection,
        };

        GateOutcome::Eligible(TriggerCandidate {
            reason,
            row,
            top_features: top,
            fingerprint,
            detected_at: now,
        })
    }

    /// Mark the candidate as dispatched: set in-flight, record time and
    /// signature, reset the counter.
    pub fn commit(&mut self, candidate: &TriggerCandidate) -> CycleTicket {
        let prior = PriorState {
            last_trigger: self.last_trigger,
            last_fingerprint: self.last_fingerprint.clone(),
            consecutive: self.consecutive,
        };
        let cycle_id = self.next_cycle;
        self.next_cycle += 1;

        self.in_flight = Some(cycle_id);
        self.last_trigger = Some(candidate.detected_at);
        self.last_fingerprint = Some(candidate.fingerprint.clone());
        self.consecutive = 0;
        self.stats.triggers += 1;

        info!(
            cycle_id,
            reason = %candidate.reason,
            sequence = candidate.row.sequence_index,
            signature = %candidate.fingerprint.digest(),
            "Analysis trigger committed"
        );
        CycleTicket { cycle_id, prior }
    }

    /// Undo a commit whose hand-off could not be scheduled.
    pub fn rollback(&mut self, ticket: CycleTicket) {
        if self.in_flight != Some(ticket.cycle_id) {
            return;
        }
        self.in_flight = None;
        self.last_trigger = ticket.prior.last_trigger;
        self.last_fingerprint = ticket.prior.last_fingerprint;
        self.consecutive = ticket.prior.consecutive;
        self.stats.triggers = self.stats.triggers.saturating_sub(1);
        self.stats.rollbacks += 1;
    }

    /// Clear in-flight for `cycle_id`. Stale ids are ignored.
    pub fn complete(&mut self, cycle_id: u64) -> bool {
        if self.in_flight == Some(cycle_id) {
            self.in_flight = None;
            self.stats.completions += 1;
            true
        } else {
            debug!(cycle_id, current = ?self.in_flight, "Ignoring stale completion");
            false
        }
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }

    pub fn window(&self) -> &SlidingWindow {
        &self.window
    }

    pub fn resize_window(&mut self, capacity: usize) {
        self.window.resize(capacity);
    }

    /// Current top contributors without touching any state.
    pub fn preview(&self, k: usize) -> Vec<FeatureContribution> {
        top_contributors(&self.window, k)
    }

    pub fn stats(&self) -> &GateStats {
        &self.stats
    }
}
