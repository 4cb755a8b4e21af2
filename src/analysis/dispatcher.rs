//! Analysis Dispatcher
//!
//! Takes an accepted trigger off the ingest path and runs the whole analysis
//! cycle in a spawned task: parallel backend calls, bundle assembly, history,
//! journal, usage counters and the stream announcement. Completion is always
//! reported back to the gate, including when the cycle task panics or is
//! cancelled, through a drop guard.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::lifecycle::LifecycleSet;
use super::orchestrator::dispatch;
use super::prompt::PromptBuilder;
use crate::broadcast::StreamBroadcaster;
use crate::llm::BackendRegistry;
use crate::storage::{HistoryRecorder, MarkdownJournal};
use crate::types::{AnalysisBundle, FeatureContribution, TriggerReason};

/// One accepted trigger, ready to analyse.
#[derive(Debug, Clone)]
pub struct AnalysisJob {
    /// Gate cycle this job belongs to; echoed back on completion.
    pub cycle_id: u64,
    pub sequence_index: u64,
    pub reason: TriggerReason,
    pub top_features: Vec<FeatureContribution>,
    pub comparison: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("analysis dispatcher is shutting down")]
    ShuttingDown,

    #[error("no async runtime available to run analysis")]
    NoRuntime,
}

/// Hand-off point between the gate and whatever runs analysis.
///
/// `schedule` must not block; an `Err` means the job will never run and the
/// gate rolls the trigger back.
pub trait TriggerSink: Send + Sync {
    fn schedule(&self, job: AnalysisJob) -> Result<(), ScheduleError>;
}

/// Sends the cycle id to the gate exactly once, when dropped.
struct CompletionGuard {
    cycle_id: u64,
    tx: mpsc::UnboundedSender<u64>,
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        if self.tx.send(self.cycle_id).is_err() {
            warn!(cycle_id = self.cycle_id, "Ingest actor gone, completion not delivered");
        }
    }
}

#[derive(Clone)]
pub struct AnalysisDispatcher {
    registry: BackendRegistry,
    history: Arc<dyn HistoryRecorder>,
    broadcaster: StreamBroadcaster,
    lifecycles: LifecycleSet,
    prompt: PromptBuilder,
    journal: Option<MarkdownJournal>,
    completions: mpsc::UnboundedSender<u64>,
    cancel: CancellationToken,
}

impl AnalysisDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: BackendRegistry,
        history: Arc<dyn HistoryRecorder>,
        broadcaster: StreamBroadcaster,
        lifecycles: LifecycleSet,
        prompt: PromptBuilder,
        journal: Option<MarkdownJournal>,
        completions: mpsc::UnboundedSender<u64>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            registry,
            history,
            broadcaster,
            lifecycles,
            prompt,
            journal,
            completions,
            cancel,
        }
    }

    pub fn prompt(&self) -> &PromptBuilder {
        &self.prompt
    }

    /// Run one cycle to completion. Returns the recorded bundle.
    pub async fn run_cycle(&self, job: AnalysisJob) -> AnalysisBundle {
        let backends = self.registry.active();
        if backends.is_empty() {
            warn!(cycle_id = job.cycle_id, "No active backends, recording empty analysis");
        }
        let request = Arc::new(self.prompt.request(&job.comparison, None));

        info!(
            cycle_id = job.cycle_id,
            sequence_index = job.sequence_index,
            reason = %job.reason,
            backends = backends.len(),
            "🔍 Analysis cycle started"
        );

        let results = dispatch(backends, request).await;

        let bundle = AnalysisBundle {
            id: self.history.issue_id(),
            timestamp: Utc::now(),
            sequence_index: job.sequence_index,
            trigger_reason: job.reason,
            feature_comparison: job.comparison,
            top_features: job.top_features,
            results,
        };

        self.persist(&bundle).await;

        self.registry.record(bundle.results.values());
        self.lifecycles
            .record_all(bundle.results.values().filter(|r| r.is_success()));
        self.broadcaster.publish_analysis(bundle.summary());

        if bundle.all_failed() {
            warn!(bundle_id = bundle.id, "All backends failed for this cycle");
        } else {
            info!(
                bundle_id = bundle.id,
                succeeded = bundle.succeeded(),
                total = bundle.results.len(),
                partial = bundle.is_partial_failure(),
                "✅ Analysis cycle complete"
            );
        }
        bundle
    }
}

impl AnalysisDispatcher {
    /// History and journal writes go to sled and the filesystem, so they run
    /// on the blocking pool.
    async fn persist(&self, bundle: &AnalysisBundle) {
        let history = Arc::clone(&self.history);
        let journal = self.journal.clone();
        let stored = bundle.clone();
        let written = tokio::task::spawn_blocking(move || {
            let recorded = history.append(&stored);
            let journaled = journal.map(|j| j.append(&stored));
            (recorded, journaled)
        })
        .await;

        match written {
            Ok((recorded, journaled)) => {
                if let Err(e) = recorded {
                    error!(bundle_id = bundle.id, error = %e, "Failed to record analysis bundle");
                }
                if let Some(Err(e)) = journaled {
                    warn!(bundle_id = bundle.id, error = %e, "Failed to write Markdown journal");
                }
            }
            Err(e) => error!(bundle_id = bundle.id, error = %e, "Bundle persistence task failed"),
        }
    }
}

impl TriggerSink for AnalysisDispatcher {
    fn schedule(&self, job: AnalysisJob) -> Result<(), ScheduleError> {
        if self.cancel.is_cancelled() {
            return Err(ScheduleError::ShuttingDown);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ScheduleError::NoRuntime)?;

        let guard = CompletionGuard {
            cycle_id: job.cycle_id,
            tx: self.completions.clone(),
        };
        let dispatcher = self.clone();
        let cancel = self.cancel.clone();
        let cycle_id = job.cycle_id;
        runtime.spawn(async move {
            let _guard = guard;
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(cycle_id, "Analysis cycle abandoned on shutdown");
                }
                _ = dispatcher.run_cycle(job) => {}
            }
        });
        Ok(())
    }
}
