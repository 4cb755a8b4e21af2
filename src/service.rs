//! Service assembly
//!
//! Wires the detector, backends and history into the running actors and
//! returns the handles the HTTP layer and the row source need. Shared by the
//! binary and the integration tests.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::analysis::{AnalysisDispatcher, LifecycleSet, PromptBuilder};
use crate::api::ApiState;
use crate::baseline::{BaselineStats, Detector};
use crate::broadcast::StreamBroadcaster;
use crate::config::{defaults, RuntimeConfigHandle, ServiceConfig};
use crate::llm::{AnalysisBackend, BackendRegistry};
use crate::pipeline::{IngestActor, IngestCoordinator, IngestHandle, ProcessingLoop};
use crate::session::PremiumSession;
use crate::storage::{HistoryRecorder, MarkdownJournal};
use crate::types::FeatureSchema;

/// Everything startup has to resolve before the actors can run.
pub struct ServiceParts {
    pub config: ServiceConfig,
    pub detector: Arc<dyn Detector>,
    /// Normal-operation statistics for the comparison text, when known.
    pub baseline: Option<Arc<BaselineStats>>,
    pub backends: Vec<Arc<dyn AnalysisBackend>>,
    pub history: Arc<dyn HistoryRecorder>,
}

/// Handles to a running service.
#[derive(Clone)]
pub struct Service {
    pub state: ApiState,
    pub ingest: IngestHandle,
    pub runtime: RuntimeConfigHandle,
    pub broadcaster: StreamBroadcaster,
    pub session: PremiumSession,
    pub stop_source_on_shutdown: bool,
}

impl Service {
    /// Spawn the ingest actor, one lifecycle actor per backend, the heartbeat
    /// and the session monitor onto `tasks`. Must be called inside a runtime.
    pub fn start(
        parts: ServiceParts,
        tasks: &mut JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Self {
        let ServiceParts {
            config,
            detector,
            baseline,
            backends,
            history,
        } = parts;

        let schema = FeatureSchema::new(config.features.columns.iter().cloned());
        let runtime = RuntimeConfigHandle::new(config.runtime.clone());
        let broadcaster = StreamBroadcaster::new(config.broadcast.subscriber_queue);
        let registry = BackendRegistry::new(backends.clone());
        let session = PremiumSession::new(registry.clone(), config.session.duration());
        let prompt = PromptBuilder::new(&config.prompt);

        let lifecycles = LifecycleSet::spawn(&backends, tasks, cancel);

        let journal = config.history.markdown_dir.as_ref().map(|dir| {
            info!(dir = %dir.display(), "📝 Markdown journal enabled");
            MarkdownJournal::new(dir)
        });

        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let dispatcher = AnalysisDispatcher::new(
            registry.clone(),
            Arc::clone(&history),
            broadcaster.clone(),
            lifecycles.clone(),
            prompt.clone(),
            journal.clone(),
            completions_tx,
            cancel.clone(),
        );

        let mut coordinator = IngestCoordinator::new(
            schema,
            detector,
            runtime.clone(),
            broadcaster.clone(),
            Arc::new(dispatcher),
        );
        if let Some(baseline) = baseline {
            coordinator = coordinator.with_baseline(baseline);
        }

        let (actor, ingest) = IngestActor::new(coordinator, completions_rx, defaults::INGEST_QUEUE);
        tasks.spawn(actor.run(cancel.clone()));
        tasks.spawn(
            broadcaster
                .clone()
                .run_heartbeat(config.broadcast.heartbeat(), cancel.clone()),
        );
        tasks.spawn(session.clone().run_monitor(cancel.clone()));

        let active: Vec<_> = registry.active().iter().map(|b| b.id().to_string()).collect();
        if active.is_empty() {
            warn!("No backend is active yet; triggers will record empty bundles until one is switched on");
        }
        info!(
            backends = registry.len(),
            active = ?active,
            features = config.features.columns.len(),
            "✓ Service assembled"
        );

        let state = ApiState {
            ingest: ingest.clone(),
            broadcaster: broadcaster.clone(),
            runtime: runtime.clone(),
            history,
            journal,
            registry,
            lifecycles,
            session: session.clone(),
            prompt,
            keep_alive: config.broadcast.heartbeat(),
            started_at: Instant::now(),
        };

        Self {
            state,
            ingest,
            runtime,
            broadcaster,
            session,
            stop_source_on_shutdown: config.session.stop_source_on_shutdown,
        }
    }

    /// Processing loop for a row source, wired to the session when the
    /// source should stop on expiry.
    pub fn processing_loop(&self, cancel: CancellationToken) -> ProcessingLoop {
        let processing_loop = ProcessingLoop::new(self.ingest.clone(), cancel);
        if self.stop_source_on_shutdown {
            processing_loop.stop_on_session_expiry(self.session.subscribe())
        } else {
            processing_loop
        }
    }
}
