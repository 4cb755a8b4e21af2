//! Ingest Actor - single owner of the coordinator
//!
//! Rows from every producer (HTTP, file replay, stdin, synthetic) funnel
//! through one task, so rows enter the gate in arrival order and gate state has
//! exactly one writer. Analysis completions come back on their own channel and
//! are handled before new rows.

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::coordinator::{FeaturePreview, IngestAck, IngestCoordinator, IngestMetrics};
use crate::types::{IngestError, RawRow};

// ============================================================================
// Commands
// ============================================================================

enum IngestCommand {
    Ingest {
        row: RawRow,
        response_tx: oneshot::Sender<Result<IngestAck, IngestError>>,
    },
    Preview {
        response_tx: oneshot::Sender<FeaturePreview>,
    },
    Metrics {
        response_tx: oneshot::Sender<IngestMetrics>,
    },
    /// Apply the latest runtime config now instead of on the next row.
    Reconfigure,
}

// ============================================================================
// Actor Handle
// ============================================================================

#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<IngestCommand>,
}

impl IngestHandle {
    pub async fn ingest(&self, row: RawRow) -> Result<IngestAck, IngestError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Ingest { row, response_tx })
            .await
            .map_err(|_| IngestError::Unavailable)?;
        response_rx.await.map_err(|_| IngestError::Unavailable)?
    }

    pub async fn preview(&self) -> Result<FeaturePreview, IngestError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Preview { response_tx })
            .await
            .map_err(|_| IngestError::Unavailable)?;
        response_rx.await.map_err(|_| IngestError::Unavailable)
    }

    pub async fn metrics(&self) -> Result<IngestMetrics, IngestError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(IngestCommand::Metrics { response_tx })
            .await
            .map_err(|_| IngestError::Unavailable)?;
        response_rx.await.map_err(|_| IngestError::Unavailable)
    }

    pub async fn reconfigure(&self) -> Result<(), IngestError> {
        self.tx
            .send(IngestCommand::Reconfigure)
            .await
            .map_err(|_| IngestError::Unavailable)
    }
}

// ============================================================================
// Ingest Actor
// ============================================================================

pub struct IngestActor {
    coordinator: IngestCoordinator,
    rx: mpsc::Receiver<IngestCommand>,
    completions: mpsc::UnboundedReceiver<u64>,
}

impl IngestActor {
    /// `completions` is the receiving end of the channel the analysis
    /// dispatcher reports finished cycles on.
    pub fn new(
        coordinator: IngestCoordinator,
        completions: mpsc::UnboundedReceiver<u64>,
        queue: usize,
    ) -> (Self, IngestHandle) {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let actor = Self {
            coordinator,
            rx,
            completions,
        };
        (actor, IngestHandle { tx })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        info!("[IngestActor] Started");
        let mut rows: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("[IngestActor] Shutdown signal received");
                    break;
                }
                Some(cycle_id) = self.completions.recv() => {
                    if self.coordinator.complete(cycle_id) {
                        debug!(cycle_id, "[IngestActor] Analysis cycle complete, gate reopened");
                    }
                }
                cmd = self.rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("[IngestActor] All handles dropped");
                        break;
                    };
                    match cmd {
                        IngestCommand::Ingest { row, response_tx } => {
                            rows += 1;
                            let ack = self.coordinator.ingest(&row, Instant::now());
                            let _ = response_tx.send(ack);
                        }
                        IngestCommand::Preview { response_tx } => {
                            let _ = response_tx.send(self.coordinator.preview());
                        }
                        IngestCommand::Metrics { response_tx } => {
                            let _ = response_tx.send(self.coordinator.metrics());
                        }
                        IngestCommand::Reconfigure => {
                            self.coordinator.sync_runtime();
                        }
                    }
                }
            }
        }

        info!(rows, "[IngestActor] Stopped");
    }
}
