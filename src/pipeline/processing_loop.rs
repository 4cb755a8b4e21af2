//! Unified row processing loop shared across all input sources.
//!
//! Pulls rows from any [`RowSource`] and feeds them through the ingest actor,
//! the same path HTTP ingestion takes. Stops on cancellation, end of data,
//! an unrecoverable source error, or (optionally) when the premium session
//! expires.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::actor::IngestHandle;
use super::coordinator::IngestAck;
use super::source::{RowEvent, RowSource};
use crate::config::defaults::PROGRESS_EVERY;
use crate::session::{ShutdownNotice, ShutdownReason};
use crate::types::IngestError;

#[derive(Debug, Clone, Default, Serialize)]
pub struct LoopStats {
    pub rows_read: u64,
    pub rows_processed: u64,
    pub rows_rejected: u64,
    pub triggers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Cancelled,
    Eof,
    SourceError,
    SessionExpired,
    IngestUnavailable,
}

pub struct ProcessingLoop {
    ingest: IngestHandle,
    cancel_token: CancellationToken,
    shutdown_rx: Option<broadcast::Receiver<ShutdownNotice>>,
}

impl ProcessingLoop {
    pub fn new(ingest: IngestHandle, cancel_token: CancellationToken) -> Self {
        Self {
            ingest,
            cancel_token,
            shutdown_rx: None,
        }
    }

    /// Stop reading when the premium session expires.
    pub fn stop_on_session_expiry(mut self, rx: broadcast::Receiver<ShutdownNotice>) -> Self {
        self.shutdown_rx = Some(rx);
        self
    }

    /// Run until the source is exhausted or the loop is stopped.
    pub async fn run<S: RowSource + ?Sized>(mut self, source: &mut S) -> (LoopStats, StopReason) {
        let mut stats = LoopStats::default();
        info!("📊 Processing rows from {}...", source.source_name());
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        let reason = loop {
            let event = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("[RowProcessor] Shutdown signal received");
                    break StopReason::Cancelled;
                }
                notice = recv_notice(&mut self.shutdown_rx) => {
                    if notice.reason == ShutdownReason::Expired {
                        warn!("[RowProcessor] Premium session expired, stopping data source");
                        break StopReason::SessionExpired;
                    }
                    continue;
                }
                result = source.next_row() => match result {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!("[RowProcessor] Source error: {}", e);
                        break StopReason::SourceError;
                    }
                },
            };

            let row = match event {
                RowEvent::Row(row) => row,
                RowEvent::Eof => {
                    info!("[RowProcessor] Source reached end ({} rows read)", stats.rows_read);
                    break StopReason::Eof;
                }
            };
            stats.rows_read += 1;

            match self.ingest.ingest(row).await {
                Ok(IngestAck::Processed { decision, sequence_index, .. }) => {
                    stats.rows_processed += 1;
                    if decision.eligible {
                        stats.triggers += 1;
                        info!(
                            "🚨 Trigger #{} at row {}: {}",
                            stats.triggers, sequence_index, decision.reason
                        );
                    }
                }
                Ok(IngestAck::Aggregating { .. }) => {}
                Err(IngestError::Unavailable) => {
                    warn!("[RowProcessor] Ingest actor unavailable, stopping");
                    break StopReason::IngestUnavailable;
                }
                Err(e) => {
                    stats.rows_rejected += 1;
                    warn!("[RowProcessor] Row {} rejected: {}", stats.rows_read, e);
                }
            }

            if stats.rows_read % PROGRESS_EVERY == 0 {
                info!(
                    "📈 Progress: {} rows | Aggregated: {} | Rejected: {} | Triggers: {}",
                    stats.rows_read, stats.rows_processed, stats.rows_rejected, stats.triggers
                );
            }
        };

        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        info!("📊 SOURCE STATISTICS ({})", source.source_name());
        info!("   Rows Read:        {}", stats.rows_read);
        info!("   Rows Aggregated:  {}", stats.rows_processed);
        info!("   Rows Rejected:    {}", stats.rows_rejected);
        info!("   Triggers:         {}", stats.triggers);
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

        (stats, reason)
    }
}

/// Next shutdown notice; pends forever without a receiver or once closed.
async fn recv_notice(rx: &mut Option<broadcast::Receiver<ShutdownNotice>>) -> ShutdownNotice {
    loop {
        let Some(inner) = rx.as_mut() else {
            return std::future::pending().await;
        };
        match inner.recv().await {
            Ok(notice) => return notice,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => *rx = None,
        }
    }
}
