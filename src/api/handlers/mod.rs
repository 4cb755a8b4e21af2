//! API route handlers
//!
//! - Ingestion and the live SSE stream
//! - Runtime configuration
//! - Analysis history and feature preview
//! - Backend toggles, direct queries and display control
//! - Premium session control
//! - Health, status and metrics

mod analysis;
mod backends;
mod config;
mod ingest;
mod session;
mod status;
mod stream;

pub use analysis::*;
pub use backends::*;
pub use config::*;
pub use ingest::*;
pub use session::*;
pub use status::*;
pub use stream::*;

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::analysis::{LifecycleSet, PromptBuilder};
use crate::broadcast::StreamBroadcaster;
use crate::config::RuntimeConfigHandle;
use crate::llm::BackendRegistry;
use crate::pipeline::IngestHandle;
use crate::session::PremiumSession;
use crate::storage::{HistoryRecorder, MarkdownJournal};

// ============================================================================
// API State
// ============================================================================

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub ingest: IngestHandle,
    pub broadcaster: StreamBroadcaster,
    pub runtime: RuntimeConfigHandle,
    pub history: Arc<dyn HistoryRecorder>,
    /// Direct queries are logged here when a journal directory is configured.
    pub journal: Option<MarkdownJournal>,
    pub registry: BackendRegistry,
    pub lifecycles: LifecycleSet,
    pub session: PremiumSession,
    pub prompt: PromptBuilder,
    /// SSE keep-alive interval.
    pub keep_alive: Duration,
    pub started_at: Instant,
}
