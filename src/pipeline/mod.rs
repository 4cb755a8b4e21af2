//! Ingestion Pipeline
//!
//! ```text
//! raw row ─▶ SampleAggregator ─▶ Detector ─▶ StreamBroadcaster
//!                                    │
//!                                    ▼
//!                              AnomalyGate ──eligible──▶ TriggerSink (analysis)
//! ```
//!
//! All of it runs inside the ingest actor; analysis runs elsewhere and only
//! reports completion back.

mod actor;
mod aggregator;
mod coordinator;
pub mod features;
mod gate;
pub mod processing_loop;
pub mod source;
mod window;

pub use actor::{IngestActor, IngestHandle};
pub use aggregator::{AggregateOutcome, SampleAggregator};
pub use coordinator::{FeaturePreview, IngestAck, IngestCoordinator, IngestMetrics};
pub use gate::{AnomalyGate, CycleTicket, GateOutcome, GateStats, TriggerCandidate};
pub use processing_loop::{LoopStats, ProcessingLoop, StopReason};
pub use source::{CsvSource, RowEvent, RowSource, StdinSource, SyntheticSource};
pub use window::SlidingWindow;
