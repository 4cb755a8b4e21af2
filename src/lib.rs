//! Fault Explainer: real-time process fault detection and explanation
//!
//! Streams sensor rows through a statistical detector, gates anomalies into
//! analysis cycles, and fans each cycle out to several language-model
//! backends whose answers are kept as a browsable history.
//!
//! ## Architecture
//!
//! - **Pipeline**: aggregation, scoring, sliding window and trigger gate,
//!   driven by a single ingest actor
//! - **Analysis**: concurrent backend dispatch plus per-backend display lifecycles
//! - **Broadcast**: latest rows, analysis announcements and heartbeats to subscribers
//! - **Session**: time-boxed use of hosted backends
//! - **Storage**: analysis history (sled or in-memory) and Markdown journals

pub mod analysis;
pub mod api;
pub mod baseline;
pub mod broadcast;
pub mod config;
pub mod llm;
pub mod pipeline;
pub mod service;
pub mod session;
pub mod storage;
pub mod types;

pub use config::{RuntimeConfig, ServiceConfig};
pub use service::{Service, ServiceParts};
pub use types::{AggregatedRow, AnalysisBundle, BackendResult, RawRow, TriggerDecision};
