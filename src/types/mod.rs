//! Shared data structures for the fault-explanation pipeline
//!
//! - Ingestion: `RawRow`, `SensorRow`, `FeatureSchema`
//! - Scoring: `DetectorVerdict`, `AggregatedRow`
//! - Gating: `TriggerDecision`, `TriggerReason`, `FeatureContribution`
//! - Analysis: `BackendResult`, `AnalysisBundle`

mod analysis;
mod sensor;
mod trigger;

pub use analysis::*;
pub use sensor::*;
pub use trigger::*;
