//! Sensor data types: raw rows, the feature schema, aggregated rows

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Raw & Projected Rows
// ============================================================================

/// One raw measurement as it arrives from a source or the ingest endpoint.
///
/// May carry keys outside the schema (`time`, `step`, ...); those are dropped
/// during projection.
pub type RawRow = BTreeMap<String, f64>;

/// A schema-complete row: exactly the configured features, nothing else.
pub type SensorRow = BTreeMap<String, f64>;

/// Build a [`RawRow`] from a JSON object, keeping numeric values only.
///
/// Numeric strings (`"1.25"`) are accepted since some simulators emit them.
pub fn raw_row_from_json(map: &serde_json::Map<String, serde_json::Value>) -> RawRow {
    map.iter()
        .filter_map(|(k, v)| {
            let value = match v {
                serde_json::Value::Number(n) => n.as_f64(),
                serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }?;
            value.is_finite().then(|| (k.clone(), value))
        })
        .collect()
}

/// Errors raised while accepting a row into the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("row is missing required features: {}", missing.join(", "))]
    MissingFeature { missing: Vec<String> },

    #[error("detector failed: {0}")]
    Detector(#[from] crate::baseline::DetectorError),

    #[error("ingest pipeline is not running")]
    Unavailable,
}

// ============================================================================
// Feature Schema
// ============================================================================

/// The fixed, ordered list of features every aggregated row carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSchema {
    names: Arc<[String]>,
}

impl FeatureSchema {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = std::collections::BTreeSet::new();
        let names: Vec<String> = names
            .into_iter()
            .map(Into::into)
            .filter(|n| seen.insert(n.clone()))
            .collect();
        Self { names: names.into() }
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Project a raw row onto the schema.
    ///
    /// Fails with [`IngestError::MissingFeature`] listing every absent feature.
    pub fn project(&self, raw: &RawRow) -> Result<SensorRow, IngestError> {
        let mut row = SensorRow::new();
        let mut missing = Vec::new();
        for name in self.names.iter() {
            match raw.get(name) {
                Some(v) => {
                    row.insert(name.clone(), *v);
                }
                None => missing.push(name.clone()),
            }
        }
        if missing.is_empty() {
            Ok(row)
        } else {
            Err(IngestError::MissingFeature { missing })
        }
    }
}

// ============================================================================
// Detector Output & Aggregated Rows
// ============================================================================

/// What the detector says about one aggregated row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DetectorVerdict {
    pub score: f64,
    pub is_anomaly: bool,
    pub threshold: f64,
}

/// One decimated, scored row. Shared as `Arc<AggregatedRow>` and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedRow {
    /// Strictly increasing, starting at 1.
    pub sequence_index: u64,
    pub timestamp: DateTime<Utc>,
    pub features: SensorRow,
    pub anomaly_score: f64,
    pub is_anomaly: bool,
    pub threshold: f64,
}

impl AggregatedRow {
    pub fn new(sequence_index: u64, features: SensorRow, verdict: DetectorVerdict) -> Self {
        Self {
            sequence_index,
            timestamp: Utc::now(),
            features,
            anomaly_score: verdict.score,
            is_anomaly: verdict.is_anomaly,
            threshold: verdict.threshold,
        }
    }

    pub fn feature(&self, name: &str) -> Option<f64> {
        self.features.get(name).copied()
    }
}
