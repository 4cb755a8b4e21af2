//! Baseline Statistics & Reference Detector
//!
//! Normal-operation statistics are loaded once at startup from a
//! `feature,mean,std` CSV. They serve two purposes:
//!
//! - the "Normal" column of the fault-vs-normal comparison text
//! - the reference [`BaselineDetector`], which scores a row as the sum of
//!   squared z-scores and flags it when that exceeds the chi-squared
//!   quantile at significance `alpha`
//!
//! ## Usage
//!
//! ```ignore
//! let baseline = BaselineStats::load_csv(Path::new("stats/features_mean_std.csv"))?;
//! let detector = BaselineDetector::new(Arc::new(baseline), &schema, 0.01)?;
//! let verdict = detector.score(&row)?;
//! ```
//!
//! Any other scorer (PCA T², autoencoder, ...) plugs in through [`Detector`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF};
use thiserror::Error;
use tracing::info;

use crate::types::{DetectorVerdict, FeatureSchema, SensorRow};

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DetectorError {
    #[error("failed to read baseline file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("baseline line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("baseline has no statistics for: {}", .0.join(", "))]
    MissingFeatures(Vec<String>),

    #[error("baseline std for '{0}' must be positive")]
    InvalidStd(String),

    #[error("cannot compute detection threshold: {0}")]
    Threshold(String),

    #[error("row is missing feature '{0}'")]
    RowMissing(String),
}

// ============================================================================
// Baseline Statistics
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureStats {
    pub mean: f64,
    pub std: f64,
}

impl FeatureStats {
    /// Z-score of `value`, or `None` when the spread is degenerate.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        (self.std > 0.0).then(|| (value - self.mean) / self.std)
    }
}

/// Per-feature normal-operation mean and standard deviation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    stats: BTreeMap<String, FeatureStats>,
}

impl BaselineStats {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, f64, f64)>,
        S: Into<String>,
    {
        Self {
            stats: pairs
                .into_iter()
                .map(|(name, mean, std)| (name.into(), FeatureStats { mean, std }))
                .collect(),
        }
    }

    /// Load a `feature,mean,std` CSV (header row required).
    ///
    /// Feature names may be quoted; anything after the third column is ignored.
    pub fn load_csv(path: &Path) -> Result<Self, DetectorError> {
        let contents = std::fs::read_to_string(path).map_err(|source| DetectorError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let stats = Self::parse_csv(&contents)?;
        info!(path = %path.display(), features = stats.len(), "Loaded baseline statistics");
        Ok(stats)
    }

    pub fn parse_csv(contents: &str) -> Result<Self, DetectorError> {
        let mut stats = BTreeMap::new();
        for (idx, line) in contents.lines().enumerate().skip(1) {
            if line.trim().is_empty() {
                continue;
            }
            // Names may contain commas inside quotes; numbers never do.
            let mut parts = line.rsplitn(3, ',');
            let (std, mean, name) = match (parts.next(), parts.next(), parts.next()) {
                (Some(s), Some(m), Some(n)) => (s, m, n),
                _ => {
                    return Err(DetectorError::Parse {
                        line: idx + 1,
                        reason: "expected feature,mean,std".to_string(),
                    })
                }
            };
            let parse = |field: &str, what: &str| {
                field.trim().parse::<f64>().map_err(|e| DetectorError::Parse {
                    line: idx + 1,
                    reason: format!("invalid {what} '{}': {e}", field.trim()),
                })
            };
            let name = name.trim().trim_matches('"').to_string();
            stats.insert(
                name,
                FeatureStats {
                    mean: parse(mean, "mean")?,
                    std: parse(std, "std")?,
                },
            );
        }
        Ok(Self { stats })
    }

    pub fn get(&self, feature: &str) -> Option<&FeatureStats> {
        self.stats.get(feature)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    /// Schema features with no baseline entry.
    pub fn missing_from(&self, schema: &FeatureSchema) -> Vec<String> {
        schema
            .names()
            .iter()
            .filter(|n| !self.stats.contains_key(*n))
            .cloned()
            .collect()
    }
}

// ============================================================================
// Detector Contract
// ============================================================================

/// Anomaly scorer consulted once per aggregated row. Must be cheap.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    fn score(&self, row: &SensorRow) -> Result<DetectorVerdict, DetectorError>;
}

/// Sum-of-squared-z-scores detector with a chi-squared threshold.
#[derive(Debug, Clone)]
pub struct BaselineDetector {
    baseline: Arc<BaselineStats>,
    features: Vec<String>,
    threshold: f64,
}

impl BaselineDetector {
    /// Fails when the baseline does not cover the schema, a std is not
    /// positive, or the threshold cannot be computed. All startup-fatal.
    pub fn new(
        baseline: Arc<BaselineStats>,
        schema: &FeatureSchema,
        alpha: f64,
    ) -> Result<Self, DetectorError> {
        let missing = baseline.missing_from(schema);
        if !missing.is_empty() {
            return Err(DetectorError::MissingFeatures(missing));
        }
        for name in schema.names() {
            if let Some(stats) = baseline.get(name) {
                if stats.std <= 0.0 || !stats.std.is_finite() {
                    return Err(DetectorError::InvalidStd(name.clone()));
                }
            }
        }
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(DetectorError::Threshold(format!("alpha {alpha} outside (0, 1)")));
        }

        let dof = schema.len() as f64;
        let threshold = ChiSquared::new(dof)
            .map_err(|e| DetectorError::Threshold(e.to_string()))?
            .inverse_cdf(1.0 - alpha);

        info!(
            features = schema.len(),
            alpha,
            threshold = %format!("{threshold:.3}"),
            "Baseline detector ready"
        );

        Ok(Self {
            baseline,
            features: schema.names().to_vec(),
            threshold,
        })
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Detector for BaselineDetector {
    fn name(&self) -> &str {
        "baseline-chi2"
    }

    fn score(&self, row: &SensorRow) -> Result<DetectorVerdict, DetectorError> {
        let mut score = 0.0;
        for name in &self.features {
            let value = row
                .get(name)
                .ok_or_else(|| DetectorError::RowMissing(name.clone()))?;
            if let Some(z) = self.baseline.get(name).and_then(|s| s.z_score(*value)) {
                score += z * z;
            }
        }
        Ok(DetectorVerdict {
            score,
            is_anomaly: score > self.threshold,
            threshold: self.threshold,
        })
    }
}
