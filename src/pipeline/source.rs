//! Row source abstraction for process data ingestion.
//!
//! Provides a unified trait for reading raw rows from different sources:
//! CSV files (replay), stdin (JSON lines), and a synthetic fault generator.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::baseline::BaselineStats;
use crate::types::{raw_row_from_json, FeatureSchema, RawRow};

/// Events produced by a row source.
#[derive(Debug)]
pub enum RowEvent {
    Row(RawRow),
    /// Source exhausted.
    Eof,
}

/// Where raw rows come from.
///
/// Implementations handle parsing and pacing internally. The processing loop
/// calls [`next_row`](RowSource::next_row) in a `select!` with cancellation.
#[async_trait]
pub trait RowSource: Send + 'static {
    /// `Err` is unrecoverable; malformed input is skipped, not returned.
    async fn next_row(&mut self) -> Result<RowEvent>;

    fn source_name(&self) -> &str;
}

/// `rows_per_sec <= 0` means no pacing.
pub fn pacing(rows_per_sec: f64) -> Duration {
    if rows_per_sec > 0.0 && rows_per_sec.is_finite() {
        Duration::from_secs_f64(1.0 / rows_per_sec)
    } else {
        Duration::ZERO
    }
}

// ============================================================================
// CSV Source (file replay)
// ============================================================================

/// Replays a CSV file with a header row. Non-numeric cells are left out of
/// the row, so label columns like `fault` or `time` strings are harmless.
pub struct CsvSource {
    rows: std::vec::IntoIter<RawRow>,
    delay: Duration,
    yielded_first: bool,
}

impl CsvSource {
    pub fn new(rows: Vec<RawRow>, delay: Duration) -> Self {
        Self {
            rows: rows.into_iter(),
            delay,
            yielded_first: false,
        }
    }

    pub fn open(path: &Path, delay: Duration) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read CSV {}", path.display()))?;
        let rows = Self::parse(&contents)
            .with_context(|| format!("Failed to parse CSV {}", path.display()))?;
        tracing::info!(path = %path.display(), rows = rows.len(), "CSV loaded for replay");
        Ok(Self::new(rows, delay))
    }

    pub fn parse(contents: &str) -> Result<Vec<RawRow>> {
        let mut lines = contents.lines().filter(|l| !l.trim().is_empty());
        let header: Vec<String> = lines
            .next()
            .context("CSV is empty")?
            .split(',')
            .map(|h| h.trim().trim_matches('"').to_string())
            .collect();

        let rows = lines
            .map(|line| {
                header
                    .iter()
                    .zip(line.split(','))
                    .filter_map(|(name, cell)| {
                        let value: f64 = cell.trim().trim_matches('"').parse().ok()?;
                        value.is_finite().then(|| (name.clone(), value))
                    })
                    .collect()
            })
            .collect();
        Ok(rows)
    }
}

#[async_trait]
impl RowSource for CsvSource {
    async fn next_row(&mut self) -> Result<RowEvent> {
        if self.yielded_first && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.rows.next() {
            Some(row) => {
                self.yielded_first = true;
                Ok(RowEvent::Row(row))
            }
            None => Ok(RowEvent::Eof),
        }
    }

    fn source_name(&self) -> &str {
        "CSV"
    }
}

// ============================================================================
// Stdin Source (JSON lines)
// ============================================================================

/// Reads one JSON object per line from stdin, either a flat
/// `{"feature": value, ...}` map or `{"data_point": {...}}`.
///
/// `python tep_simulator.py | ./fault-explainer --stdin`
pub struct StdinSource {
    reader: tokio::io::BufReader<tokio::io::Stdin>,
    line_buffer: String,
}

impl StdinSource {
    pub fn new() -> Self {
        Self {
            reader: tokio::io::BufReader::new(tokio::io::stdin()),
            line_buffer: String::with_capacity(2048),
        }
    }
}

impl Default for StdinSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse one JSON line into a raw row.
pub fn parse_json_line(line: &str) -> Result<RawRow> {
    let value: serde_json::Value = serde_json::from_str(line)?;
    let object = match value.get("data_point") {
        Some(inner) => inner.as_object(),
        None => value.as_object(),
    };
    object
        .map(raw_row_from_json)
        .context("expected a JSON object")
}

#[async_trait]
impl RowSource for StdinSource {
    async fn next_row(&mut self) -> Result<RowEvent> {
        use tokio::io::AsyncBufReadExt;
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(RowEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            match parse_json_line(line) {
                Ok(row) => return Ok(RowEvent::Row(row)),
                Err(e) => {
                    tracing::warn!("[StdinSource] Failed to parse row: {}", e);
                }
            }
        }
    }

    fn source_name(&self) -> &str {
        "stdin"
    }
}

// ============================================================================
// Synthetic Source (baseline noise + injected fault)
// ============================================================================

/// Gaussian noise around the baseline means; after `fault_after` rows the
/// first `fault_features` schema features drift away at one std per row.
pub struct SyntheticSource {
    features: Vec<(String, f64, Normal<f64>)>,
    fault_features: usize,
    fault_after: u64,
    produced: u64,
    limit: Option<u64>,
    delay: Duration,
    rng: StdRng,
}

impl SyntheticSource {
    pub fn new(
        schema: &FeatureSchema,
        baseline: Arc<BaselineStats>,
        fault_after: u64,
        delay: Duration,
        seed: u64,
    ) -> Result<Self> {
        let features = schema
            .names()
            .iter()
            .map(|name| {
                let stats = baseline
                    .get(name)
                    .with_context(|| format!("no baseline for '{name}'"))?;
                let normal = Normal::new(stats.mean, stats.std)
                    .with_context(|| format!("invalid baseline for '{name}'"))?;
                Ok((name.clone(), stats.std, normal))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            fault_features: features.len().min(3),
            features,
            fault_after,
            produced: 0,
            limit: None,
            delay,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    /// Stop with `Eof` after `rows` rows.
    pub fn with_limit(mut self, rows: u64) -> Self {
        self.limit = Some(rows);
        self
    }

    fn generate(&mut self) -> RawRow {
        let drift_rows = self.produced.saturating_sub(self.fault_after) as f64;
        let mut row = RawRow::new();
        for (i, (name, std, normal)) in self.features.iter().enumerate() {
            let mut value = normal.sample(&mut self.rng);
            if i < self.fault_features {
                value += drift_rows * std;
            }
            row.insert(name.clone(), value);
        }
        row
    }
}

#[async_trait]
impl RowSource for SyntheticSource {
    async fn next_row(&mut self) -> Result<RowEvent> {
        if self.limit.is_some_and(|limit| self.produced >= limit) {
            return Ok(RowEvent::Eof);
        }
        if self.produced > 0 && !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let row = self.generate();
        self.produced += 1;
        if self.produced == self.fault_after + 1 {
            tracing::info!(row = self.produced, "[SyntheticSource] Injecting fault");
        }
        Ok(RowEvent::Row(row))
    }

    fn source_name(&self) -> &str {
        "synthetic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_csv_parse_skips_non_numeric() {
        let rows = CsvSource::parse("time,\"A Feed\",label\n0.1,3.5,normal\n0.2,x,fault\n").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get("A Feed"), Some(&3.5));
        assert!(!rows[0].contains_key("label"));
        assert!(!rows[1].contains_key("A Feed"));
    }

    #[tokio::test]
    async fn test_csv_source_reaches_eof() {
        let mut source = CsvSource::new(CsvSource::parse("a\n1\n2\n").unwrap(), Duration::ZERO);
        assert!(matches!(source.next_row().await.unwrap(), RowEvent::Row(_)));
        assert!(matches!(source.next_row().await.unwrap(), RowEvent::Row(_)));
        assert!(matches!(source.next_row().await.unwrap(), RowEvent::Eof));
    }

    #[test]
    fn test_json_line_shapes() {
        let flat = parse_json_line(r#"{"a": 1.0, "b": "2.5"}"#).unwrap();
        assert_eq!(flat.get("b"), Some(&2.5));
        let wrapped = parse_json_line(r#"{"data_point": {"a": 4}}"#).unwrap();
        assert_eq!(wrapped.get("a"), Some(&4.0));
        assert!(parse_json_line("[1, 2]").is_err());
        assert!(parse_json_line("not json").is_err());
    }

    #[tokio::test]
    async fn test_synthetic_drifts_after_fault() {
        let schema = FeatureSchema::new(["a", "b", "c", "d"]);
        let baseline = Arc::new(BaselineStats::from_pairs([
            ("a", 0.0, 1.0),
            ("b", 0.0, 1.0),
            ("c", 0.0, 1.0),
            ("d", 0.0, 1.0),
        ]));
        let mut source = SyntheticSource::new(&schema, baseline, 5, Duration::ZERO, 7)
            .unwrap()
            .with_limit(40);

        let mut last = RawRow::new();
        let mut count = 0;
        while let RowEvent::Row(row) = source.next_row().await.unwrap() {
            last = row;
            count += 1;
        }
        assert_eq!(count, 40);
        assert!(last["a"] > 20.0, "faulted feature should drift: {}", last["a"]);
        assert!(last["d"].abs() < 10.0, "healthy feature stays near mean");
    }

    #[test]
    fn test_pacing() {
        assert_eq!(pacing(0.0), Duration::ZERO);
        assert_eq!(pacing(2.0), Duration::from_millis(500));
    }
}
