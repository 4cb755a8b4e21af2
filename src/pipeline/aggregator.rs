//! Decimation: N raw rows in, one averaged row out

use crate::types::{FeatureSchema, IngestError, RawRow, SensorRow};

/// Result of submitting one raw row.
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateOutcome {
    /// Still filling the current group.
    Accumulating { have: usize, need: usize },
    /// Group complete; carries the per-feature mean.
    Emitted { row: SensorRow },
}

/// Collapses groups of `N` schema-complete rows into their arithmetic mean.
#[derive(Debug)]
pub struct SampleAggregator {
    schema: FeatureSchema,
    group_size: usize,
    buffer: Vec<SensorRow>,
    emitted: u64,
}

impl SampleAggregator {
    pub fn new(schema: FeatureSchema, group_size: usize) -> Self {
        let group_size = group_size.max(1);
        Self {
            schema,
            group_size,
            buffer: Vec::with_capacity(group_size),
            emitted: 0,
        }
    }

    /// Accept one raw row.
    ///
    /// Rows missing any schema feature are rejected before the buffer is touched.
    pub fn submit(&mut self, raw: &RawRow) -> Result<AggregateOutcome, IngestError> {
        let row = self.schema.project(raw)?;
        self.buffer.push(row);

        if self.buffer.len() < self.group_size {
            return Ok(AggregateOutcome::Accumulating {
                have: self.buffer.len(),
                need: self.group_size,
            });
        }

        let n = self.buffer.len() as f64;
        let mean: SensorRow = self
            .schema
            .names()
            .iter()
            .map(|name| {
                let sum: f64 = self.buffer.iter().map(|r| r[name]).sum();
                (name.clone(), sum / n)
            })
            .collect();

        self.buffer.clear();
        self.emitted += 1;
        Ok(AggregateOutcome::Emitted { row: mean })
    }

    /// Change `N`. Shrinking keeps only the most recent `N - 1` buffered rows
    /// so the next submit completes a group of exactly `N`.
    pub fn set_group_size(&mut self, n: usize) {
        let n = n.max(1);
        if n == self.group_size {
            return;
        }
        let keep = n - 1;
        if self.buffer.len() > keep {
            let drop = self.buffer.len() - keep;
            self.buffer.drain(..drop);
        }
        self.group_size = n;
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn emitted(&self) -> u64 {
        self.emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(a: f64, b: f64) -> RawRow {
        [("a".to_string(), a), ("b".to_string(), b), ("time".to_string(), 0.0)]
            .into_iter()
            .collect()
    }

    fn aggregator(n: usize) -> SampleAggregator {
        SampleAggregator::new(FeatureSchema::new(["a", "b"]), n)
    }

    #[test]
    fn test_emits_floor_total_over_n_means() {
        let mut agg = aggregator(3);
        let mut emitted = Vec::new();
        for i in 0..10 {
            if let AggregateOutcome::Emitted { row } = agg.submit(&raw(i as f64, 1.0)).unwrap() {
                emitted.push(row);
            }
        }
        assert_eq!(emitted.len(), 3);
        assert_eq!(emitted[0]["a"], 1.0);
        assert_eq!(emitted[1]["a"], 4.0);
        assert_eq!(emitted[2]["a"], 7.0);
        assert_eq!(agg.buffered(), 1);
    }

    #[test]
    fn test_reports_accumulating_progress() {
        let mut agg = aggregator(3);
        assert_eq!(
            agg.submit(&raw(1.0, 1.0)).unwrap(),
            AggregateOutcome::Accumulating { have: 1, need: 3 }
        );
        assert_eq!(
            agg.submit(&raw(1.0, 1.0)).unwrap(),
            AggregateOutcome::Accumulating { have: 2, need: 3 }
        );
    }

    #[test]
    fn test_n_of_one_passes_rows_through() {
        let mut agg = aggregator(1);
        match agg.submit(&raw(2.5, -1.0)).unwrap() {
            AggregateOutcome::Emitted { row } => {
                assert_eq!(row.len(), 2);
                assert_eq!(row["b"], -1.0);
            }
            other => panic!("expected emission, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_feature_leaves_buffer_untouched() {
        let mut agg = aggregator(2);
        agg.submit(&raw(1.0, 1.0)).unwrap();
        let partial: RawRow = [("a".to_string(), 5.0)].into_iter().collect();
        assert!(matches!(
            agg.submit(&partial),
            Err(IngestError::MissingFeature { .. })
        ));
        assert_eq!(agg.buffered(), 1);
    }

    #[test]
    fn test_shrink_keeps_most_recent_rows() {
        let mut agg = aggregator(5);
        for i in 0..4 {
            agg.submit(&raw(i as f64, 0.0)).unwrap();
        }
        agg.set_group_size(2);
        assert_eq!(agg.buffered(), 1);
        // the kept row is the last one submitted (a = 3)
        match agg.submit(&raw(5.0, 0.0)).unwrap() {
            AggregateOutcome::Emitted { row } => assert_eq!(row["a"], 4.0),
            other => panic!("expected emission, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_group_size_clamps_to_one() {
        let mut agg = aggregator(0);
        assert_eq!(agg.group_size(), 1);
        agg.set_group_size(0);
        assert_eq!(agg.group_size(), 1);
    }
}
