//! Bounded FIFO of recent aggregated rows

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::types::AggregatedRow;

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    rows: VecDeque<Arc<AggregatedRow>>,
    capacity: usize,
}

impl SlidingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            rows: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append, evicting the oldest rows beyond capacity.
    pub fn push(&mut self, row: Arc<AggregatedRow>) {
        self.rows.push_back(row);
        while self.rows.len() > self.capacity {
            self.rows.pop_front();
        }
    }

    /// Change capacity, dropping the oldest rows on shrink.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.rows.len() > self.capacity {
            self.rows.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&Arc<AggregatedRow>> {
        self.rows.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<AggregatedRow>> {
        self.rows.iter()
    }

    /// Per-feature mean over every row currently in the window.
    pub fn feature_means(&self) -> BTreeMap<String, f64> {
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        for row in &self.rows {
            for (name, value) in &row.features {
                *sums.entry(name.clone()).or_insert(0.0) += value;
            }
        }
        let n = self.rows.len().max(1) as f64;
        sums.into_iter().map(|(k, v)| (k, v / n)).collect()
    }
}
