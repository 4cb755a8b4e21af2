//! Analysis Bundle History
//!
//! Append-only record of finished analysis cycles. Two recorders:
//! - [`SledHistory`]: persisted, keyed by big-endian bundle id so iteration
//!   order is chronological.
//! - [`InMemoryHistory`]: bounded ring for tests and throwaway runs.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::types::AnalysisBundle;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sled::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bundle {0} already recorded")]
    DuplicateId(u64),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Sink for finished bundles. Ids come from [`HistoryRecorder::issue_id`] and
/// are strictly increasing for the lifetime of the store.
pub trait HistoryRecorder: Send + Sync {
    fn issue_id(&self) -> u64;
    fn append(&self, bundle: &AnalysisBundle) -> Result<(), StorageError>;
    fn get(&self, id: u64) -> Result<Option<AnalysisBundle>, StorageError>;
    /// Newest first.
    fn recent(&self, limit: usize) -> Result<Vec<AnalysisBundle>, StorageError>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn latest(&self) -> Result<Option<AnalysisBundle>, StorageError> {
        Ok(self.recent(1)?.into_iter().next())
    }
}

/// `max(last + 1, now_ms)`: monotonic and roughly wall-clock.
#[derive(Debug)]
struct IdIssuer {
    last: AtomicU64,
}

impl IdIssuer {
    fn starting_after(last: u64) -> Self {
        Self {
            last: AtomicU64::new(last),
        }
    }

    fn next(&self) -> u64 {
        let now_ms = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        let mut current = self.last.load(Ordering::SeqCst);
        loop {
            let candidate = now_ms.max(current + 1);
            match self
                .last
                .compare_exchange(current, candidate, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return candidate,
                Err(actual) => current = actual,
            }
        }
    }
}

// ============================================================================
// Sled
// ============================================================================

#[derive(Clone)]
pub struct SledHistory {
    db: Arc<sled::Db>,
    ids: Arc<IdIssuer>,
}

impl SledHistory {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let db = sled::open(path)?;
        Self::from_db(db)
    }

    /// Throwaway database, removed on drop.
    pub fn temporary() -> Result<Self, StorageError> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> Result<Self, StorageError> {
        let last = match db.last()? {
            Some((key, _)) => decode_key(&key).unwrap_or(0),
            None => 0,
        };
        tracing::info!(bundles = db.len(), last_id = last, "Analysis history opened");
        Ok(Self {
            db: Arc::new(db),
            ids: Arc::new(IdIssuer::starting_after(last)),
        })
    }

    /// Drop every stored bundle.
    pub fn clear(&self) -> Result<(), StorageError> {
        self.db.clear()?;
        self.db.flush()?;
        Ok(())
    }
}

fn decode_key(key: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = key.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

impl HistoryRecorder for SledHistory {
    fn issue_id(&self) -> u64 {
        self.ids.next()
    }

    /// Never overwrites: a second append under the same id fails.
    fn append(&self, bundle: &AnalysisBundle) -> Result<(), StorageError> {
        let value = serde_json::to_vec(bundle)?;
        let key = bundle.id.to_be_bytes();
        match self.db.compare_and_swap(key, None as Option<&[u8]>, Some(value))? {
            Ok(()) => Ok(()),
            Err(_) => Err(StorageError::DuplicateId(bundle.id)),
        }
    }

    fn get(&self, id: u64) -> Result<Option<AnalysisBundle>, StorageError> {
        match self.db.get(id.to_be_bytes())? {
            Some(value) => Ok(Some(serde_json::from_slice(&value)?)),
            None => Ok(None),
        }
    }

    fn recent(&self, limit: usize) -> Result<Vec<AnalysisBundle>, StorageError> {
        let mut bundles = Vec::with_capacity(limit.min(64));
        for item in self.db.iter().rev() {
            if bundles.len() >= limit {
                break;
            }
            let (key, value) = item?;
            match serde_json::from_slice::<AnalysisBundle>(&value) {
                Ok(bundle) => bundles.push(bundle),
                Err(e) => {
                    tracing::warn!(key = ?decode_key(&key), error = %e, "Skipping unreadable history entry");
                }
            }
        }
        Ok(bundles)
    }

    fn len(&self) -> usize {
        self.db.len()
    }
}

// ============================================================================
// In-memory
// ============================================================================

pub struct InMemoryHistory {
    capacity: usize,
    bundles: Mutex<VecDeque<AnalysisBundle>>,
    ids: IdIssuer,
}

impl InMemoryHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            bundles: Mutex::new(VecDeque::new()),
            ids: IdIssuer::starting_after(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<AnalysisBundle>> {
        self.bundles.lock().unwrap_or_else(|e| {
            tracing::warn!("History lock poisoned, recovering");
            e.into_inner()
        })
    }
}

impl HistoryRecorder for InMemoryHistory {
    fn issue_id(&self) -> u64 {
        self.ids.next()
    }

    fn append(&self, bundle: &AnalysisBundle) -> Result<(), StorageError> {
        let mut bundles = self.lock();
        if bundles.iter().any(|b| b.id == bundle.id) {
            return Err(StorageError::DuplicateId(bundle.id));
        }
        if bundles.len() >= self.capacity {
            bundles.pop_front();
        }
        bundles.push_back(bundle.clone());
        Ok(())
    }

    fn get(&self, id: u64) -> Result<Option<AnalysisBundle>, StorageError> {
        Ok(self.lock().iter().find(|b| b.id == id).cloned())
    }

    fn recent(&self, limit: usize) -> Result<Vec<AnalysisBundle>, StorageError> {
        Ok(self.lock().iter().rev().take(limit).cloned().collect())
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BackendResult, TriggerReason};
    use std::collections::BTreeMap;

    fn bundle(id: u64) -> AnalysisBundle {
        let mut results = BTreeMap::new();
        results.insert(
            "lmstudio".into(),
            BackendResult::success("lmstudio".into(), "valve stiction".into(), 1200, 1),
        );
        AnalysisBundle {
            id,
            timestamp: Utc::now(),
            sequence_index: 42,
            trigger_reason: TriggerReason::FirstDetection,
            feature_comparison: "Top 1 Contributing Features (Fault vs Normal):".into(),
            top_features: Vec::new(),
            results,
        }
    }

    #[test]
    fn test_ids_strictly_increase() {
        let issuer = IdIssuer::starting_after(0);
        let ids: Vec<u64> = (0..100).map(|_| issuer.next()).collect();
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_ids_continue_past_future_last() {
        let far = u64::MAX / 2;
        let issuer = IdIssuer::starting_after(far);
        assert_eq!(issuer.next(), far + 1);
    }

    #[test]
    fn test_sled_append_get_recent() {
        let dir = tempfile::tempdir().unwrap();
        let history = SledHistory::open(dir.path().join("history.db")).unwrap();

        let first = history.issue_id();
        let second = history.issue_id();
        history.append(&bundle(first)).unwrap();
        history.append(&bundle(second)).unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history.get(first).unwrap().unwrap().id, first);
        let recent: Vec<u64> = history.recent(5).unwrap().iter().map(|b| b.id).collect();
        assert_eq!(recent, vec![second, first]);
        assert_eq!(history.latest().unwrap().unwrap().id, second);
    }

    #[test]
    fn test_sled_is_append_only() {
        let history = SledHistory::temporary().unwrap();
        let id = history.issue_id();
        history.append(&bundle(id)).unwrap();
        assert!(matches!(
            history.append(&bundle(id)),
            Err(StorageError::DuplicateId(dup)) if dup == id
        ));
    }

    #[test]
    fn test_sled_reopen_keeps_ids_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let last = {
            let history = SledHistory::open(&path).unwrap();
            let id = history.issue_id() + 1_000_000;
            history.append(&bundle(id)).unwrap();
            id
        };
        let reopened = SledHistory::open(&path).unwrap();
        assert!(reopened.issue_id() > last);
    }

    #[test]
    fn test_in_memory_capacity() {
        let history = InMemoryHistory::new(2);
        for _ in 0..3 {
            let id = history.issue_id();
            history.append(&bundle(id)).unwrap();
        }
        assert_eq!(history.len(), 2);
        assert_eq!(history.recent(10).unwrap().len(), 2);
    }
}
