//! Stream Broadcaster
//!
//! Fans aggregated rows, analysis announcements and idle heartbeats out to
//! any number of subscribers. Each subscriber owns a bounded queue; publishing
//! never waits, and a subscriber whose queue is full or closed is dropped.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::types::{AggregatedRow, AnalysisSummary};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Row(Arc<AggregatedRow>),
    Analysis(AnalysisSummary),
    Heartbeat { at: DateTime<Utc> },
}

impl StreamEvent {
    /// SSE event name.
    pub fn event_name(&self) -> &'static str {
        match self {
            StreamEvent::Row(_) => "row",
            StreamEvent::Analysis(_) => "analysis",
            StreamEvent::Heartbeat { .. } => "heartbeat",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            StreamEvent::Row(row) => serde_json::to_string(row.as_ref()),
            StreamEvent::Analysis(summary) => serde_json::to_string(summary),
            StreamEvent::Heartbeat { at } => serde_json::to_string(&serde_json::json!({ "at": at })),
        }
    }
}

/// Receiving side handed to one subscriber.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<StreamEvent>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BroadcastStats {
    pub subscribers: usize,
    pub rows_published: u64,
    pub duplicates_suppressed: u64,
    pub analyses_published: u64,
    pub heartbeats: u64,
    pub subscribers_dropped: u64,
}

struct State {
    subscribers: Vec<(u64, mpsc::Sender<StreamEvent>)>,
    next_id: u64,
    last_sequence: Option<u64>,
    latest_row: Option<Arc<AggregatedRow>>,
    last_activity: Instant,
    stats: BroadcastStats,
}

impl State {
    /// Deliver to everyone; drop subscribers that cannot take it.
    fn deliver(&mut self, event: &StreamEvent) {
        let before = self.subscribers.len();
        self.subscribers.retain(|(id, tx)| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                info!(subscriber = id, "Subscriber queue full, dropping subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = id, "Subscriber disconnected");
                false
            }
        });
        self.stats.subscribers_dropped += (before - self.subscribers.len()) as u64;
        self.last_activity = Instant::now();
    }
}

#[derive(Clone)]
pub struct StreamBroadcaster {
    state: Arc<Mutex<State>>,
    queue_capacity: usize,
}

impl StreamBroadcaster {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                subscribers: Vec::new(),
                next_id: 1,
                last_sequence: None,
                latest_row: None,
                last_activity: Instant::now(),
                stats: BroadcastStats::default(),
            })),
            queue_capacity: queue_capacity.max(1),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| {
            tracing::warn!("Broadcaster lock poisoned, recovering");
            e.into_inner()
        })
    }

    /// New bounded subscription. The latest row, if any, is queued first.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        if let Some(row) = state.latest_row.clone() {
            let _ = tx.try_send(StreamEvent::Row(row));
        }
        state.subscribers.push((id, tx));
        debug!(subscriber = id, total = state.subscribers.len(), "Subscriber added");
        Subscription { id, rx }
    }

    /// Publish a row unless it repeats the last emitted sequence index.
    /// Returns whether it was sent.
    pub fn publish_row(&self, row: Arc<AggregatedRow>) -> bool {
        let mut state = self.lock();
        if state.last_sequence == Some(row.sequence_index) {
            state.stats.duplicates_suppressed += 1;
            return false;
        }
        state.last_sequence = Some(row.sequence_index);
        state.latest_row = Some(row.clone());
        state.stats.rows_published += 1;
        state.deliver(&StreamEvent::Row(row));
        true
    }

    pub fn publish_analysis(&self, summary: AnalysisSummary) {
        let mut state = self.lock();
        state.stats.analyses_published += 1;
        state.deliver(&StreamEvent::Analysis(summary));
    }

    /// Send a heartbeat if nothing went out for `interval`.
    pub fn heartbeat_if_idle(&self, now: Instant, interval: Duration) -> bool {
        let mut state = self.lock();
        if now.saturating_duration_since(state.last_activity) < interval {
            return false;
        }
        state.stats.heartbeats += 1;
        state.deliver(&StreamEvent::Heartbeat { at: Utc::now() });
        true
    }

    fn idle_deadline(&self, interval: Duration) -> Instant {
        self.lock().last_activity + interval
    }

    /// Heartbeat task: wakes when the stream has been idle for `interval`.
    pub async fn run_heartbeat(self, interval: Duration, cancel: CancellationToken) {
        let interval = interval.max(Duration::from_millis(100));
        loop {
            let deadline = self.idle_deadline(interval);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    self.heartbeat_if_idle(Instant::now(), interval);
                }
            }
        }
        debug!("Heartbeat task stopped");
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }

    pub fn latest_row(&self) -> Option<Arc<AggregatedRow>> {
        self.lock().latest_row.clone()
    }

    pub fn stats(&self) -> BroadcastStats {
        let state = self.lock();
        BroadcastStats {
            subscribers: state.subscribers.len(),
            ..state.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DetectorVerdict, SensorRow};

    fn row(seq: u64) -> Arc<AggregatedRow> {
        let verdict = DetectorVerdict {
            score: 1.0,
            is_anomaly: false,
            threshold: 10.0,
        };
        Arc::new(AggregatedRow::new(seq, SensorRow::new(), verdict))
    }

    #[tokio::test(start_paused = true)]
    async fn test_five_rows_then_heartbeat() {
        let broadcaster = StreamBroadcaster::new(16);
        let mut sub = broadcaster.subscribe();
        let cancel = CancellationToken::new();
        tokio::spawn(broadcaster.clone().run_heartbeat(Duration::from_secs(15), cancel.clone()));

        for seq in 1..=5 {
            assert!(broadcaster.publish_row(row(seq)));
        }
        for seq in 1..=5 {
            match sub.rx.recv().await {
                Some(StreamEvent::Row(r)) => assert_eq!(r.sequence_index, seq),
                other => panic!("expected row {seq}, got {other:?}"),
            }
        }
        assert!(sub.rx.try_recv().is_err());

        tokio::time::sleep(Duration::from_secs(16)).await;
        assert!(matches!(sub.rx.recv().await, Some(StreamEvent::Heartbeat { .. })));
        cancel.cancel();
    }

    #[test]
    fn test_duplicate_sequence_suppressed() {
        let broadcaster = StreamBroadcaster::new(16);
        let mut sub = broadcaster.subscribe();
        assert!(broadcaster.publish_row(row(7)));
        assert!(!broadcaster.publish_row(row(7)));
        assert!(broadcaster.publish_row(row(8)));

        let mut seen = Vec::new();
        while let Ok(StreamEvent::Row(r)) = sub.rx.try_recv() {
            seen.push(r.sequence_index);
        }
        assert_eq!(seen, vec![7, 8]);
        assert_eq!(broadcaster.stats().duplicates_suppressed, 1);
    }

    #[test]
    fn test_full_subscriber_is_dropped() {
        let broadcaster = StreamBroadcaster::new(2);
        let _slow = broadcaster.subscribe();
        let mut fast = broadcaster.subscribe();

        for seq in 1..=2 {
            broadcaster.publish_row(row(seq));
            assert!(fast.rx.try_recv().is_ok());
        }
        assert_eq!(broadcaster.subscriber_count(), 2);
        broadcaster.publish_row(row(3));
        assert_eq!(broadcaster.subscriber_count(), 1);
        assert_eq!(broadcaster.stats().subscribers_dropped, 1);
    }

    #[test]
    fn test_closed_subscriber_is_dropped() {
        let broadcaster = StreamBroadcaster::new(4);
        drop(broadcaster.subscribe());
        broadcaster.publish_row(row(1));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_late_subscriber_gets_latest_row() {
        let broadcaster = StreamBroadcaster::new(4);
        broadcaster.publish_row(row(1));
        broadcaster.publish_row(row(2));
        let mut sub = broadcaster.subscribe();
        match sub.rx.try_recv() {
            Ok(StreamEvent::Row(r)) => assert_eq!(r.sequence_index, 2),
            other => panic!("expected latest row, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_heartbeat_while_active() {
        let broadcaster = StreamBroadcaster::new(4);
        let interval = Duration::from_secs(15);
        broadcaster.publish_row(row(1));
        assert!(!broadcaster.heartbeat_if_idle(Instant::now(), interval));
        tokio::time::advance(interval).await;
        assert!(broadcaster.heartbeat_if_idle(Instant::now(), interval));
    }
}
