//! Row Source Integration Tests
//!
//! Replays a small CSV and a synthetic stream through the processing loop
//! against a fully assembled service, the same path the binary takes for
//! `--csv` and `--synthetic`.

use fault_explainer::baseline::{BaselineDetector, BaselineStats};
use fault_explainer::config::{BackendTier, ServiceConfig};
use fault_explainer::llm::{AnalysisBackend, BackendProfile, ScriptedBackend};
use fault_explainer::pipeline::{CsvSource, StopReason, SyntheticSource};
use fault_explainer::service::{Service, ServiceParts};
use fault_explainer::storage::{HistoryRecorder, InMemoryHistory};
use fault_explainer::types::{BackendId, FeatureSchema, TriggerReason};

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

fn baseline() -> Arc<BaselineStats> {
    Arc::new(BaselineStats::from_pairs([
        ("Reactor Pressure", 2705.0, 7.5),
        ("Reactor Temperature", 120.4, 0.05),
        ("Stripper Level", 50.0, 1.0),
    ]))
}

fn schema() -> FeatureSchema {
    FeatureSchema::new(["Reactor Pressure", "Reactor Temperature", "Stripper Level"])
}

fn start(
    mut config: ServiceConfig,
    backends: Vec<Arc<dyn AnalysisBackend>>,
    history: Arc<dyn HistoryRecorder>,
    cancel: &CancellationToken,
    tasks: &mut JoinSet<()>,
) -> Service {
    config.features.columns = schema().names().to_vec();
    let detector = BaselineDetector::new(baseline(), &schema(), 0.01).unwrap();
    Service::start(
        ServiceParts {
            config,
            detector: Arc::new(detector),
            baseline: Some(baseline()),
            backends,
            history,
        },
        tasks,
        cancel,
    )
}

fn local_backend(id: &str) -> Arc<dyn AnalysisBackend> {
    Arc::new(ScriptedBackend::new(
        id,
        ScriptedBackend::test_profile(Duration::from_secs(5)),
    ))
}

/// 10 normal rows, 5 rows with a pressure excursion, then one row missing a
/// column. Extra columns (`time`, `fault`) are ignored.
fn replay_csv() -> String {
    let mut csv = String::from("time,Reactor Pressure,Reactor Temperature,Stripper Level,fault\n");
    for i in 0..10 {
        let _ = writeln!(csv, "{i},2705.0,120.40,50.0,0");
    }
    for i in 10..15 {
        let _ = writeln!(csv, "{i},2790.0,120.40,50.0,1");
    }
    csv.push_str("15,2790.0,,50.0,1\n");
    csv
}

#[tokio::test]
async fn test_csv_replay_triggers_one_analysis() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fault1.csv");
    std::fs::write(&path, replay_csv()).unwrap();

    let mut config = ServiceConfig::default();
    config.runtime.required_consecutive = 2;
    config.runtime.min_context = Some(3);

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let history: Arc<dyn HistoryRecorder> = Arc::new(InMemoryHistory::new(10));
    let service = start(
        config,
        vec![local_backend("lmstudio")],
        Arc::clone(&history),
        &cancel,
        &mut tasks,
    );

    let mut source = CsvSource::open(&path, Duration::ZERO).unwrap();
    let (stats, reason) = service.processing_loop(cancel.clone()).run(&mut source).await;

    assert_eq!(reason, StopReason::Eof);
    assert_eq!(stats.rows_read, 16);
    assert_eq!(stats.rows_processed, 15);
    assert_eq!(stats.rows_rejected, 1);
    assert_eq!(stats.triggers, 1);

    for _ in 0..100 {
        if !history.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let bundle = history.latest().unwrap().expect("bundle recorded");
    assert_eq!(bundle.sequence_index, 12);
    assert_eq!(bundle.trigger_reason, TriggerReason::FirstDetection);
    assert_eq!(bundle.top_features[0].name, "Reactor Pressure");
    assert!(bundle.feature_comparison.contains("Reactor Pressure"));
    assert_eq!(bundle.succeeded(), 1);

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn test_session_expiry_stops_synthetic_source() {
    let mut config = ServiceConfig::default();
    config.session.duration_minutes = 1;
    config.session.stop_source_on_shutdown = true;

    let hosted = BackendProfile {
        tier: BackendTier::Hosted,
        ..ScriptedBackend::test_profile(Duration::from_secs(5))
    };
    let backends: Vec<Arc<dyn AnalysisBackend>> = vec![
        local_backend("lmstudio"),
        Arc::new(ScriptedBackend::new("claude", hosted)),
    ];

    let cancel = CancellationToken::new();
    let mut tasks = JoinSet::new();
    let history: Arc<dyn HistoryRecorder> = Arc::new(InMemoryHistory::new(10));
    let service = start(config, backends, history, &cancel, &mut tasks);

    let outcome = service.session.toggle(&BackendId::from("claude"), true).unwrap();
    assert!(outcome.session_started);

    let mut source =
        SyntheticSource::new(&schema(), baseline(), 30, Duration::from_secs(1), 7).unwrap();
    let (stats, reason) = service.processing_loop(cancel.clone()).run(&mut source).await;

    assert_eq!(reason, StopReason::SessionExpired);
    assert!(stats.rows_read >= 55, "read {} rows", stats.rows_read);
    assert!(service.session.registry().hosted_active().is_empty());
    assert!(!service.session.is_active());

    cancel.cancel();
}
