//! API Regression Tests
//!
//! In-process tests that build the Axum app via `create_app()` and walk the
//! ingest -> trigger -> history path using `tower::ServiceExt::oneshot()`.
//! No binary spawn, no network port.

use fault_explainer::api::create_app;
use fault_explainer::baseline::{BaselineDetector, BaselineStats};
use fault_explainer::config::ServiceConfig;
use fault_explainer::llm::{AnalysisBackend, ScriptedBackend};
use fault_explainer::service::{Service, ServiceParts};
use fault_explainer::storage::{HistoryRecorder, SledHistory};
use fault_explainer::types::FeatureSchema;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

struct TestApp {
    app: Router,
    _service: Service,
    cancel: CancellationToken,
    _tasks: JoinSet<()>,
}

impl Drop for TestApp {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn create_test_app(history: Arc<dyn HistoryRecorder>) -> TestApp {
    let mut config = ServiceConfig::default();
    config.features.columns = vec!["x".to_string(), "y".to_string()];
    config.runtime.min_context = Some(1);

    let baseline = Arc::new(BaselineStats::from_pairs([("x", 10.0, 2.0), ("y", -1.0, 0.5)]));
    let detector =
        BaselineDetector::new(Arc::clone(&baseline), &FeatureSchema::new(["x", "y"]), 0.01).unwrap();
    let backends: Vec<Arc<dyn AnalysisBackend>> = vec![
        Arc::new(
            ScriptedBackend::new("lmstudio", ScriptedBackend::test_profile(Duration::from_secs(5)))
                .then_reply(Duration::from_millis(10), "Feed x is far above its normal range."),
        ),
        Arc::new(
            ScriptedBackend::new("slow", ScriptedBackend::test_profile(Duration::from_millis(200)))
                .then_reply(Duration::from_secs(2), "never seen"),
        ),
    ];

    let mut tasks = JoinSet::new();
    let cancel = CancellationToken::new();
    let service = Service::start(
        ServiceParts {
            config,
            detector: Arc::new(detector),
            baseline: Some(baseline),
            backends,
            history,
        },
        &mut tasks,
        &cancel,
    );
    TestApp {
        app: create_app(service.state.clone()),
        _service: service,
        cancel,
        _tasks: tasks,
    }
}

async fn get(app: &Router, uri: &str) -> (StatusCode, String) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, String::from_utf8_lossy(&bytes).into_owned())
}

async fn post_json(app: &Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null))
}

async fn wait_for_latest(app: &Router) -> serde_json::Value {
    for _ in 0..100 {
        let (status, body) = get(app, "/api/v1/analysis/latest").await;
        if status == StatusCode::OK {
            return serde_json::from_str(&body).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("no analysis was recorded");
}

/// One anomalous row produces a bundle with a success and a timeout, both
/// visible through every history endpoint.
#[tokio::test]
async fn test_ingest_to_history_round_trip() {
    let history: Arc<dyn HistoryRecorder> = Arc::new(SledHistory::temporary().unwrap());
    let t = create_test_app(history);

    let (status, ack) = post_json(&t.app, "/api/v1/ingest", r#"{"data_point": {"x": 10.5, "y": -1.1}}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["data"]["is_anomaly"], false);
    assert_eq!(ack["data"]["decision"]["reason"], "not_anomalous");

    let (status, ack) = post_json(&t.app, "/api/v1/ingest", r#"{"data_point": {"x": 30.0, "y": -1.0}}"#).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["data"]["is_anomaly"], true);
    assert_eq!(ack["data"]["decision"]["eligible"], true);
    assert_eq!(ack["data"]["decision"]["reason"], "first_detection");

    let latest = wait_for_latest(&t.app).await;
    let bundle = &latest["data"];
    let id = bundle["id"].as_u64().unwrap();
    assert_eq!(bundle["sequence_index"], 2);
    assert_eq!(bundle["top_features"][0]["name"], "x");
    assert_eq!(bundle["results"]["lmstudio"]["status"], "success");
    assert_eq!(bundle["results"]["slow"]["status"], "timeout");

    let (status, body) = get(&t.app, &format!("/api/v1/analysis/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    let by_id: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(by_id["data"], *bundle);

    let (status, markdown) = get(&t.app, &format!("/api/v1/analysis/{id}/markdown")).await;
    assert_eq!(status, StatusCode::OK);
    assert!(markdown.contains("Feed x is far above its normal range."));
    assert!(markdown.contains("slow"));

    let (status, body) = get(&t.app, "/api/v1/analysis/history?limit=5").await;
    assert_eq!(status, StatusCode::OK);
    let summaries: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(summaries["data"].as_array().unwrap().len(), 1);
    assert_eq!(summaries["data"][0]["statuses"]["slow"], "timeout");

    let (_, body) = get(&t.app, "/api/v1/status").await;
    let status_json: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(status_json["data"]["analyses_recorded"], 1);
    assert_eq!(status_json["data"]["in_flight"], false);
}

#[tokio::test]
async fn test_preview_has_no_side_effects() {
    let history: Arc<dyn HistoryRecorder> = Arc::new(SledHistory::temporary().unwrap());
    let t = create_test_app(Arc::clone(&history));

    post_json(&t.app, "/api/v1/ingest", r#"{"data_point": {"x": 11.0, "y": -1.0}}"#).await;

    let (status, body) = get(&t.app, "/api/v1/preview/top-features").await;
    assert_eq!(status, StatusCode::OK);
    let preview: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(preview["data"]["window_len"], 1);

    let (_, body) = get(&t.app, "/api/v1/metrics").await;
    let metrics: serde_json::Value = serde_json::from_str(&body).unwrap();
    assert_eq!(metrics["data"]["ingest"]["aggregated_rows"], 1);
    assert_eq!(metrics["data"]["ingest"]["in_flight"], false);
    assert!(history.is_empty());
}

#[tokio::test]
async fn test_root_health_and_unknown_routes() {
    let t = create_test_app(Arc::new(SledHistory::temporary().unwrap()));

    let (status, body) = get(&t.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.contains("\"status\":\"ok\""));

    let (status, _) = get(&t.app, "/api/v1/does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get(&t.app, "/api/v1/analysis/not-a-number").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_malformed_ingest_body_is_rejected() {
    let t = create_test_app(Arc::new(SledHistory::temporary().unwrap()));

    let (status, _) = post_json(&t.app, "/api/v1/ingest", r#"{"rows": []}"#).await;
    assert!(status.is_client_error());

    let (status, body) = post_json(&t.app, "/api/v1/ingest", r#"{"data_point": {"x": 1.0}}"#).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"]["message"].as_str().unwrap().contains('y'));
}
