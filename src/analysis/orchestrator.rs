//! Parallel, failure-isolated backend calls.
//!
//! Every backend runs in its own task under its own timeout ceiling. Nothing
//! a backend does (slow reply, transport failure, blank text, panic) can
//! escape as an error or delay the others; it becomes a [`BackendResult`].
//! The caller waits only for all calls to settle.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::llm::{AnalysisBackend, BackendError};
use crate::types::{BackendId, BackendResult, ErrorKind};

/// Prompt pair sent to every backend in one dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub system: String,
    pub prompt: String,
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Run one backend to completion under its profile.
///
/// The timeout covers every attempt: a transient transport failure is retried
/// at most `retry_budget` times after `retry_delay`, but never beyond the
/// ceiling. Whitespace-only output counts as `EmptyResponse`.
pub async fn call_backend(
    backend: Arc<dyn AnalysisBackend>,
    request: Arc<AnalysisRequest>,
) -> BackendResult {
    let id = backend.id().clone();
    let profile = backend.profile().clone();
    let started = Instant::now();
    let mut attempts: u32 = 0;

    let outcome = tokio::time::timeout(profile.timeout, async {
        loop {
            attempts += 1;
            match backend.analyze(&request.system, &request.prompt).await {
                Ok(text) if text.trim().is_empty() => return Err(BackendError::EmptyResponse),
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() && attempts <= profile.retry_budget => {
                    warn!(backend = %id, attempt = attempts, error = %e, "Transient backend failure, retrying");
                    tokio::time::sleep(profile.retry_delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    })
    .await;

    let elapsed = elapsed_ms(started);
    match outcome {
        Ok(Ok(text)) => {
            info!(backend = %id, elapsed_ms = elapsed, attempts, "Backend analysis complete");
            BackendResult::success(id, text, elapsed, attempts)
        }
        Ok(Err(e)) => {
            warn!(backend = %id, elapsed_ms = elapsed, attempts, error = %e, "Backend analysis failed");
            let kind = match e {
                BackendError::Timeout => ErrorKind::Timeout,
                BackendError::Transport { .. } => ErrorKind::Transport,
                BackendError::EmptyResponse => ErrorKind::EmptyResponse,
            };
            BackendResult::failure(id, kind, e.to_string(), elapsed, attempts)
        }
        Err(_) => {
            warn!(backend = %id, timeout_secs = profile.timeout.as_secs_f64(), attempts, "Backend timed out");
            BackendResult::failure(
                id,
                ErrorKind::Timeout,
                format!("no response within {:.0}s", profile.timeout.as_secs_f64()),
                elapsed,
                attempts,
            )
        }
    }
}

/// Aborts the wrapped task when dropped before it finishes.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

impl<T> Future for AbortOnDrop<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.0).poll(cx)
    }
}

/// [`call_backend`] in its own task, so a panicking backend becomes an
/// `Internal` error result instead of unwinding into the caller. Dropping the
/// returned future aborts the call.
pub async fn call_isolated(
    backend: Arc<dyn AnalysisBackend>,
    request: Arc<AnalysisRequest>,
) -> BackendResult {
    let id = backend.id().clone();
    let started = Instant::now();
    let task = AbortOnDrop(tokio::spawn(call_backend(backend, request)));
    task.await.unwrap_or_else(|e| {
        warn!(backend = %id, error = %e, "Backend task died");
        let what = if e.is_panic() { "panicked" } else { "was cancelled" };
        BackendResult::failure(
            id,
            ErrorKind::Internal,
            format!("backend task {what}"),
            elapsed_ms(started),
            1,
        )
    })
}

/// Call every backend concurrently and collect one result per backend.
///
/// Completes once all calls have settled; with per-call ceilings that is
/// bounded by the slowest timeout, not the sum. Dropping the future aborts
/// every call still running.
pub async fn dispatch(
    backends: Vec<Arc<dyn AnalysisBackend>>,
    request: Arc<AnalysisRequest>,
) -> BTreeMap<BackendId, BackendResult> {
    let ids: Vec<BackendId> = backends.iter().map(|b| b.id().clone()).collect();
    let joined = join_all(
        backends
            .into_iter()
            .map(|backend| call_isolated(backend, request.clone())),
    )
    .await;
    ids.into_iter().zip(joined).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BackendProfile, ScriptedBackend};
    use crate::types::BackendStatus;
    use async_trait::async_trait;
    use std::time::Duration;

    fn request() -> Arc<AnalysisRequest> {
        Arc::new(AnalysisRequest {
            system: "system".to_string(),
            prompt: "Top 2 Contributing Features".to_string(),
        })
    }

    fn scripted(id: &str, timeout_secs: u64) -> ScriptedBackend {
        ScriptedBackend::new(id, ScriptedBackend::test_profile(Duration::from_secs(timeout_secs)))
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_isolates_slow_and_flaky_backends() {
        let a = scripted("a", 5).then_reply(Duration::from_secs(1), "A says coolant");
        let b = scripted("b", 5).then_reply(Duration::from_secs(30), "too late");
        let c = scripted("c", 5)
            .then_fail(Duration::from_millis(200), BackendError::transport("connection reset", true))
            .then_reply(Duration::from_millis(500), "C says valve");

        let backends: Vec<Arc<dyn AnalysisBackend>> = vec![Arc::new(a), Arc::new(b), Arc::new(c)];
        let started = Instant::now();
        let results = dispatch(backends, request()).await;
        let took = started.elapsed();

        assert_eq!(results[&BackendId::from("a")].status, BackendStatus::Success);
        assert_eq!(results[&BackendId::from("b")].status, BackendStatus::Timeout);
        assert_eq!(results[&BackendId::from("c")].status, BackendStatus::Success);
        assert_eq!(results[&BackendId::from("c")].attempts, 2);
        // bounded by the slowest ceiling, not the sum of latencies
        assert!(took >= Duration::from_secs(5));
        assert!(took < Duration::from_millis(5_500), "took {took:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let backend = Arc::new(
            scripted("t", 5)
                .then_fail(Duration::from_millis(10), BackendError::Timeout)
                .then_reply(Duration::from_millis(10), "never used"),
        );
        let result = call_backend(backend.clone(), request()).await;
        assert_eq!(result.status, BackendStatus::Timeout);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_at_most_one_retry() {
        let backend = Arc::new(
            scripted("r", 5)
                .then_fail(Duration::from_millis(10), BackendError::transport("503", true))
                .then_fail(Duration::from_millis(10), BackendError::transport("503", true))
                .then_reply(Duration::from_millis(10), "third time"),
        );
        let result = call_backend(backend.clone(), request()).await;
        assert_eq!(result.status, BackendStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::Transport));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_bounded_by_ceiling() {
        let profile = BackendProfile {
            retry_delay: Duration::from_secs(10),
            ..ScriptedBackend::test_profile(Duration::from_secs(5))
        };
        let backend = Arc::new(
            ScriptedBackend::new("slow-retry", profile)
                .then_fail(Duration::from_secs(1), BackendError::transport("reset", true))
                .then_reply(Duration::from_millis(10), "too late"),
        );
        let result = call_backend(backend, request()).await;
        assert_eq!(result.status, BackendStatus::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blank_response_is_empty_error() {
        let backend = Arc::new(scripted("blank", 5).then_reply(Duration::from_millis(5), "  \n "));
        let result = call_backend(backend, request()).await;
        assert_eq!(result.status, BackendStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::EmptyResponse));
    }

    struct PanickingBackend {
        id: BackendId,
        profile: BackendProfile,
    }

    #[async_trait]
    impl AnalysisBackend for PanickingBackend {
        fn id(&self) -> &BackendId {
            &self.id
        }
        fn profile(&self) -> &BackendProfile {
            &self.profile
        }
        async fn analyze(&self, _: &str, _: &str) -> Result<String, BackendError> {
            panic!("backend bug");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_backend_becomes_error_result() {
        let bad: Arc<dyn AnalysisBackend> = Arc::new(PanickingBackend {
            id: "bad".into(),
            profile: ScriptedBackend::test_profile(Duration::from_secs(5)),
        });
        let good: Arc<dyn AnalysisBackend> =
            Arc::new(scripted("good", 5).then_reply(Duration::from_millis(10), "fine"));

        let results = dispatch(vec![bad, good], request()).await;
        let bad = &results[&BackendId::from("bad")];
        assert_eq!(bad.status, BackendStatus::Error);
        assert_eq!(bad.error_kind, Some(ErrorKind::Internal));
        assert_eq!(results[&BackendId::from("good")].status, BackendStatus::Success);
    }

    #[tokio::test]
    async fn test_no_backends_yields_empty_map() {
        assert!(dispatch(Vec::new(), request()).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_dispatch_aborts_running_calls() {
        let slow = Arc::new(scripted("slow", 60).then_reply(Duration::from_secs(30), "late"));
        let backends: Vec<Arc<dyn AnalysisBackend>> = vec![slow.clone()];

        let abandoned = tokio::time::timeout(Duration::from_secs(1), dispatch(backends, request())).await;
        assert!(abandoned.is_err());
        // let the aborted task get dropped
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(Arc::strong_count(&slow), 1, "call task still holds the backend");
    }
}
