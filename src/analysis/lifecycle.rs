//! Per-backend lifecycle for direct, single-backend queries.
//!
//! ```text
//!   Idle ──accept──▶ Analyzing ──success──▶ Displaying ──timer──▶ Idle
//!    ▲                   │                     │  ▲
//!    └──────error────────┘              freeze │  │ (never)
//!    ▲                                         ▼  │
//!    └─────────────unfreeze─────────────── Frozen
//! ```
//!
//! Each backend gets one [`LifecycleActor`] task that owns its
//! [`BackendLifecycle`]; everything else talks to it through a
//! [`LifecycleHandle`]. This path is independent of the gate's global
//! single-flight: a batch dispatch never changes lifecycle state, it only
//! refreshes the latest result.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::orchestrator::{call_isolated, AnalysisRequest};
use crate::llm::AnalysisBackend;
use crate::types::{BackendId, BackendResult};

// ============================================================================
// State Machine
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleState {
    Idle,
    Analyzing,
    Displaying,
    Frozen,
}

impl std::fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleState::Idle => write!(f, "idle"),
            LifecycleState::Analyzing => write!(f, "analyzing"),
            LifecycleState::Displaying => write!(f, "displaying"),
            LifecycleState::Frozen => write!(f, "frozen"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    /// `retry_after` is `None` when no estimate exists (analyzing, frozen).
    #[error("backend is busy ({state})")]
    Busy {
        state: LifecycleState,
        retry_after: Option<Duration>,
    },

    #[error("cannot {action} while {from}")]
    InvalidTransition {
        from: LifecycleState,
        action: &'static str,
    },

    #[error("unknown backend '{0}'")]
    UnknownBackend(String),

    #[error("backend lifecycle task is not running")]
    Unavailable,
}

/// Pure state machine; all time is passed in.
#[derive(Debug)]
pub struct BackendLifecycle {
    state: LifecycleState,
    display_duration: Duration,
    display_until: Option<Instant>,
    analyzing_since: Option<Instant>,
    latest: Option<BackendResult>,
}

impl BackendLifecycle {
    pub fn new(display_duration: Duration) -> Self {
        Self {
            state: LifecycleState::Idle,
            display_duration,
            display_until: None,
            analyzing_since: None,
            latest: None,
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn latest(&self) -> Option<&BackendResult> {
        self.latest.as_ref()
    }

    /// Idle → Analyzing, or `Busy`.
    pub fn accept_request(&mut self, now: Instant) -> Result<(), LifecycleError> {
        match self.state {
            LifecycleState::Idle => {
                self.state = LifecycleState::Analyzing;
                self.analyzing_since = Some(now);
                Ok(())
            }
            LifecycleState::Displaying => Err(LifecycleError::Busy {
                state: self.state,
                retry_after: Some(self.display_remaining(now)),
            }),
            state => Err(LifecycleError::Busy {
                state,
                retry_after: None,
            }),
        }
    }

    /// Analyzing → Displaying on success, → Idle on failure.
    pub fn complete(&mut self, result: BackendResult, now: Instant) {
        if self.state != LifecycleState::Analyzing {
            debug!(state = %self.state, "Completion outside Analyzing ignored");
            return;
        }
        self.analyzing_since = None;
        if result.is_success() {
            self.state = LifecycleState::Displaying;
            self.display_until = Some(now + self.display_duration);
        } else {
            self.state = LifecycleState::Idle;
            self.display_until = None;
        }
        self.latest = Some(result);
    }

    /// Display timer fired. Only ends a display whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> bool {
        match (self.state, self.display_until) {
            (LifecycleState::Displaying, Some(until)) if now >= until => {
                self.state = LifecycleState::Idle;
                self.display_until = None;
                true
            }
            _ => false,
        }
    }

    pub fn freeze(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Displaying {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                action: "freeze",
            });
        }
        self.state = LifecycleState::Frozen;
        self.display_until = None;
        Ok(())
    }

    pub fn unfreeze(&mut self) -> Result<(), LifecycleError> {
        if self.state != LifecycleState::Frozen {
            return Err(LifecycleError::InvalidTransition {
                from: self.state,
                action: "unfreeze",
            });
        }
        self.state = LifecycleState::Idle;
        Ok(())
    }

    /// Refresh the displayed result without a state change (batch output).
    pub fn record_external(&mut self, result: BackendResult) {
        self.latest = Some(result);
    }

    pub fn display_deadline(&self) -> Option<Instant> {
        match self.state {
            LifecycleState::Displaying => self.display_until,
            _ => None,
        }
    }

    fn display_remaining(&self, now: Instant) -> Duration {
        self.display_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or_default()
    }

    pub fn snapshot(&self, backend_id: &BackendId, now: Instant) -> LifecycleSnapshot {
        LifecycleSnapshot {
            backend_id: backend_id.clone(),
            state: self.state,
            display_remaining_ms: (self.state == LifecycleState::Displaying)
                .then(|| duration_ms(self.display_remaining(now))),
            analyzing_for_ms: self
                .analyzing_since
                .map(|since| duration_ms(now.saturating_duration_since(since))),
            latest: self.latest.clone(),
        }
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleSnapshot {
    pub backend_id: BackendId,
    pub state: LifecycleState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_remaining_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analyzing_for_ms: Option<u64>,
    pub latest: Option<BackendResult>,
}

// ============================================================================
// Actor
// ============================================================================

enum Command {
    Analyze {
        request: AnalysisRequest,
        reply: oneshot::Sender<Result<BackendResult, LifecycleError>>,
    },
    Freeze {
        reply: oneshot::Sender<Result<(), LifecycleError>>,
    },
    Unfreeze {
        reply: oneshot::Sender<Result<(), LifecycleError>>,
    },
    Status {
        reply: oneshot::Sender<LifecycleSnapshot>,
    },
    Record(BackendResult),
}

/// Owns one backend's lifecycle; runs until cancelled or all handles drop.
pub struct LifecycleActor {
    backend: Arc<dyn AnalysisBackend>,
    machine: BackendLifecycle,
    rx: mpsc::Receiver<Command>,
    done_tx: mpsc::Sender<BackendResult>,
    done_rx: mpsc::Receiver<BackendResult>,
    pending_reply: Option<oneshot::Sender<Result<BackendResult, LifecycleError>>>,
}

impl LifecycleActor {
    pub fn new(backend: Arc<dyn AnalysisBackend>) -> (Self, LifecycleHandle) {
        let (tx, rx) = mpsc::channel(32);
        let (done_tx, done_rx) = mpsc::channel(1);
        let handle = LifecycleHandle {
            backend_id: backend.id().clone(),
            tx,
        };
        let machine = BackendLifecycle::new(backend.profile().display_duration);
        (
            Self {
                backend,
                machine,
                rx,
                done_tx,
                done_rx,
                pending_reply: None,
            },
            handle,
        )
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let id = self.backend.id().clone();
        debug!(backend = %id, "[Lifecycle] Task starting");

        loop {
            let deadline = self.machine.display_deadline();
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(result) = self.done_rx.recv() => {
                    let now = Instant::now();
                    self.machine.complete(result.clone(), now);
                    info!(backend = %id, state = %self.machine.state(), status = ?result.status, "[Lifecycle] Query finished");
                    if let Some(reply) = self.pending_reply.take() {
                        let _ = reply.send(Ok(result));
                    }
                }
                _ = sleep_until_opt(deadline), if deadline.is_some() => {
                    if self.machine.expire(Instant::now()) {
                        debug!(backend = %id, "[Lifecycle] Display ended");
                    }
                }
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
            }
        }
        debug!(backend = %id, "[Lifecycle] Task stopped");
    }

    fn handle(&mut self, cmd: Command) {
        let now = Instant::now();
        match cmd {
            Command::Analyze { request, reply } => {
                if let Err(e) = self.machine.accept_request(now) {
                    let _ = reply.send(Err(e));
                    return;
                }
                self.pending_reply = Some(reply);
                let backend = self.backend.clone();
                let done = self.done_tx.clone();
                tokio::spawn(async move {
                    let result = call_isolated(backend, Arc::new(request)).await;
                    let _ = done.send(result).await;
                });
            }
            Command::Freeze { reply } => {
                let _ = reply.send(self.machine.freeze());
            }
            Command::Unfreeze { reply } => {
                let _ = reply.send(self.machine.unfreeze());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.machine.snapshot(self.backend.id(), now));
            }
            Command::Record(result) => self.machine.record_external(result),
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}

/// Cheap, cloneable client for one lifecycle actor.
#[derive(Clone)]
pub struct LifecycleHandle {
    backend_id: BackendId,
    tx: mpsc::Sender<Command>,
}

impl LifecycleHandle {
    pub fn backend_id(&self) -> &BackendId {
        &self.backend_id
    }

    /// Run one query. Returns `Busy` immediately unless the backend is idle;
    /// otherwise resolves when the call settles.
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<BackendResult, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Analyze { request, reply })
            .await
            .map_err(|_| LifecycleError::Unavailable)?;
        rx.await.map_err(|_| LifecycleError::Unavailable)?
    }

    pub async fn freeze(&self) -> Result<(), LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Freeze { reply })
            .await
            .map_err(|_| LifecycleError::Unavailable)?;
        rx.await.map_err(|_| LifecycleError::Unavailable)?
    }

    pub async fn unfreeze(&self) -> Result<(), LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Unfreeze { reply })
            .await
            .map_err(|_| LifecycleError::Unavailable)?;
        rx.await.map_err(|_| LifecycleError::Unavailable)?
    }

    pub async fn status(&self) -> Result<LifecycleSnapshot, LifecycleError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Status { reply })
            .await
            .map_err(|_| LifecycleError::Unavailable)?;
        rx.await.map_err(|_| LifecycleError::Unavailable)
    }

    /// Push a batch result; dropped if the actor's queue is full.
    pub fn record(&self, result: BackendResult) {
        if self.tx.try_send(Command::Record(result)).is_err() {
            debug!(backend = %self.backend_id, "Lifecycle queue full, batch result not recorded");
        }
    }
}

/// All lifecycle handles, keyed by backend.
#[derive(Clone, Default)]
pub struct LifecycleSet {
    handles: Arc<BTreeMap<BackendId, LifecycleHandle>>,
}

impl LifecycleSet {
    /// Spawn one actor per backend on `tasks`.
    pub fn spawn(
        backends: &[Arc<dyn AnalysisBackend>],
        tasks: &mut tokio::task::JoinSet<()>,
        cancel: &CancellationToken,
    ) -> Self {
        let mut handles = BTreeMap::new();
        for backend in backends {
            let (actor, handle) = LifecycleActor::new(backend.clone());
            tasks.spawn(actor.run(cancel.clone()));
            handles.insert(backend.id().clone(), handle);
        }
        Self {
            handles: Arc::new(handles),
        }
    }

    pub fn get(&self, id: &BackendId) -> Result<&LifecycleHandle, LifecycleError> {
        self.handles
            .get(id)
            .ok_or_else(|| LifecycleError::UnknownBackend(id.to_string()))
    }

    pub fn handles(&self) -> impl Iterator<Item = &LifecycleHandle> {
        self.handles.values()
    }

    pub fn record_all<'a>(&self, results: impl IntoIterator<Item = &'a BackendResult>) {
        for result in results {
            if let Some(handle) = self.handles.get(&result.backend_id) {
                handle.record(result.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{BackendError, ScriptedBackend};
    use crate::types::{BackendStatus, ErrorKind};

    fn ok(id: &str) -> BackendResult {
        BackendResult::success(id.into(), "text".into(), 10, 1)
    }

    #[test]
    fn test_happy_path_transitions() {
        let mut m = BackendLifecycle::new(Duration::from_secs(7));
        let t0 = Instant::now();
        m.accept_request(t0).unwrap();
        assert_eq!(m.state(), LifecycleState::Analyzing);

        m.complete(ok("a"), t0);
        assert_eq!(m.state(), LifecycleState::Displaying);
        assert!(!m.expire(t0 + Duration::from_secs(3)));
        assert!(m.expire(t0 + Duration::from_secs(7)));
        assert_eq!(m.state(), LifecycleState::Idle);
    }

    #[test]
    fn test_busy_retry_after() {
        let mut m = BackendLifecycle::new(Duration::from_secs(10));
        let t0 = Instant::now();
        m.accept_request(t0).unwrap();
        assert_eq!(
            m.accept_request(t0),
            Err(LifecycleError::Busy {
                state: LifecycleState::Analyzing,
                retry_after: None
            })
        );

        m.complete(ok("a"), t0);
        match m.accept_request(t0 + Duration::from_secs(4)) {
            Err(LifecycleError::Busy { state, retry_after }) => {
                assert_eq!(state, LifecycleState::Displaying);
                assert_eq!(retry_after, Some(Duration::from_secs(6)));
            }
            other => panic!("expected Busy, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_returns_to_idle() {
        let mut m = BackendLifecycle::new(Duration::from_secs(7));
        let t0 = Instant::now();
        m.accept_request(t0).unwrap();
        m.complete(
            BackendResult::failure("a".into(), ErrorKind::Transport, "refused", 5, 2),
            t0,
        );
        assert_eq!(m.state(), LifecycleState::Idle);
        assert!(m.accept_request(t0).is_ok());
    }

    #[test]
    fn test_freeze_holds_display_until_unfreeze() {
        let mut m = BackendLifecycle::new(Duration::from_secs(7));
        let t0 = Instant::now();
        assert!(m.freeze().is_err(), "cannot freeze while idle");

        m.accept_request(t0).unwrap();
        m.complete(ok("a"), t0);
        m.freeze().unwrap();
        assert!(!m.expire(t0 + Duration::from_secs(60)));
        assert_eq!(m.state(), LifecycleState::Frozen);
        assert!(matches!(
            m.accept_request(t0),
            Err(LifecycleError::Busy { state: LifecycleState::Frozen, retry_after: None })
        ));

        m.unfreeze().unwrap();
        assert_eq!(m.state(), LifecycleState::Idle);
        assert!(m.unfreeze().is_err());
    }

    #[test]
    fn test_record_external_keeps_state() {
        let mut m = BackendLifecycle::new(Duration::from_secs(7));
        m.record_external(ok("a"));
        assert_eq!(m.state(), LifecycleState::Idle);
        assert!(m.latest().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_runs_query_and_expires_display() {
        let backend: Arc<dyn AnalysisBackend> = Arc::new(
            ScriptedBackend::new("lm", ScriptedBackend::test_profile(Duration::from_secs(5)))
                .then_reply(Duration::from_secs(1), "stripper level drift"),
        );
        let cancel = CancellationToken::new();
        let (actor, handle) = LifecycleActor::new(backend);
        let task = tokio::spawn(actor.run(cancel.clone()));

        let request = AnalysisRequest {
            system: "s".into(),
            prompt: "p".into(),
        };
        let query = {
            let handle = handle.clone();
            let request = request.clone();
            tokio::spawn(async move { handle.analyze(request).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let snap = handle.status().await.unwrap();
        assert_eq!(snap.state, LifecycleState::Analyzing);
        assert!(matches!(
            handle.analyze(request.clone()).await,
            Err(LifecycleError::Busy { state: LifecycleState::Analyzing, .. })
        ));

        let result = query.await.unwrap().unwrap();
        assert_eq!(result.status, BackendStatus::Success);
        assert_eq!(handle.status().await.unwrap().state, LifecycleState::Displaying);

        // test profile displays for 7s
        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(handle.status().await.unwrap().state, LifecycleState::Idle);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_error_goes_straight_to_idle() {
        let backend: Arc<dyn AnalysisBackend> = Arc::new(
            ScriptedBackend::new("g", ScriptedBackend::test_profile(Duration::from_secs(5)))
                .then_fail(Duration::from_millis(50), BackendError::transport("401", false)),
        );
        let cancel = CancellationToken::new();
        let (actor, handle) = LifecycleActor::new(backend);
        tokio::spawn(actor.run(cancel.clone()));

        let result = handle
            .analyze(AnalysisRequest { system: "s".into(), prompt: "p".into() })
            .await
            .unwrap();
        assert_eq!(result.status, BackendStatus::Error);
        assert_eq!(handle.status().await.unwrap().state, LifecycleState::Idle);
        cancel.cancel();
    }

    struct ExplodingBackend {
        id: BackendId,
        profile: crate::llm::BackendProfile,
    }

    #[async_trait::async_trait]
    impl AnalysisBackend for ExplodingBackend {
        fn id(&self) -> &BackendId {
            &self.id
        }
        fn profile(&self) -> &crate::llm::BackendProfile {
            &self.profile
        }
        async fn analyze(&self, _: &str, _: &str) -> Result<String, BackendError> {
            panic!("malformed reply");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_actor_survives_panicking_backend() {
        let backend: Arc<dyn AnalysisBackend> = Arc::new(ExplodingBackend {
            id: "boom".into(),
            profile: ScriptedBackend::test_profile(Duration::from_secs(5)),
        });
        let cancel = CancellationToken::new();
        let (actor, handle) = LifecycleActor::new(backend);
        tokio::spawn(actor.run(cancel.clone()));
        let request = AnalysisRequest { system: "s".into(), prompt: "p".into() };

        let result = tokio::time::timeout(Duration::from_secs(60), handle.analyze(request.clone()))
            .await
            .expect("query must settle")
            .unwrap();
        assert_eq!(result.status, BackendStatus::Error);
        assert_eq!(result.error_kind, Some(ErrorKind::Internal));
        assert_eq!(handle.status().await.unwrap().state, LifecycleState::Idle);

        // still accepts work afterwards
        let again = handle.analyze(request).await.unwrap();
        assert_eq!(again.error_kind, Some(ErrorKind::Internal));
        cancel.cancel();
    }
}
