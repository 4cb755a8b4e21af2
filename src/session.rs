//! Premium Session
//!
//! Hosted backends cost money per call, so they only run inside a time-boxed
//! session. Switching any hosted backend on opens the session; when it runs
//! out (or is ended by hand) every hosted backend is switched off and a
//! [`ShutdownNotice`] goes out on a broadcast channel that any component can
//! subscribe to.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{defaults, BackendTier};
use crate::llm::{BackendRegistry, RegistryError};
use crate::types::BackendId;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("no premium session is running")]
    NotActive,

    #[error("extension must be between 1 and {max} minutes")]
    InvalidExtension { max: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownReason {
    Expired,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShutdownNotice {
    pub reason: ShutdownReason,
    pub at: DateTime<Utc>,
    /// Hosted backends that were switched off.
    pub disabled: Vec<BackendId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub active: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub elapsed_secs: u64,
    pub remaining_secs: u64,
    pub duration_secs: u64,
    pub hosted_active: Vec<BackendId>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToggleOutcome {
    pub backend_id: BackendId,
    pub active: bool,
    pub previous: bool,
    pub session_started: bool,
}

#[derive(Debug)]
struct Running {
    started: Instant,
    started_at: DateTime<Utc>,
    duration: Duration,
}

const MAX_EXTENSION_MINUTES: u64 = 24 * 60;

#[derive(Clone)]
pub struct PremiumSession {
    registry: BackendRegistry,
    duration: Duration,
    running: Arc<Mutex<Option<Running>>>,
    notices: broadcast::Sender<ShutdownNotice>,
}

impl PremiumSession {
    pub fn new(registry: BackendRegistry, duration: Duration) -> Self {
        let (notices, _) = broadcast::channel(8);
        Self {
            registry,
            duration,
            running: Arc::new(Mutex::new(None)),
            notices,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| {
            warn!("Session lock poisoned, recovering");
            e.into_inner()
        })
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ShutdownNotice> {
        self.notices.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.lock().is_some()
    }

    /// Switch a backend on or off. Turning a hosted backend on opens the
    /// session if none is running; turning the last one off closes it.
    pub fn toggle(&self, id: &BackendId, on: bool) -> Result<ToggleOutcome, SessionError> {
        let previous = self.registry.set_active(id, on)?;
        let hosted = self.registry.tier(id) == Some(BackendTier::Hosted);

        let mut session_started = false;
        if hosted && on {
            session_started = self.start();
        } else if hosted && self.registry.hosted_active().is_empty() {
            if self.lock().take().is_some() {
                info!("Last hosted backend switched off, premium session closed");
            }
        }

        Ok(ToggleOutcome {
            backend_id: id.clone(),
            active: on,
            previous,
            session_started,
        })
    }

    /// Open the session if it is not already running.
    pub fn start(&self) -> bool {
        let mut running = self.lock();
        if running.is_some() {
            return false;
        }
        *running = Some(Running {
            started: Instant::now(),
            started_at: Utc::now(),
            duration: self.duration,
        });
        info!(
            minutes = self.duration.as_secs() / 60,
            "⏰ Premium session started, hosted backends will switch off when it expires"
        );
        true
    }

    pub fn status(&self, now: Instant) -> SessionStatus {
        let hosted_active = self.registry.hosted_active();
        match self.lock().as_ref() {
            Some(r) => {
                let elapsed = now.saturating_duration_since(r.started);
                SessionStatus {
                    active: true,
                    started_at: Some(r.started_at),
                    elapsed_secs: elapsed.as_secs(),
                    remaining_secs: r.duration.saturating_sub(elapsed).as_secs(),
                    duration_secs: r.duration.as_secs(),
                    hosted_active,
                }
            }
            None => SessionStatus {
                active: false,
                started_at: None,
                elapsed_secs: 0,
                remaining_secs: 0,
                duration_secs: self.duration.as_secs(),
                hosted_active,
            },
        }
    }

    pub fn extend(&self, minutes: u64) -> Result<SessionStatus, SessionError> {
        if minutes == 0 || minutes > MAX_EXTENSION_MINUTES {
            return Err(SessionError::InvalidExtension {
                max: MAX_EXTENSION_MINUTES,
            });
        }
        {
            let mut running = self.lock();
            let r = running.as_mut().ok_or(SessionError::NotActive)?;
            r.duration += Duration::from_secs(minutes * 60);
            info!(added_minutes = minutes, total_minutes = r.duration.as_secs() / 60, "Premium session extended");
        }
        Ok(self.status(Instant::now()))
    }

    /// Switch every hosted backend off and notify subscribers.
    pub fn shutdown(&self, reason: ShutdownReason) -> ShutdownNotice {
        self.lock().take();
        let disabled = self.registry.deactivate_hosted();
        let notice = ShutdownNotice {
            reason,
            at: Utc::now(),
            disabled,
        };
        warn!(reason = ?reason, disabled = ?notice.disabled, "🛑 Premium session ended, hosted backends switched off");
        // no receivers is fine
        let _ = self.notices.send(notice.clone());
        notice
    }

    /// Returns a notice if the session had run out and was shut down.
    pub fn check_expiry(&self, now: Instant) -> Option<ShutdownNotice> {
        let expired = self
            .lock()
            .as_ref()
            .is_some_and(|r| now.saturating_duration_since(r.started) >= r.duration);
        expired.then(|| self.shutdown(ShutdownReason::Expired))
    }

    /// Expiry monitor task.
    pub async fn run_monitor(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(defaults::SESSION_POLL_MS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.check_expiry(Instant::now());
                }
            }
        }
    }
}
