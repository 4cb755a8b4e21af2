//! Polling-based config file watcher.
//!
//! Checks the config file's mtime every 2 seconds. When a change is detected,
//! waits 500ms for the write to settle, re-reads the `[runtime]` section and
//! publishes it through the [`RuntimeConfigHandle`]. Other sections need a
//! restart and are ignored here.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ConfigChange, RuntimeConfigHandle, ServiceConfig};

/// Events emitted by the config watcher.
#[derive(Debug)]
pub enum ConfigEvent {
    /// Runtime section reloaded with these changes (possibly none).
    Reloaded(Vec<ConfigChange>),
    /// Reload was attempted but failed; the previous config stays active.
    Error(String),
}

const POLL_INTERVAL: Duration = Duration::from_secs(2);

const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Run the watcher loop until `cancel` fires or the receiver goes away.
pub async fn run_config_watcher(
    path: PathBuf,
    runtime: RuntimeConfigHandle,
    tx: mpsc::Sender<ConfigEvent>,
    cancel: CancellationToken,
) {
    tracing::info!(path = %path.display(), "Config watcher started");

    let mut last_mtime = get_mtime(&path);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!("Config watcher cancelled");
                return;
            }
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }

        let Some(current) = get_mtime(&path) else {
            if last_mtime.is_some() {
                tracing::warn!(
                    path = %path.display(),
                    "Config file not accessible, keeping current config"
                );
                last_mtime = None;
            }
            continue;
        };

        if last_mtime == Some(current) {
            continue;
        }

        tokio::time::sleep(DEBOUNCE_DELAY).await;
        if get_mtime(&path) != Some(current) {
            // still being written
            continue;
        }
        last_mtime = Some(current);

        let event = match reload_runtime(&path, &runtime) {
            Ok(changes) => ConfigEvent::Reloaded(changes),
            Err(e) => {
                tracing::error!(error = %e, "Config hot-reload failed, keeping previous config");
                ConfigEvent::Error(e.to_string())
            }
        };

        if tx.send(event).await.is_err() {
            tracing::debug!("Config watcher channel closed, stopping");
            return;
        }
    }
}

/// Re-read `path` and publish its runtime section.
pub fn reload_runtime(
    path: &Path,
    runtime: &RuntimeConfigHandle,
) -> Result<Vec<ConfigChange>, super::ConfigError> {
    let config = ServiceConfig::load_from_file(path)?;
    runtime.replace(config.runtime)
}

fn get_mtime(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path)
        .ok()
        .and_then(|m| m.modified().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;

    #[test]
    fn test_reload_runtime_applies_file_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fault_explainer.toml");
        std::fs::write(&path, "[runtime]\nwindow_size = 12\ntop_k = 3\n").unwrap();

        let handle = RuntimeConfigHandle::new(RuntimeConfig::default());
        let changes = reload_runtime(&path, &handle).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(handle.load().window_size, 12);
    }

    #[test]
    fn test_reload_runtime_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fault_explainer.toml");
        std::fs::write(&path, "[runtime]\ndecimation = 0\n").unwrap();

        let handle = RuntimeConfigHandle::new(RuntimeConfig::default());
        assert!(reload_runtime(&path, &handle).is_err());
        assert_eq!(handle.load().decimation, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_stops_on_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fault_explainer.toml");
        std::fs::write(&path, "").unwrap();

        let (tx, _rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_config_watcher(
            path,
            RuntimeConfigHandle::new(RuntimeConfig::default()),
            tx,
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
