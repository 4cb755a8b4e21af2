//! Config Validation Tests
//!
//! Loads full TOML files from disk the way the binary does and checks that
//! backends can be built from them without touching the network.

use fault_explainer::config::{BackendKind, BackendTier, ConfigError, PromptMode, ServiceConfig};
use fault_explainer::llm::build_backend;

const FULL_CONFIG: &str = r#"
[server]
addr = "127.0.0.1:9000"

[features]
columns = ["Reactor Pressure", "Stripper Level"]
baseline_path = "stats/tep_baseline.csv"

[detector]
alpha = 0.05

[runtime]
decimation = 3
window_size = 30
required_consecutive = 2
min_interval_secs = 10
divergence_threshold = 0.5
top_k = 4

[history]
in_memory = true
memory_capacity = 25
markdown_dir = "reports"

[session]
duration_minutes = 15
stop_source_on_shutdown = false

[prompt]
mode = "root_cause"

[[backends]]
id = "mock"
kind = "dry_run"
dry_run_delay_ms = 5

[[backends]]
id = "claude"
kind = "anthropic"
api_key = "sk-test"
timeout_secs = 20

[[backends]]
id = "gemini"
kind = "gemini"
enabled = false
"#;

fn write_config(contents: &str) -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fault_explainer.toml");
    std::fs::write(&path, contents).unwrap();
    (dir, path)
}

#[test]
fn test_full_config_loads_and_validates() {
    let (_dir, path) = write_config(FULL_CONFIG);
    let config = ServiceConfig::load_from_file(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.server.addr, "127.0.0.1:9000");
    assert_eq!(config.features.columns.len(), 2);
    assert_eq!(config.runtime.decimation, 3);
    assert_eq!(config.runtime.effective_min_context(), 15);
    assert_eq!(config.prompt.mode, PromptMode::RootCause);
    assert!(config.history.in_memory);
    assert!(!config.session.stop_source_on_shutdown);

    let claude = config.backends.iter().find(|b| b.id == "claude").unwrap();
    assert_eq!(claude.kind, BackendKind::Anthropic);
    assert_eq!(claude.tier(), BackendTier::Hosted);
    assert_eq!(claude.timeout().as_secs(), 20);
}

#[test]
fn test_enabled_backends_build_offline() {
    let (_dir, path) = write_config(FULL_CONFIG);
    let config = ServiceConfig::load_from_file(&path).unwrap();

    let built: Vec<_> = config
        .backends
        .iter()
        .filter(|b| b.enabled)
        .map(|b| build_backend(b).unwrap())
        .collect();
    let ids: Vec<_> = built.iter().map(|b| b.id().to_string()).collect();
    assert_eq!(ids, vec!["mock", "claude"]);
    assert_eq!(built[0].profile().tier, BackendTier::Local);
    assert_eq!(built[1].profile().tier, BackendTier::Hosted);
}

#[test]
fn test_invalid_values_are_all_reported() {
    let (_dir, path) = write_config(
        r#"
        [detector]
        alpha = 1.5

        [runtime]
        decimation = 0
        divergence_threshold = 2.0

        [[backends]]
        id = "mock"
        kind = "dry_run"
        enabled = false
        "#,
    );
    let config = ServiceConfig::load_from_file(&path).unwrap();
    let err = config.validate().unwrap_err();
    let messages = err.messages();

    assert!(messages.iter().any(|m| m.contains("alpha")));
    assert!(messages.iter().any(|m| m.contains("decimation")));
    assert!(messages.iter().any(|m| m.contains("divergence_threshold")));
    assert!(messages.iter().any(|m| m.contains("at least one backend")));
}

#[test]
fn test_malformed_toml_is_parse_error() {
    let (_dir, path) = write_config("[runtime\nwindow_size = ");
    assert!(matches!(
        ServiceConfig::load_from_file(&path),
        Err(ConfigError::Parse(..))
    ));
}

#[test]
fn test_unknown_backend_kind_is_parse_error() {
    let (_dir, path) = write_config("[[backends]]\nid = \"x\"\nkind = \"carrier_pigeon\"\n");
    assert!(matches!(
        ServiceConfig::load_from_file(&path),
        Err(ConfigError::Parse(..))
    ));
}
