//! Service Configuration Module
//!
//! TOML configuration for the fault-explanation service.
//!
//! ## Loading Order
//!
//! 1. `--config` command-line flag
//! 2. `FAULT_EXPLAINER_CONFIG` environment variable (path to TOML file)
//! 3. `fault_explainer.toml` in the current working directory
//! 4. Built-in defaults
//!
//! The `[runtime]` section is hot-reloadable: it is held in a
//! [`RuntimeConfigHandle`] shared by the ingest actor, the HTTP API and the
//! file [`watcher`]. Everything else is read once at startup and passed to
//! the components that need it.

pub mod defaults;
mod runtime;
mod service_config;
pub mod watcher;

pub use runtime::*;
pub use service_config::*;
