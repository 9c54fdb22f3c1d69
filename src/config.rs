//! Daemon tunables and logging wiring (§0, §6).
//!
//! The core spec explicitly scopes out YAML/Jinja scenario configuration —
//! this module only covers the daemon's own knobs (bind address, worker
//! pool ceiling, poll cadence) plus the two environment-driven ambient
//! concerns §6 fixes as part of the external contract: log level and log
//! file placement. Grounded in `eisenbahn-broker.rs`'s `Cli`/env-var
//! convention, renamed to the `ASYNC_MESSAGED_*` namespace so it does not
//! collide with the `GRIZZLY_*` variables §6 names explicitly.

use std::path::PathBuf;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::DaemonError;

/// Daemon-level tunables, independent of any single request or client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Front-end (client-facing) ROUTER bind address.
    #[serde(default = "default_frontend_bind")]
    pub frontend_bind: String,

    /// In-process back-end address workers connect to.
    #[serde(default = "default_backend_address")]
    pub backend_address: String,

    /// Ceiling on concurrently live worker tasks (§5: `ThreadPoolExecutor(max_workers=500)`).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Low-water mark below which the router spawns a new worker before
    /// dispatching (§4.1 step 2, §9's "over-spawn" Open Question).
    #[serde(default = "default_ready_low_water_mark")]
    pub ready_low_water_mark: usize,

    /// Router poll-tick interval, in seconds (§4.1, §5).
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Seconds the daemon entry point waits for the router to exit cleanly
    /// after signalling abort, before considering it hung (§5).
    #[serde(default = "default_router_shutdown_grace_secs")]
    pub router_shutdown_grace_secs: u64,
}

fn default_frontend_bind() -> String {
    "127.0.0.1:5554".to_string()
}

fn default_backend_address() -> String {
    "workers".to_string()
}

fn default_max_workers() -> usize {
    500
}

fn default_ready_low_water_mark() -> usize {
    2
}

fn default_poll_interval_secs() -> u64 {
    1
}

fn default_router_shutdown_grace_secs() -> u64 {
    3
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            frontend_bind: default_frontend_bind(),
            backend_address: default_backend_address(),
            max_workers: default_max_workers(),
            ready_low_water_mark: default_ready_low_water_mark(),
            poll_interval_secs: default_poll_interval_secs(),
            router_shutdown_grace_secs: default_router_shutdown_grace_secs(),
        }
    }
}

impl DaemonConfig {
    /// Parse config from a TOML string, then apply `ASYNC_MESSAGED_*`
    /// environment overrides on top (env always wins over the file).
    /// Grounded in `EisenbahnConfig::from_toml`'s parse-then-override shape.
    pub fn from_toml(toml_str: &str) -> Result<Self, DaemonError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load config from a file path (§0's "toml-loadable struct").
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self, DaemonError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(DaemonError::ConfigIo)?;
        Self::from_toml(&content)
    }

    /// Load defaults, then apply `ASYNC_MESSAGED_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Environment variable overrides, applied on top of whatever the
    /// struct already holds (defaults, or a loaded TOML file).
    pub(crate) fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ASYNC_MESSAGED_FRONTEND_BIND") {
            self.frontend_bind = v;
        }
        if let Ok(v) = std::env::var("ASYNC_MESSAGED_BACKEND_ADDRESS") {
            self.backend_address = v;
        }
        if let Ok(v) = std::env::var("ASYNC_MESSAGED_MAX_WORKERS") {
            if let Ok(n) = v.parse() {
                self.max_workers = n;
            }
        }
        if let Ok(v) = std::env::var("ASYNC_MESSAGED_READY_LOW_WATER_MARK") {
            if let Ok(n) = v.parse() {
                self.ready_low_water_mark = n;
            }
        }
        if let Ok(v) = std::env::var("ASYNC_MESSAGED_POLL_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.poll_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("ASYNC_MESSAGED_ROUTER_SHUTDOWN_GRACE_SECS") {
            if let Ok(n) = v.parse() {
                self.router_shutdown_grace_secs = n;
            }
        }
    }
}

/// Maps `GRIZZLY_EXTRAS_LOGLEVEL` (`DEBUG|INFO|WARNING|ERROR`, default
/// `INFO`) onto a `tracing` level filter directive. `WARNING` is aliased to
/// `warn`, the name `tracing` actually recognizes.
fn loglevel_directive() -> String {
    let raw = std::env::var("GRIZZLY_EXTRAS_LOGLEVEL").unwrap_or_else(|_| "INFO".to_string());
    match raw.trim().to_uppercase().as_str() {
        "DEBUG" => "debug",
        "WARNING" => "warn",
        "ERROR" => "error",
        _ => "info",
    }
    .to_string()
}

/// Resolves the log directory the way `_get_log_dir()` does: `GRIZZLY_LOG_DIR`
/// is an optional subdirectory under `{GRIZZLY_CONTEXT_ROOT}/logs/`, and
/// `GRIZZLY_CONTEXT_ROOT` is required — its absence means stderr-only
/// logging (`None`), never a fatal error (§0's logging section, resolved in
/// DESIGN.md: the original raises `ValueError` and `configure_logging()`
/// catches it to fall back to stderr, so the net external behavior is the
/// same as returning `None` here).
fn log_directory() -> Option<PathBuf> {
    let context_root = std::env::var("GRIZZLY_CONTEXT_ROOT").ok()?;
    let mut dir = PathBuf::from(context_root).join("logs");
    if let Ok(log_dir) = std::env::var("GRIZZLY_LOG_DIR") {
        dir = dir.join(log_dir);
    }
    Some(dir)
}

/// Best-effort hostname lookup for the log file name. The pack carries no
/// `hostname` crate dependency and the daemon's own contract does not
/// require one just for a log file name, so this falls back through the
/// environment before settling on a fixed placeholder.
fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Initializes `tracing` for the daemon process: always a stderr layer
/// filtered by `GRIZZLY_EXTRAS_LOGLEVEL`, plus — when `GRIZZLY_CONTEXT_ROOT`
/// is set — a second non-blocking rolling-file layer under
/// `{GRIZZLY_CONTEXT_ROOT}/logs[/{GRIZZLY_LOG_DIR}]`, named
/// `async-messaged.{hostname}.{YYYYMMDDThhmmssffffff}.log`.
///
/// Returns the file appender's [`WorkerGuard`], which must be held for the
/// lifetime of the process (dropping it stops the background flush task).
pub fn init_logging() -> Result<Option<WorkerGuard>, DaemonError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(loglevel_directive()));

    let stderr_layer = fmt::layer().with_writer(std::io::stderr);

    match log_directory() {
        Some(dir) => {
            std::fs::create_dir_all(&dir).map_err(DaemonError::ConfigIo)?;
            let timestamp = Local::now().format("%Y%m%dT%H%M%S%6f");
            let filename = format!("async-messaged.{}.{timestamp}.log", hostname());
            let file_appender = tracing_appender::rolling::never(&dir, filename);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let file_layer = fmt::layer().with_writer(non_blocking).with_ansi(false);

            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .with(file_layer)
                .init();

            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr_layer)
                .init();

            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_toml_parses_partial_overrides() {
        let config = DaemonConfig::from_toml("max_workers = 10\nfrontend_bind = \"0.0.0.0:6000\"").unwrap();
        assert_eq!(config.max_workers, 10);
        assert_eq!(config.frontend_bind, "0.0.0.0:6000");
        assert_eq!(config.backend_address, "workers");
    }

    #[test]
    fn from_toml_rejects_malformed_input() {
        assert!(DaemonConfig::from_toml("not valid toml =").is_err());
    }

    #[test]
    fn defaults_match_spec_fixed_values() {
        let config = DaemonConfig::default();
        assert_eq!(config.frontend_bind, "127.0.0.1:5554");
        assert_eq!(config.backend_address, "workers");
        assert_eq!(config.max_workers, 500);
        assert_eq!(config.ready_low_water_mark, 2);
        assert_eq!(config.poll_interval_secs, 1);
        assert_eq!(config.router_shutdown_grace_secs, 3);
    }

    #[test]
    fn env_override_frontend_bind() {
        // SAFETY: test-only; each test that touches process env runs in its
        // own thread under the default single-threaded test harness here,
        // and the var is restored before returning.
        unsafe {
            std::env::set_var("ASYNC_MESSAGED_FRONTEND_BIND", "0.0.0.0:9999");
        }
        let config = DaemonConfig::from_env();
        assert_eq!(config.frontend_bind, "0.0.0.0:9999");
        unsafe {
            std::env::remove_var("ASYNC_MESSAGED_FRONTEND_BIND");
        }
    }

    #[test]
    fn env_override_max_workers() {
        unsafe {
            std::env::set_var("ASYNC_MESSAGED_MAX_WORKERS", "42");
        }
        let config = DaemonConfig::from_env();
        assert_eq!(config.max_workers, 42);
        unsafe {
            std::env::remove_var("ASYNC_MESSAGED_MAX_WORKERS");
        }
    }

    #[test]
    fn loglevel_directive_maps_warning_to_warn() {
        unsafe {
            std::env::set_var("GRIZZLY_EXTRAS_LOGLEVEL", "WARNING");
        }
        assert_eq!(loglevel_directive(), "warn");
        unsafe {
            std::env::remove_var("GRIZZLY_EXTRAS_LOGLEVEL");
        }
    }

    #[test]
    fn loglevel_directive_defaults_to_info() {
        unsafe {
            std::env::remove_var("GRIZZLY_EXTRAS_LOGLEVEL");
        }
        assert_eq!(loglevel_directive(), "info");
    }

    #[test]
    fn log_directory_nests_log_dir_under_context_root_logs() {
        unsafe {
            std::env::set_var("GRIZZLY_CONTEXT_ROOT", "/tmp/context-root");
            std::env::set_var("GRIZZLY_LOG_DIR", "my-scenario");
        }
        assert_eq!(log_directory(), Some(PathBuf::from("/tmp/context-root/logs/my-scenario")));
        unsafe {
            std::env::remove_var("GRIZZLY_CONTEXT_ROOT");
            std::env::remove_var("GRIZZLY_LOG_DIR");
        }
    }

    #[test]
    fn log_directory_without_log_dir_still_uses_context_root_logs() {
        unsafe {
            std::env::set_var("GRIZZLY_CONTEXT_ROOT", "/tmp/context-root");
            std::env::remove_var("GRIZZLY_LOG_DIR");
        }
        assert_eq!(log_directory(), Some(PathBuf::from("/tmp/context-root/logs")));
        unsafe {
            std::env::remove_var("GRIZZLY_CONTEXT_ROOT");
        }
    }

    #[test]
    fn log_directory_absent_context_root_means_stderr_only() {
        unsafe {
            std::env::remove_var("GRIZZLY_CONTEXT_ROOT");
            std::env::remove_var("GRIZZLY_LOG_DIR");
        }
        assert_eq!(log_directory(), None);
    }
}
