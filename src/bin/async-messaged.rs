//! async-messaged — the daemon entry point (§5, §6).
//!
//! Grounded in `eisenbahn-broker.rs`'s `Cli`/`main` shape (clap derive,
//! `tokio::select!`-based signal handling, a spawned signal task that flips
//! a shared cancellation primitive) generalized from its `BrokerConfig` onto
//! [`async_messaged::DaemonConfig`] and from its single `EventBroker::run`
//! call onto `async_messaged::router::run`. There is no worker-pool
//! equivalent in the teacher binary to borrow from directly — workers are
//! spawned by the router itself (§4.1), not by `main`.
//!
//! `daemon.py`'s `main()` forks/execs the router as a separate OS process
//! and waits on it; DESIGN.md resolves that Open Question in favor of a
//! single-process `tokio` task instead (§9), since a second process buys
//! nothing once the router and its workers already share one Rust binary.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use async_messaged::router::RouterMetrics;
use async_messaged::{router, transport::Transport, DaemonConfig};

/// Command-line overrides for [`DaemonConfig`]'s `ASYNC_MESSAGED_*`
/// environment variables (§0's CLI section) — every flag falls back to the
/// same env var `DaemonConfig::from_env` already reads, so either one works.
#[derive(Parser, Debug)]
#[command(name = "async-messaged", version, about = "Async message broker daemon for MQ/Service Bus load testing")]
struct Cli {
    /// Client-facing ROUTER bind address, e.g. `127.0.0.1:5554`.
    #[arg(long, env = "ASYNC_MESSAGED_FRONTEND_BIND")]
    frontend_bind: Option<String>,

    /// In-process back-end address workers connect to.
    #[arg(long, env = "ASYNC_MESSAGED_BACKEND_ADDRESS")]
    backend_address: Option<String>,

    /// Ceiling on concurrently live worker tasks.
    #[arg(long, env = "ASYNC_MESSAGED_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Low-water mark of idle workers the router keeps on hand.
    #[arg(long, env = "ASYNC_MESSAGED_READY_LOW_WATER_MARK")]
    ready_low_water_mark: Option<usize>,

    /// Router poll-tick interval, in seconds.
    #[arg(long, env = "ASYNC_MESSAGED_POLL_INTERVAL_SECS")]
    poll_interval_secs: Option<u64>,

    /// Seconds to wait for workers to drain before aborting them on shutdown.
    #[arg(long, env = "ASYNC_MESSAGED_ROUTER_SHUTDOWN_GRACE_SECS")]
    router_shutdown_grace_secs: Option<u64>,
}

impl Cli {
    fn into_config(self) -> DaemonConfig {
        let mut config = DaemonConfig::from_env();
        if let Some(v) = self.frontend_bind {
            config.frontend_bind = v;
        }
        if let Some(v) = self.backend_address {
            config.backend_address = v;
        }
        if let Some(v) = self.max_workers {
            config.max_workers = v;
        }
        if let Some(v) = self.ready_low_water_mark {
            config.ready_low_water_mark = v;
        }
        if let Some(v) = self.poll_interval_secs {
            config.poll_interval_secs = v;
        }
        if let Some(v) = self.router_shutdown_grace_secs {
            config.router_shutdown_grace_secs = v;
        }
        config
    }
}

/// Turns a `host:port` bind string into a TCP [`Transport`]; anything that
/// doesn't parse as `host:port` is treated as an IPC socket name instead, so
/// `--frontend-bind local-test` still works for single-host runs.
fn frontend_transport(bind: &str) -> Transport {
    match bind.rsplit_once(':') {
        Some((host, port)) if port.parse::<u16>().is_ok() => {
            Transport::tcp(host.to_string(), port.parse().expect("validated above"))
        }
        _ => Transport::ipc(bind),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let _log_guard = async_messaged::config::init_logging()?;

    setproctitle::set_title("grizzly-async-messaged");

    let config = cli.into_config();
    info!(?config, "starting async-messaged");

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone());

    let frontend = frontend_transport(&config.frontend_bind);
    let backend = Transport::inproc(&config.backend_address);
    let metrics = Arc::new(RouterMetrics::default());

    let router_cancel = cancel.clone();
    let router_handle = tokio::spawn(router::run(config, frontend, backend, router_cancel, metrics));

    // The router owns its own grace-period shutdown once `cancel` fires
    // (§5); main just waits for that one task to finish. A non-zero process
    // exit corresponds to either the router itself failing or its task
    // panicking — both propagate through `?` via `anyhow`.
    match router_handle.await {
        Ok(result) => {
            info!("router exited");
            result?;
        }
        Err(e) => {
            error!(error = %e, "router task panicked");
            return Err(e.into());
        }
    }

    Ok(())
}

/// Installs SIGINT/SIGTERM handlers that cancel `token` exactly once — a
/// second signal while already shutting down is logged and otherwise
/// ignored, rather than forcing an abrupt exit (§5's "process-wide abort
/// flag", the Rust counterpart of `daemon.py`'s single `threading.Event`).
fn install_signal_handlers(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        if token.is_cancelled() {
            warn!("repeated shutdown signal, already stopping");
            return;
        }
        info!("shutdown signal received, aborting");
        token.cancel();
    });
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}
