use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while handling a single request.
///
/// Mirrors the taxonomy every integration maps its failures onto before
/// `handle()` turns them into a `{success: false, message}` response: a
/// failure never escapes past the worker boundary as a Rust panic or an
/// unhandled error type, it is always one of these.
#[derive(Debug, Error)]
pub enum AsyncMessageError {
    /// Malformed request: missing context, unsupported/conflicting endpoint
    /// arguments, unknown URL scheme, action not valid for the integration.
    #[error("{0}")]
    Configuration(String),

    /// Retry-eligible broker condition (truncated message race, backed-out
    /// get, lock-lost receive, "no message available" re-fetch).
    #[error("{0}")]
    TransientBroker(String),

    /// Non-retryable broker failure surfaced to the client as-is.
    #[error("{0}")]
    FatalBroker(String),

    /// Azure Entra ID authentication flow failure.
    #[error("{0}")]
    Auth(String),

    /// The process-wide abort signal fired while a handler was in flight.
    #[error("abort")]
    FlowAbort,

    /// Catch-all for anything else; carries the originating type name the
    /// way the Python `handle()` wrapper records `ClassName="..."`.
    #[error("{class}: {message}")]
    Internal { class: &'static str, message: String },
}

impl AsyncMessageError {
    pub fn internal<E: std::fmt::Display>(class: &'static str, err: E) -> Self {
        Self::Internal {
            class,
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for AsyncMessageError {
    fn from(err: serde_json::Error) -> Self {
        Self::internal("serde_json::Error", err)
    }
}

/// Errors from the router/worker transport and daemon lifecycle — distinct
/// from [`AsyncMessageError`], which is scoped to a single request/response.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timeout after {0:?}")]
    Timeout(Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}
