//! Worker lifecycle (§4.2).
//!
//! Grounded in `async_messaged/worker.py`'s `Worker.run`: connect to the
//! router's back-end, register with the READY sentinel, then loop —
//! instantiating exactly one [`Integration`] on the first request and
//! keeping it for the rest of the worker's life. The Python "non-blocking
//! recv + sleep(0.1) on EAGAIN" cooperative-yield pattern has no Rust
//! counterpart: `tokio::select!` over `socket.recv()` and the cancellation
//! token already multiplexes without a busy-poll loop (§4.2 **[EXPANDED]**).

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, ZmqMessage};

use crate::error::{AsyncMessageError, DaemonError};
use crate::integrations::{MqIntegration, ServiceBusIntegration};
use crate::traits::Integration;
use crate::wire::{decode_body_lossy, Request, Response, LRU_READY};

/// One worker's full lifetime: connect, register, dispatch until abort or
/// a DISC/DISCONNECT action closes the session (§4.2 steps 1–5).
pub async fn run(backend_endpoint: String, cancel: CancellationToken) -> Result<(), DaemonError> {
    let identity = Uuid::new_v4().to_string();
    let mut socket = DealerSocket::new();
    socket
        .connect(&backend_endpoint)
        .await
        .map_err(DaemonError::Zmq)?;

    info!(worker = %identity, "connecting to router back-end");

    // READY: `[identity, sentinel]` — the identity frame lets the router
    // learn the (auto-assigned, per-connection) Dealer envelope this
    // worker's application-level UUID corresponds to, since the `zeromq`
    // crate does not expose a public API for requesting a specific peer
    // identity the way `pymqi`'s REQ socket does via `setsockopt(IDENTITY,
    // ...)` (DESIGN.md's resolution of §4.2's Open Question).
    let mut ready = ZmqMessage::from(identity.as_str());
    ready.push_back(LRU_READY.to_vec().into());
    socket.send(ready).await.map_err(DaemonError::Zmq)?;

    let mut integration: Option<Box<dyn Integration>> = None;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(worker = %identity, "abort received, shutting down");
                break;
            }
            received = socket.recv() => {
                let message = received.map_err(DaemonError::Zmq)?;
                let frames: Vec<_> = message.iter().collect();
                if frames.len() != 2 {
                    warn!(worker = %identity, frames = frames.len(), "dropping malformed backend frame");
                    continue;
                }
                let request_id = String::from_utf8_lossy(frames[0].as_ref()).to_string();
                let payload = frames[1].as_ref().to_vec();

                let should_exit = dispatch(&identity, &request_id, &payload, &mut integration, &cancel, &mut socket).await?;
                if should_exit {
                    break;
                }
            }
        }
    }

    if let Some(mut integration) = integration.take() {
        integration.close().await;
    }

    Ok(())
}

/// Parses one request frame, dispatches it to the worker's integration
/// (instantiating it on the first request), and sends the reply. Returns
/// `true` if the worker loop should exit after this reply (§4.2 step 4: the
/// response's action is `DISC`/`DISCONNECT`, or the daemon is aborting).
async fn dispatch(
    identity: &str,
    request_id: &str,
    payload: &[u8],
    integration: &mut Option<Box<dyn Integration>>,
    cancel: &CancellationToken,
    socket: &mut DealerSocket,
) -> Result<bool, DaemonError> {
    let start = std::time::Instant::now();

    let request: Request = match serde_json::from_slice(payload.as_ref()) {
        Ok(r) => r,
        Err(e) => {
            let response = Response::failure(Some(request_id.to_string()), identity.to_string(), format!("malformed request: {e}"));
            return send_response(socket, request_id, response).await.map(|_| false);
        }
    };

    // §4.2 step 2: a request stamped for a different worker never touches
    // the integration.
    if let Some(worker_field) = request.worker.as_deref() {
        if worker_field != identity {
            warn!(worker = %identity, got = %worker_field, "request addressed to a different worker");
            let response = Response::failure(
                request.request_id.clone(),
                identity.to_string(),
                format!("request addressed to worker {worker_field}, not {identity}"),
            );
            return send_response(socket, request_id, response).await.map(|_| false);
        }
    }

    if integration.is_none() {
        match instantiate_integration(&request, identity) {
            Ok(built) => *integration = Some(built),
            Err(e) => {
                let response = Response::failure(request.request_id.clone(), identity.to_string(), e.to_string());
                return send_response(socket, request_id, response).await.map(|_| false);
            }
        }
    }

    let action = request.action.clone();
    let handle_result = integration
        .as_mut()
        .expect("instantiated above")
        .handle(request.clone())
        .await;

    let mut response = match handle_result {
        Ok(mut response) => {
            response.request_id = request.request_id.clone();
            response.worker = Some(identity.to_string());
            response.action = Some(action.clone());
            response
        }
        Err(e) => wrap_error(&action, &request, identity, e),
    };

    // §4.2 step 4: the process-wide abort always wins, even over a handler
    // that already completed successfully.
    if cancel.is_cancelled() {
        response = Response::abort(request.request_id.clone(), identity.to_string());
    }

    response.response_time = start.elapsed().as_millis() as u64;

    let should_exit = cancel.is_cancelled() || matches!(action.as_str(), "DISC" | "DISCONNECT");

    send_response(socket, request_id, response).await?;
    Ok(should_exit)
}

/// Wraps a handler failure the way §4.3's `handle()` contract requires:
/// `worker`/`response_time` are always present, the exception never
/// escapes past this boundary.
fn wrap_error(action: &str, request: &Request, identity: &str, error: AsyncMessageError) -> Response {
    let message = if let AsyncMessageError::Internal { class, message } = &error {
        format!("{action}: {class}=\"{message}\"")
    } else {
        error.to_string()
    };
    let mut response = Response::failure(request.request_id.clone(), identity.to_string(), message);
    response.action = Some(action.to_string());
    response
}

/// §4.2 step 3: schemes outside `{mq, mqs, sb}` are a fatal configuration
/// error, not a retryable one.
fn instantiate_integration(request: &Request, identity: &str) -> Result<Box<dyn Integration>, AsyncMessageError> {
    let url = request
        .context
        .as_ref()
        .and_then(|c| c.url.as_deref())
        .ok_or_else(|| AsyncMessageError::Configuration("context.url is required on the first request".to_string()))?;

    let scheme = url
        .split_once("://")
        .map(|(scheme, _)| scheme)
        .ok_or_else(|| AsyncMessageError::Configuration(format!("malformed url: {url}")))?;

    match scheme {
        "mq" | "mqs" => Ok(Box::new(MqIntegration::new())),
        "sb" => Ok(Box::new(ServiceBusIntegration::new(identity.to_string()))),
        other => Err(AsyncMessageError::Configuration(format!("unsupported url scheme: {other}"))),
    }
}

async fn send_response(socket: &mut DealerSocket, request_id: &str, response: Response) -> Result<(), DaemonError> {
    let body = serde_json::to_vec(&response).map_err(AsyncMessageError::from)?;
    let mut message = ZmqMessage::from(request_id);
    message.push_back(body.into());
    socket.send(message).await.map_err(DaemonError::Zmq)?;
    debug!(request_id, success = response.success, "sent response");
    Ok(())
}

impl From<AsyncMessageError> for DaemonError {
    fn from(err: AsyncMessageError) -> Self {
        DaemonError::Transport(err.to_string())
    }
}

/// Decodes a response payload for logging/tests without pulling in the
/// full dispatch path.
#[cfg(test)]
pub(crate) fn decode_response(bytes: &[u8]) -> Response {
    serde_json::from_str(&decode_body_lossy(bytes)).expect("valid response JSON")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Context;

    #[test]
    fn instantiate_integration_rejects_unknown_scheme() {
        let request = Request {
            request_id: Some("1".into()),
            action: "PUT".into(),
            worker: None,
            client: Some(1),
            context: Some(Context {
                url: Some("ftp://nope".into()),
                ..Default::default()
            }),
            payload: None,
        };
        let err = instantiate_integration(&request, "w1").unwrap_err();
        assert!(matches!(err, AsyncMessageError::Configuration(_)));
    }

    #[test]
    fn instantiate_integration_requires_url() {
        let request = Request {
            request_id: Some("1".into()),
            action: "PUT".into(),
            worker: None,
            client: Some(1),
            context: Some(Context::default()),
            payload: None,
        };
        assert!(instantiate_integration(&request, "w1").is_err());
    }

    #[test]
    fn instantiate_integration_accepts_mq_schemes() {
        for scheme in ["mq", "mqs"] {
            let request = Request {
                request_id: Some("1".into()),
                action: "PUT".into(),
                worker: None,
                client: Some(1),
                context: Some(Context {
                    url: Some(format!("{scheme}://host")),
                    ..Default::default()
                }),
                payload: None,
            };
            assert!(instantiate_integration(&request, "w1").is_ok());
        }
    }

    #[test]
    fn instantiate_integration_accepts_sb_scheme() {
        let request = Request {
            request_id: Some("1".into()),
            action: "HELLO".into(),
            worker: None,
            client: Some(1),
            context: Some(Context {
                url: Some("sb://host".into()),
                ..Default::default()
            }),
            payload: None,
        };
        assert!(instantiate_integration(&request, "w1").is_ok());
    }

    #[test]
    fn wrap_error_formats_internal_errors_with_class_name() {
        let request = Request {
            request_id: Some("1".into()),
            action: "PUT".into(),
            worker: None,
            client: Some(1),
            context: None,
            payload: None,
        };
        let error = AsyncMessageError::internal("std::num::ParseIntError", "invalid digit");
        let response = wrap_error("PUT", &request, "w1", error);
        assert!(response.message.unwrap().contains("PUT: std::num::ParseIntError=\"invalid digit\""));
    }
}
