//! The router (§4.1): a ROUTER/ROUTER proxy between client-facing front-end
//! traffic and an in-process pool of worker tasks, replacing the Python
//! daemon's `zmq.Poller`-driven main loop with `tokio::select!`.
//!
//! Grounded in `eisenbahn-broker.rs`'s `EventBroker::run` proxy loop for the
//! bind/spawn/select shape, and in `reqrep.rs`'s `ZmqRequestServer` for the
//! ROUTER framing convention (`[identity, ...data]` on recv, identity frame
//! first on send). The worker pool itself has no teacher counterpart —
//! the closest the pack comes is the broker's single health-check
//! responder task, generalized here into an LRU-dispatched many-worker pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zeromq::prelude::*;
use zeromq::{RouterSocket, ZmqMessage};

use crate::config::DaemonConfig;
use crate::error::DaemonError;
use crate::transport::Transport;
use crate::wire::{Request, LRU_READY};

/// A worker's ZMQ routing envelope, as handed back by the crate on every
/// `RouterSocket::recv` — opaque to everything except the router itself.
type WorkerEnvelope = Bytes;

/// The router's live state: which workers exist, which are idle, and which
/// client is pinned to which worker for in-flight request affinity (§4.1
/// step 3 — a client's successive requests land on the same worker so a
/// worker's cached MQ/Service Bus connection is reused).
struct RouterState {
    workers: HashMap<String, WorkerEnvelope>,
    ready: Vec<String>,
    /// `(client, url scheme)` -> worker id, so a client's successive
    /// requests against the same broker kind land on the same worker
    /// (§4.1 step 3).
    client_affinity: HashMap<(u64, String), String>,
    /// Worker id -> the client envelope whose reply it is currently
    /// computing. Populated when a request is dispatched, consumed when the
    /// worker's reply frame comes back on the backend socket.
    pending_replies: HashMap<String, Bytes>,
    /// Every spawned worker task, tagged with its worker id so a completion
    /// observed mid-loop can be matched back to router state.
    tasks: JoinSet<(String, Result<(), DaemonError>)>,
    next_worker_id: u64,
}

impl RouterState {
    fn new() -> Self {
        Self {
            workers: HashMap::new(),
            ready: Vec::new(),
            client_affinity: HashMap::new(),
            pending_replies: HashMap::new(),
            tasks: JoinSet::new(),
            next_worker_id: 0,
        }
    }

    fn spawn_worker(&mut self, backend_endpoint: &str, cancel: CancellationToken) -> String {
        self.next_worker_id += 1;
        let worker_id = format!("w{}", self.next_worker_id);
        let endpoint = backend_endpoint.to_string();
        let id_for_task = worker_id.clone();
        self.tasks.spawn(async move {
            let result = crate::worker::run(endpoint, cancel).await;
            (id_for_task, result)
        });
        // The envelope is learned from the worker's own READY frame once it
        // arrives on the backend socket; until then the handle has no
        // envelope and cannot be dispatched to.
        self.workers.insert(worker_id.clone(), Bytes::new());
        worker_id
    }

    /// Records a worker's envelope from its READY frame and marks it ready
    /// to receive work.
    fn register_ready(&mut self, envelope: WorkerEnvelope, worker_id: &str) {
        if let Some(existing) = self.workers.get_mut(worker_id) {
            *existing = envelope;
        }
        if !self.ready.contains(&worker_id.to_string()) {
            self.ready.push(worker_id.to_string());
        }
    }

    fn take_ready_worker(&mut self) -> Option<String> {
        self.ready.pop()
    }

    fn return_worker_to_ready(&mut self, worker_id: String) {
        if self.workers.contains_key(&worker_id) && !self.ready.contains(&worker_id) {
            self.ready.push(worker_id);
        }
    }

    fn envelope_of(&self, worker_id: &str) -> Option<Bytes> {
        self.workers.get(worker_id).cloned()
    }

    fn worker_id_for_envelope(&self, envelope: &[u8]) -> Option<String> {
        self.workers
            .iter()
            .find(|(_, e)| e.as_ref() == envelope)
            .map(|(id, _)| id.clone())
    }

    /// A worker task that has exited (cleanly via DISC, or on abort) no
    /// longer has a live envelope: drop it from every index so the router
    /// never dispatches to it again (§4.1's "worker replaced on exit").
    fn remove_worker(&mut self, worker_id: &str) {
        self.workers.remove(worker_id);
        self.ready.retain(|id| id != worker_id);
        self.client_affinity.retain(|_, v| v != worker_id);
        self.pending_replies.remove(worker_id);
    }

    fn live_worker_count(&self) -> usize {
        self.workers.len()
    }
}

/// Metrics a running router exposes — analogous to `BrokerMetrics`, scoped
/// to request/worker counters instead of pub/sub topic counts.
#[derive(Debug, Default)]
pub struct RouterMetrics {
    pub requests_routed: AtomicU64,
    pub workers_spawned: AtomicU64,
}

/// Runs the router until `cancel` fires, returning once both sockets are
/// drained and every spawned worker task has exited (§4.1, §5).
pub async fn run(
    config: DaemonConfig,
    frontend: Transport,
    backend: Transport,
    cancel: CancellationToken,
    metrics: Arc<RouterMetrics>,
) -> Result<(), DaemonError> {
    let mut frontend_socket = RouterSocket::new();
    frontend_socket
        .bind(&frontend.endpoint())
        .await
        .map_err(DaemonError::Zmq)?;
    info!(endpoint = %frontend.endpoint(), "router frontend bound");

    let mut backend_socket = RouterSocket::new();
    backend_socket
        .bind(&backend.endpoint())
        .await
        .map_err(DaemonError::Zmq)?;
    info!(endpoint = %backend.endpoint(), "router backend bound");

    let mut state = RouterState::new();
    let backend_endpoint = backend.endpoint();

    for _ in 0..config.ready_low_water_mark {
        spawn_and_count(&mut state, &backend_endpoint, cancel.clone(), &metrics);
    }

    let mut tick = tokio::time::interval(Duration::from_secs(config.poll_interval_secs));

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("router received abort signal, entering shutdown");
                break;
            }
            _ = tick.tick() => {
                if state.ready.len() < config.ready_low_water_mark
                    && state.live_worker_count() < config.max_workers
                {
                    spawn_and_count(&mut state, &backend_endpoint, cancel.clone(), &metrics);
                }
            }
            received = backend_socket.recv() => {
                handle_backend_frame(received, &mut frontend_socket, &mut state).await;
            }
            received = frontend_socket.recv() => {
                handle_frontend_frame(
                    received,
                    &mut backend_socket,
                    &mut state,
                    &backend_endpoint,
                    &cancel,
                    &metrics,
                ).await;
            }
            Some(joined) = state.tasks.join_next(), if !state.tasks.is_empty() => {
                handle_worker_exit(joined, &mut state);
            }
        }
    }

    shutdown(&mut state, config.router_shutdown_grace_secs).await;
    Ok(())
}

/// A worker task ending on its own (DISC/DISCONNECT, or a fatal error) drops
/// it from every index so the router stops routing to a dead envelope; the
/// next low-water-mark tick replaces it.
fn handle_worker_exit(
    joined: Result<(String, Result<(), DaemonError>), tokio::task::JoinError>,
    state: &mut RouterState,
) {
    match joined {
        Ok((worker_id, Ok(()))) => {
            debug!(worker = %worker_id, "worker exited cleanly");
            state.remove_worker(&worker_id);
        }
        Ok((worker_id, Err(e))) => {
            warn!(worker = %worker_id, error = %e, "worker exited with an error");
            state.remove_worker(&worker_id);
        }
        Err(e) => {
            warn!(error = %e, "worker task panicked");
        }
    }
}

fn spawn_and_count(
    state: &mut RouterState,
    backend_endpoint: &str,
    cancel: CancellationToken,
    metrics: &RouterMetrics,
) {
    let worker_id = state.spawn_worker(backend_endpoint, cancel);
    metrics.workers_spawned.fetch_add(1, Ordering::Relaxed);
    debug!(worker = %worker_id, "spawned worker");
}

/// Backend traffic is either a worker's READY registration (`[envelope,
/// uuid, sentinel]`) or a reply to relay to the front-end (`[envelope,
/// request_id, response_json]`) — distinguished by whether the last frame
/// equals [`LRU_READY`] (§4.2's Open Question resolution, see DESIGN.md).
/// Relaying happens here, inline, rather than by blocking the request
/// dispatch path on a matching recv — this is what lets the router keep
/// several workers' requests in flight at once instead of serializing them.
async fn handle_backend_frame(
    received: Result<ZmqMessage, zeromq::ZmqError>,
    frontend_socket: &mut RouterSocket,
    state: &mut RouterState,
) {
    let message = match received {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "backend recv error");
            return;
        }
    };
    let frames: Vec<_> = message.iter().collect();
    if frames.len() != 3 {
        warn!(frames = frames.len(), "dropping malformed backend frame");
        return;
    }
    let envelope = frames[0].clone();

    if frames[2].as_ref() == LRU_READY {
        let worker_uuid = String::from_utf8_lossy(frames[1].as_ref()).to_string();
        let worker_id = match state.worker_id_for_envelope(envelope.as_ref()) {
            Some(id) => id,
            None => {
                // A READY for an envelope this router never spawned is a
                // protocol bug in its own backend link, not a client-facing
                // condition — log and skip rather than inventing a worker id
                // with no task behind it.
                warn!("READY from an unrecognized backend envelope");
                return;
            }
        };
        debug!(worker = %worker_id, uuid = %worker_uuid, "worker ready");
        state.register_ready(envelope, &worker_id);
        return;
    }

    let request_id_frame = frames[1].clone();
    let payload = frames[2].clone();

    let Some(worker_id) = state.worker_id_for_envelope(envelope.as_ref()) else {
        warn!("reply from an unregistered worker envelope");
        return;
    };
    let Some(client_envelope) = state.pending_replies.remove(&worker_id) else {
        warn!(worker = %worker_id, "reply with no pending client request");
        state.return_worker_to_ready(worker_id);
        return;
    };

    let mut client_reply = ZmqMessage::from(client_envelope.to_vec());
    client_reply.push_back(request_id_frame);
    client_reply.push_back(Bytes::new());
    client_reply.push_back(payload);
    if let Err(e) = frontend_socket.send(client_reply).await {
        warn!(error = %e, "failed to relay reply to client");
    }

    state.return_worker_to_ready(worker_id);
}

/// Front-end traffic is always a client request: `[client_envelope,
/// request_id, "", payload_json]` — the classic ROUTER/REQ four-frame
/// convention (§6's external contract, unlike the backend's internal,
/// delimiter-free framing).
async fn handle_frontend_frame(
    received: Result<ZmqMessage, zeromq::ZmqError>,
    backend_socket: &mut RouterSocket,
    state: &mut RouterState,
    backend_endpoint: &str,
    cancel: &CancellationToken,
    metrics: &RouterMetrics,
) {
    let message = match received {
        Ok(m) => m,
        Err(e) => {
            warn!(error = %e, "frontend recv error");
            return;
        }
    };
    let frames: Vec<_> = message.iter().collect();
    if frames.len() < 4 {
        warn!(frames = frames.len(), "dropping malformed frontend frame");
        return;
    }
    let client_envelope = frames[0].clone();
    let request_id = String::from_utf8_lossy(frames[1].as_ref()).to_string();
    let payload = frames[frames.len() - 1].clone();

    let mut request: Request = match serde_json::from_slice(payload.as_ref()) {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, "dropping frontend request with malformed JSON payload");
            return;
        }
    };

    // §4.1 step 2: an already-stamped `worker` field always wins over
    // affinity or the ready pool — the client is asking for a specific
    // worker it has already talked to.
    let worker_id = if let Some(worker) = request.worker.clone() {
        worker
    } else {
        let scheme = request
            .context
            .as_ref()
            .and_then(|c| c.url.as_deref())
            .and_then(|url| url.split_once("://"))
            .map(|(scheme, _)| scheme.to_string())
            .unwrap_or_default();
        let affinity_key = (request.client.unwrap_or_default(), scheme);

        if let Some(id) = state.client_affinity.get(&affinity_key) {
            id.clone()
        } else if let Some(id) = state.take_ready_worker() {
            state.client_affinity.insert(affinity_key, id.clone());
            id
        } else {
            if state.live_worker_count() < state.workers.len().max(1) {
                spawn_and_count(state, backend_endpoint, cancel.clone(), metrics);
            }
            warn!("no ready worker available, dropping request");
            return;
        }
    };

    let Some(envelope) = state.envelope_of(&worker_id) else {
        warn!(worker = %worker_id, "worker has no registered envelope yet");
        return;
    };
    if envelope.is_empty() {
        warn!(worker = %worker_id, "worker not yet ready, dropping request");
        return;
    }

    if request.worker.is_none() {
        request.worker = Some(worker_id.clone());
    }
    let payload = match serde_json::to_vec(&request) {
        Ok(bytes) => Bytes::from(bytes),
        Err(e) => {
            warn!(error = %e, "failed to re-serialize request with stamped worker id");
            return;
        }
    };

    let mut outbound = ZmqMessage::from(envelope.to_vec());
    outbound.push_back(request_id.clone().into_bytes().into());
    outbound.push_back(payload);

    if let Err(e) = backend_socket.send(outbound).await {
        warn!(error = %e, "failed to forward request to worker");
        return;
    }
    state.pending_replies.insert(worker_id, client_envelope);
    metrics.requests_routed.fetch_add(1, Ordering::Relaxed);
}

/// Waits up to `grace_secs` for already-cancelled worker tasks to exit on
/// their own, then aborts whatever is left (§5's shutdown grace period).
async fn shutdown(state: &mut RouterState, grace_secs: u64) {
    info!(workers = state.live_worker_count(), "waiting for workers to drain");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(grace_secs);

    loop {
        if state.tasks.is_empty() {
            break;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, state.tasks.join_next()).await {
            Ok(Some(joined)) => handle_worker_exit(joined, state),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    if !state.tasks.is_empty() {
        warn!(remaining = state.tasks.len(), "aborting workers that did not exit in time");
        state.tasks.abort_all();
    }
    info!("router shutdown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_worker_assigns_sequential_ids() {
        let mut state = RouterState::new();
        let cancel = CancellationToken::new();
        let a = state.spawn_worker("inproc://test-a", cancel.clone());
        let b = state.spawn_worker("inproc://test-a", cancel.clone());
        assert_ne!(a, b);
        assert_eq!(state.live_worker_count(), 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn register_ready_adds_to_ready_queue_once() {
        let mut state = RouterState::new();
        let cancel = CancellationToken::new();
        let worker_id = state.spawn_worker("inproc://test-b", cancel.clone());
        state.register_ready(Bytes::from_static(b"env1"), &worker_id);
        state.register_ready(Bytes::from_static(b"env1"), &worker_id);
        assert_eq!(state.ready.len(), 1);
        cancel.cancel();
    }

    #[tokio::test]
    async fn take_ready_worker_drains_the_queue() {
        let mut state = RouterState::new();
        let cancel = CancellationToken::new();
        let worker_id = state.spawn_worker("inproc://test-c", cancel.clone());
        state.register_ready(Bytes::from_static(b"env2"), &worker_id);
        assert_eq!(state.take_ready_worker(), Some(worker_id));
        assert_eq!(state.take_ready_worker(), None);
        cancel.cancel();
    }

    #[tokio::test]
    async fn remove_worker_clears_affinity_entries() {
        let mut state = RouterState::new();
        let cancel = CancellationToken::new();
        let worker_id = state.spawn_worker("inproc://test-d", cancel.clone());
        state
            .client_affinity
            .insert((1, "mq".to_string()), worker_id.clone());
        state.remove_worker(&worker_id);
        assert!(state.client_affinity.is_empty());
        assert_eq!(state.live_worker_count(), 0);
        cancel.cancel();
    }

    #[tokio::test]
    async fn worker_id_for_envelope_finds_registered_worker() {
        let mut state = RouterState::new();
        let cancel = CancellationToken::new();
        let worker_id = state.spawn_worker("inproc://test-e", cancel.clone());
        state.register_ready(Bytes::from_static(b"env3"), &worker_id);
        assert_eq!(state.worker_id_for_envelope(b"env3"), Some(worker_id));
        assert_eq!(state.worker_id_for_envelope(b"nope"), None);
        cancel.cancel();
    }
}
