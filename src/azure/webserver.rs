//! Ephemeral localhost redirect-capture server, used only when the user-auth
//! flow has no externally supplied `redirect`/`initialize` URI — the Rust
//! counterpart of `AzureAadWebserver`, which wraps a stdlib
//! `http.server.HTTPServer` in a daemon thread for the same purpose. `axum`
//! already sits in the dependency graph for other HTTP surfaces, so reaching
//! for it here avoids pulling in a second HTTP-server crate.

use std::net::SocketAddr;

use axum::extract::{Query, State};
use axum::response::Html;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::{oneshot, Mutex};
use std::sync::Arc;

/// The ephemeral server captures whatever query parameters Entra ID's
/// redirect lands with and hands them back as an opaque map — the caller
/// decodes `code`/`state`/`error` the way it already decodes a
/// statically-configured `redirect` URI's callback.
pub type CapturedRedirect = std::collections::HashMap<String, String>;

pub struct AzureAadWebserver {
    local_addr: SocketAddr,
    captured: oneshot::Receiver<CapturedRedirect>,
    shutdown: Option<oneshot::Sender<()>>,
    server_task: tokio::task::JoinHandle<()>,
}

struct ServerState {
    sender: Mutex<Option<oneshot::Sender<CapturedRedirect>>>,
}

impl AzureAadWebserver {
    /// Binds `127.0.0.1:0` (OS-assigned ephemeral port) and starts serving in
    /// the background. `redirect_uri()` reports the port to build the
    /// `redirect_uri` authorization-request parameter from.
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let local_addr = listener.local_addr()?;

        let (capture_tx, capture_rx) = oneshot::channel();
        let state = Arc::new(ServerState {
            sender: Mutex::new(Some(capture_tx)),
        });

        let app = Router::new()
            .route("/", get(capture_redirect))
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server_task = tokio::spawn(async move {
            let _ = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
        });

        Ok(Self {
            local_addr,
            captured: capture_rx,
            shutdown: Some(shutdown_tx),
            server_task,
        })
    }

    pub fn redirect_uri(&self) -> String {
        format!("http://{}/", self.local_addr)
    }

    /// Waits for Entra ID to redirect the user's browser back here, then
    /// tears the server down. Mirrors the Python server's "serve exactly one
    /// request" posture (a 0.5s-timeout poll loop bounded to a handful of
    /// iterations), expressed here as a single awaited channel receive.
    pub async fn wait_for_redirect(mut self) -> Result<CapturedRedirect, super::AuthError> {
        let result = self
            .captured
            .await
            .map_err(|_| super::AuthError::Flow("redirect capture server closed without a request".into()));

        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = self.server_task.await;

        result
    }
}

async fn capture_redirect(
    State(state): State<Arc<ServerState>>,
    Query(params): Query<CapturedRedirect>,
) -> Html<&'static str> {
    if let Some(tx) = state.sender.lock().await.take() {
        let _ = tx.send(params);
    }
    Html("<html><body>Authentication complete, you may close this window.</body></html>")
}
