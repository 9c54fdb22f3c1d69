//! The integration contract (§4.3) — the async-trait shape this crate's
//! teacher already uses for its `EventPublisher`/`PipelineSender` traits,
//! generalized here to a single request/response `handle` call plus `close`.

use async_trait::async_trait;

use crate::error::AsyncMessageError;
use crate::wire::{Request, Response};

/// One backend integration (IBM MQ, Azure Service Bus). A worker owns
/// exactly one, chosen by the URL scheme of the first request it receives,
/// and keeps it for the worker's lifetime.
#[async_trait]
pub trait Integration: Send + Sync {
    /// Dispatches `request.action` to the integration's internal handler
    /// table and returns the response to send back to the client — the Rust
    /// counterpart of `get_handler(action)` followed by invoking it.
    async fn handle(&mut self, request: Request) -> Result<Response, AsyncMessageError>;

    /// Releases every cached sender/receiver/connection. Called when a
    /// worker is torn down (DISC/DISCONNECT, or the router shutting down).
    async fn close(&mut self);
}
