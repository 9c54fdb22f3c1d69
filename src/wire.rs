//! Wire-level request/response schema exchanged between clients and the
//! router, and between the router and workers.
//!
//! Grounded in the `AsyncMessageContext` / `AsyncMessageRequest` /
//! `AsyncMessageResponse` TypedDicts in `async_messaged/__init__.py`, and in
//! §3/§6 of the daemon's external contract: both are plain JSON objects
//! carried as the last frame of a multipart ZeroMQ message, never MessagePack
//! — unlike the generic `Message` envelope this layer's teacher code used
//! for its own pub/sub topics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Recognized keys of `request.context`. Unrecognized keys are preserved in
/// `extra` rather than rejected — only *endpoint* strings (§6) reject unknown
/// keys, not the context object itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Context {
    pub url: Option<String>,
    pub endpoint: Option<String>,
    pub connection: Option<String>,

    // IBM MQ
    pub queue_manager: Option<String>,
    pub channel: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub key_file: Option<String>,
    pub cert_label: Option<String>,
    pub ssl_cipher: Option<String>,
    pub heartbeat_interval: Option<u32>,
    pub header_type: Option<String>,

    // Shared
    pub message_wait: Option<u64>,

    // Service Bus
    pub tenant: Option<String>,
    pub content_type: Option<String>,
    pub unique: Option<bool>,
    pub forward: Option<bool>,
    pub verbose: Option<bool>,
    pub consume: Option<bool>,
    pub metadata: Option<HashMap<String, Value>>,

    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub request_id: Option<String>,
    pub action: String,
    pub worker: Option<String>,
    pub client: Option<u64>,
    #[serde(default)]
    pub context: Option<Context>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_length: Option<usize>,
    pub response_time: u64,
}

impl Response {
    pub fn success(request_id: Option<String>, worker: String) -> Self {
        Self {
            request_id,
            worker: Some(worker),
            success: true,
            response_time: 0,
            ..Default::default()
        }
    }

    pub fn failure(request_id: Option<String>, worker: String, message: impl Into<String>) -> Self {
        Self {
            request_id,
            worker: Some(worker),
            success: false,
            message: Some(message.into()),
            response_time: 0,
            ..Default::default()
        }
    }

    pub fn abort(request_id: Option<String>, worker: String) -> Self {
        Self::failure(request_id, worker, "abort")
    }
}

/// READY sentinel a fresh worker sends to the router backend.
pub const LRU_READY: &[u8] = b"\x01";

/// Decode a raw message body to UTF-8, falling back to Latin-1 rather than
/// failing — the same leniency `JsonBytesEncoder` affords on the way out, but
/// applied on the way in, since brokers may hand back bytes that are not
/// strict UTF-8.
pub fn decode_body_lossy(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => bytes.iter().map(|&b| b as char).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let json = r#"{
            "request_id": "abc",
            "action": "PUT",
            "worker": null,
            "client": 1,
            "context": {"url": "mq://host", "endpoint": "queue:TEST"},
            "payload": "hi"
        }"#;
        let req: Request = serde_json::from_str(json).unwrap();
        assert_eq!(req.action, "PUT");
        assert_eq!(req.context.unwrap().endpoint.unwrap(), "queue:TEST");
    }

    #[test]
    fn response_omits_absent_optional_fields() {
        let resp = Response::success(Some("1".into()), "w1".into());
        let json = serde_json::to_string(&resp).unwrap();
        assert!(!json.contains("\"message\""));
        assert!(!json.contains("\"payload\""));
    }

    #[test]
    fn decode_body_lossy_falls_back_to_latin1() {
        let bytes = [0xff, 0x41];
        let s = decode_body_lossy(&bytes);
        assert_eq!(s.chars().nth(1), Some('A'));
    }
}
