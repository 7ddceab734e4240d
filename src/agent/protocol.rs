//! JSON-RPC framing spoken with the agent subprocess
//!
//! Newline-delimited JSON-RPC 2.0 over stdio. The agent runs as a tool server:
//! turns are `tools/call` requests, streamed progress arrives as
//! notifications, and approvals come back to us as inbound requests.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol revision announced in `initialize`
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Tool starting a new agent session
pub const TOOL_START: &str = "codex";
/// Tool continuing an existing agent session
pub const TOOL_REPLY: &str = "codex-reply";

/// Streamed native event notification
pub const EVENT_NOTIFICATION: &str = "codex/event";
/// Inbound approval request
pub const ELICITATION_METHOD: &str = "elicitation/create";
/// Cancellation notification for an in-flight request
pub const CANCELLED_NOTIFICATION: &str = "notifications/cancelled";

/// Method-not-found error code
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Internal error code
pub const INTERNAL_ERROR: i64 = -32603;

/// Outgoing request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// Outgoing notification
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: &'static str,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response to an inbound request
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcReply {
    pub jsonrpc: &'static str,
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcReply {
    pub fn result(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: Value, code: i64, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            result: None,
            error: Some(JsonRpcError {
                code,
                message: message.into(),
                data: None,
            }),
        }
    }
}

/// One line read from the agent
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// Response to one of our requests
    Response {
        id: u64,
        result: std::result::Result<Value, JsonRpcError>,
    },
    /// Request from the agent that expects a reply
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
}

impl Incoming {
    /// Classify a decoded JSON-RPC message; `None` if it is not one
    pub fn classify(mut value: Value) -> Option<Self> {
        let obj = value.as_object_mut()?;
        let params = obj.remove("params").unwrap_or(Value::Null);

        if let Some(method) = obj.get("method").and_then(Value::as_str).map(String::from) {
            return Some(match obj.remove("id") {
                Some(id) if !id.is_null() => Incoming::Request { id, method, params },
                _ => Incoming::Notification { method, params },
            });
        }

        let id = obj.get("id").and_then(Value::as_u64)?;
        let result = match obj.remove("error") {
            Some(err) if !err.is_null() => Err(serde_json::from_value(err).unwrap_or_else(|e| {
                JsonRpcError {
                    code: INTERNAL_ERROR,
                    message: format!("Malformed error object: {}", e),
                    data: None,
                }
            })),
            _ => Ok(obj.remove("result").unwrap_or(Value::Null)),
        };
        Some(Incoming::Response { id, result })
    }
}

/// Native identifiers observed in a response or event
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Identifiers {
    pub session_id: Option<String>,
    pub conversation_id: Option<String>,
}

impl Identifiers {
    pub fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.conversation_id.is_none()
    }
}

const SESSION_KEYS: &[&str] = &["sessionId", "session_id"];
const CONVERSATION_KEYS: &[&str] = &["conversationId", "conversation_id"];
const NESTED_KEYS: &[&str] = &["meta", "_meta", "structuredContent", "msg", "data"];

fn find_string(value: &Value, keys: &[&str], depth: u8) -> Option<String> {
    let obj = value.as_object()?;
    for key in keys {
        if let Some(s) = obj.get(*key).and_then(Value::as_str) {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    if depth == 0 {
        return None;
    }
    NESTED_KEYS
        .iter()
        .filter_map(|k| obj.get(*k))
        .find_map(|nested| find_string(nested, keys, depth - 1))
}

/// Pull session and conversation ids out of a tool result or event payload.
///
/// Looks at the top level and a couple of levels of the usual envelopes
/// (`meta`, `structuredContent`, `msg`).
pub fn extract_identifiers(value: &Value) -> Identifiers {
    Identifiers {
        session_id: find_string(value, SESSION_KEYS, 2),
        conversation_id: find_string(value, CONVERSATION_KEYS, 2),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_classify_messages() {
        let resp = Incoming::classify(json!({"jsonrpc":"2.0","id":3,"result":{"ok":true}})).unwrap();
        assert_eq!(
            resp,
            Incoming::Response {
                id: 3,
                result: Ok(json!({"ok": true}))
            }
        );

        let err = Incoming::classify(
            json!({"jsonrpc":"2.0","id":4,"error":{"code":-32601,"message":"nope"}}),
        )
        .unwrap();
        match err {
            Incoming::Response { id: 4, result: Err(e) } => assert_eq!(e.code, METHOD_NOT_FOUND),
            other => panic!("unexpected {:?}", other),
        }

        let req = Incoming::classify(
            json!({"jsonrpc":"2.0","id":"e-1","method":"elicitation/create","params":{"x":1}}),
        )
        .unwrap();
        assert!(matches!(req, Incoming::Request { ref method, .. } if method == ELICITATION_METHOD));

        let note =
            Incoming::classify(json!({"jsonrpc":"2.0","method":"codex/event","params":{}})).unwrap();
        assert!(matches!(note, Incoming::Notification { .. }));

        assert!(Incoming::classify(json!([1, 2])).is_none());
        assert!(Incoming::classify(json!({"jsonrpc":"2.0"})).is_none());
    }

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(1, "initialize", None);
        let text = serde_json::to_string(&req).unwrap();
        assert_eq!(text, r#"{"jsonrpc":"2.0","id":1,"method":"initialize"}"#);
    }

    #[test]
    fn test_extract_identifiers_from_envelopes() {
        let ids = extract_identifiers(&json!({
            "content": [],
            "structuredContent": {"sessionId": "s-1", "conversationId": "c-1"}
        }));
        assert_eq!(ids.session_id.as_deref(), Some("s-1"));
        assert_eq!(ids.conversation_id.as_deref(), Some("c-1"));

        let ids = extract_identifiers(&json!({
            "msg": {"type": "session_configured", "session_id": "s-2"}
        }));
        assert_eq!(ids.session_id.as_deref(), Some("s-2"));
        assert!(ids.conversation_id.is_none());

        assert!(extract_identifiers(&json!({"sessionId": ""})).is_empty());
        assert!(extract_identifiers(&json!("text")).is_empty());
    }
}
