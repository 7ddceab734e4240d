//! Relay wire protocol
//!
//! One JSON object per WebSocket text message, discriminated by `kind`.
//! Parameters and results of RPC traffic are sealed blobs; only the method
//! name and the failure string of an ack travel in plaintext.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// A single frame on the relay socket
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// First frame sent by the relay after the handshake
    Welcome {
        /// Whether the relay resumed a previous connection's state
        #[serde(default)]
        recovered: bool,
    },
    /// Host → peer RPC call
    Call(RpcEnvelope),
    /// Acknowledgement of a [`Frame::Call`]
    Ack(Ack),
    /// Peer → host RPC call, addressed to a registered `<scope>:<method>`
    Request(RpcEnvelope),
    /// Host's acknowledgement of a [`Frame::Request`]
    Response(Ack),
    /// Plain, unscoped event
    Event {
        event: String,
        #[serde(default)]
        data: serde_json::Value,
    },
}

/// Outbound RPC call: a method name and an encrypted parameter blob
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcEnvelope {
    pub id: u64,
    pub method: String,
    /// Sealed parameters
    pub params: String,
}

/// Acknowledgement of an RPC call.
///
/// `ok=true` carries a sealed `result`; `ok=false` carries a non-empty
/// plaintext `error`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub id: u64,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Ack {
    /// Successful ack with a sealed result
    pub fn success(id: u64, result: String) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    /// Failed ack; an empty message is replaced so the error is never blank
    pub fn failure(id: u64, error: impl Into<String>) -> Self {
        let error = error.into();
        let error = if error.trim().is_empty() {
            "Unknown error".to_string()
        } else {
            error
        };
        Self {
            id,
            ok: false,
            result: None,
            error: Some(error),
        }
    }

    /// Sealed result, or the failure this ack describes
    pub fn into_result(self) -> Result<String> {
        if self.ok {
            self.result
                .ok_or_else(|| Error::Rpc("Acknowledged without a result payload".to_string()))
        } else {
            Err(Error::Rpc(
                self.error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| "Unknown error".to_string()),
            ))
        }
    }
}

impl Frame {
    /// Serialize for the socket
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse a socket text message
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text)
            .map_err(|e| Error::Transport(format!("Malformed frame: {}", e)))
    }
}

/// Event announcing a host RPC method to the relay
pub const RPC_REGISTER_EVENT: &str = "rpc-register";

/// Event withdrawing a host RPC method
pub const RPC_UNREGISTER_EVENT: &str = "rpc-unregister";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_success_requires_result() {
        assert_eq!(
            Ack::success(1, "blob".to_string()).into_result().unwrap(),
            "blob"
        );

        let missing = Ack {
            id: 1,
            ok: true,
            result: None,
            error: None,
        };
        let err = missing.into_result().unwrap_err();
        assert!(err.to_string().contains("without a result"));
    }

    #[test]
    fn test_ack_failure_is_never_blank() {
        let ack = Ack::failure(2, "  ");
        assert_eq!(ack.error.as_deref(), Some("Unknown error"));

        let ack = Ack::failure(3, "Method not found");
        assert_eq!(
            ack.into_result().unwrap_err().to_string(),
            "RPC error: Method not found"
        );
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::Call(RpcEnvelope {
            id: 7,
            method: "s1:permission".to_string(),
            params: "abc".to_string(),
        });
        let json: serde_json::Value = serde_json::from_str(&frame.to_text().unwrap()).unwrap();
        assert_eq!(json["kind"], "call");
        assert_eq!(json["id"], 7);
        assert_eq!(json["method"], "s1:permission");

        let parsed = Frame::parse(r#"{"kind":"ack","id":7,"ok":false,"error":"nope"}"#).unwrap();
        assert_eq!(parsed, Frame::Ack(Ack::failure(7, "nope")));
    }

    #[test]
    fn test_welcome_defaults_to_fresh() {
        let parsed = Frame::parse(r#"{"kind":"welcome"}"#).unwrap();
        assert_eq!(parsed, Frame::Welcome { recovered: false });
    }

    #[test]
    fn test_event_without_data() {
        let parsed = Frame::parse(r#"{"kind":"event","event":"ping"}"#).unwrap();
        assert_eq!(
            parsed,
            Frame::Event {
                event: "ping".to_string(),
                data: serde_json::Value::Null
            }
        );
    }

    #[test]
    fn test_malformed_frame() {
        assert!(Frame::parse("{\"kind\":\"bogus\"}").is_err());
    }
}
