//! Encrypted relay transport
//!
//! A single reconnecting WebSocket carries scoped, end-to-end encrypted RPC
//! in both directions plus plain events. The relay's HTTP API shares the
//! socket's bearer credential.

mod client;
mod frame;
mod http;
mod rpc;

pub use client::{websocket_url, RelayClient, CLIENT_TYPE_HEADER};
pub use frame::{Ack, Frame, RpcEnvelope, RPC_REGISTER_EVENT, RPC_UNREGISTER_EVENT};
pub use http::{RelayHttpClient, TokenHandle};
pub use rpc::{scoped_method, RpcHandlerRegistry};

/// Relay connection state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Last connection attempt failed
    Error(String),
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Error(e) => write!(f, "error: {}", e),
        }
    }
}
