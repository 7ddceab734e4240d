//! Agent adapter
//!
//! Spawns the coding agent as a tool server on stdio and exposes the small
//! [`AgentBackend`] contract the session orchestrator drives.

mod client;
pub mod events;
pub mod process;
pub mod protocol;
pub mod version;

pub use client::{AgentBackend, AgentClient, StartConfig, TOOL_BASH, TOOL_PATCH};
pub use events::NativeEvent;
pub use protocol::Identifiers;
pub use version::{probe, AgentVersion};
