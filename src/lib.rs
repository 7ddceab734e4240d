//! Tether - remote control for a local coding agent
//!
//! Tether runs next to a coding-agent CLI on the host, drives it as a
//! subprocess and exposes the live session to a mobile/web client through an
//! end-to-end encrypted relay.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          Tether Daemon                            │
//! │                                                                   │
//! │  ┌───────────────────────┐        ┌────────────────────────────┐  │
//! │  │  Session Orchestrator │◄──────►│     Permission Mediator    │  │
//! │  │  - message queue      │        │  - bounded wait, deny by   │  │
//! │  │  - mode restarts      │        │    default                 │  │
//! │  │  - abort / kill       │        └─────────────▲──────────────┘  │
//! │  └─────┬───────────▲─────┘                      │ elicitations    │
//! │        │ turns     │ native events              │                 │
//! │  ┌─────▼───────────┴─────┐        ┌─────────────┴──────────────┐  │
//! │  │    Event Translator   │        │        Agent Adapter       │  │
//! │  │  - reasoning / diffs  │◄───────│  - JSON-RPC over stdio     │  │
//! │  │  - tool call pairing  │        │  - identifier tracking     │  │
//! │  └─────┬─────────────────┘        └────────────────────────────┘  │
//! │        │ session events                                           │
//! │  ┌─────▼──────────────────────────────────────────────────────┐   │
//! │  │                   Encrypted Transport                      │   │
//! │  │  - per-scope AES-GCM  - call/ack RPC  - auto reconnect     │   │
//! │  └─────┬───────────────────────────────────────▲──────────────┘   │
//! │        │                                       │ peer RPC         │
//! │        │                       ┌───────────────┴──────────────┐   │
//! │        │                       │  Remote Execution Handlers   │   │
//! │        │                       │  bash, files, search, models │   │
//! │        │                       └──────────────────────────────┘   │
//! └────────┼──────────────────────────────────────────────────────────┘
//!          │ WebSocket
//!     ┌────▼────┐
//!     │  Relay  │◄────► mobile / web client
//!     └─────────┘
//! ```
//!
//! ## Modules
//!
//! - [`session`]: Orchestrator loop, queue, modes and the relay-side record
//! - [`agent`]: Agent subprocess adapter
//! - [`permission`]: Tool approval mediation
//! - [`translator`]: Native event normalization
//! - [`transport`]: Relay connection and encrypted RPC
//! - [`handlers`]: Remote execution RPC handlers
//! - [`crypto`]: Scoped symmetric encryption
//! - [`config`]: Configuration management

pub mod agent;
pub mod config;
pub mod crypto;
pub mod daemon;
pub mod error;
pub mod handlers;
pub mod permission;
pub mod retry;
pub mod session;
pub mod translator;
pub mod transport;

pub use config::TetherConfig;
pub use daemon::Daemon;
pub use error::{Error, Result};
