//! Session orchestration
//!
//! The per-session state (record, mode, queue), the control loop that drives
//! the agent, and the relay-side channel the loop reports through.

mod control;
mod mode;
mod orchestrator;
mod queue;
mod record;
mod remote;
mod resume;

pub use control::TurnControl;
pub use mode::{AgentPolicy, InboundMessage, Mode, PermissionLevel};
pub use orchestrator::{Orchestrator, STATUS_ABORTED, STATUS_FAULT};
pub use queue::{MessageQueue, QueuedMessage};
pub use record::{Lifecycle, Session};
pub use remote::{
    seal_within, truncate_strings, RemoteSession, SessionChannel, SessionMetadata, EVENT_MESSAGE,
    EVENT_SESSION_ALIVE, EVENT_SESSION_END, EVENT_SESSION_READY, EVENT_UPDATE_METADATA,
    METHOD_PERMISSION,
};
pub use resume::{ResumeLocator, ResumeRecord};
