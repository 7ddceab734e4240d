//! Agent adapter
//!
//! Drives one agent subprocess: starts and continues sessions, tracks the
//! native session/conversation identifiers, forwards streamed events, and
//! routes approval requests to the permission mediator.

use super::events::NativeEvent;
use super::process::{method_not_found, InboundHandler, StdioRpc};
use super::protocol::{
    extract_identifiers, Identifiers, ELICITATION_METHOD, EVENT_NOTIFICATION, PROTOCOL_VERSION,
    TOOL_REPLY, TOOL_START,
};
use crate::config::AgentConfig;
use crate::error::{Error, Result};
use crate::permission::{ElicitationHandler, PermissionOutcome};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Tool name for command approvals
pub const TOOL_BASH: &str = "CodexBash";
/// Tool name for patch approvals
pub const TOOL_PATCH: &str = "CodexPatch";

/// Parameters of a new agent session
#[derive(Debug, Clone, PartialEq)]
pub struct StartConfig {
    pub prompt: String,
    pub approval_policy: String,
    pub sandbox: String,
    pub model: Option<String>,
    pub cwd: PathBuf,
    /// Transcript to resume from
    pub resume: Option<PathBuf>,
}

impl StartConfig {
    /// `tools/call` arguments for the start tool
    pub fn to_arguments(&self) -> Value {
        let mut args = json!({
            "prompt": self.prompt,
            "approval-policy": self.approval_policy,
            "sandbox": self.sandbox,
            "cwd": self.cwd.display().to_string(),
        });
        if let Some(model) = &self.model {
            args["model"] = json!(model);
        }
        if let Some(resume) = &self.resume {
            args["config"] = json!({ "experimental_resume": resume.display().to_string() });
        }
        args
    }
}

/// Process-control contract used by the orchestrator
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn connect(&self) -> Result<()>;
    async fn start_session(&self, config: StartConfig, cancel: CancellationToken) -> Result<Value>;
    async fn continue_session(&self, prompt: &str, cancel: CancellationToken) -> Result<Value>;
    async fn session_id(&self) -> Option<String>;
    /// Session and conversation identifiers currently held
    async fn identifiers(&self) -> Identifiers {
        Identifiers {
            session_id: self.session_id().await,
            conversation_id: None,
        }
    }
    /// Forget native identifiers
    async fn clear_session(&self);
    /// Graceful stop; identifiers survive
    async fn disconnect(&self) -> Result<()>;
    /// Disconnect and forget identifiers
    async fn force_close(&self) -> Result<()>;
}

#[derive(Debug, Default)]
struct TrackedIds {
    ids: Identifiers,
    /// Fields set from events during the current call
    session_from_event: bool,
    conversation_from_event: bool,
}

impl TrackedIds {
    fn begin_call(&mut self) {
        self.session_from_event = false;
        self.conversation_from_event = false;
    }

    fn apply_event(&mut self, seen: Identifiers) {
        if let Some(id) = seen.session_id {
            self.ids.session_id = Some(id);
            self.session_from_event = true;
        }
        if let Some(id) = seen.conversation_id {
            self.ids.conversation_id = Some(id);
            self.conversation_from_event = true;
        }
    }

    fn apply_response(&mut self, seen: Identifiers) {
        if let Some(id) = seen.session_id {
            if !self.session_from_event {
                self.ids.session_id = Some(id);
            }
        }
        if let Some(id) = seen.conversation_id {
            if !self.conversation_from_event {
                self.ids.conversation_id = Some(id);
            }
        }
    }
}

fn lock_ids(ids: &StdMutex<TrackedIds>) -> std::sync::MutexGuard<'_, TrackedIds> {
    match ids.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[derive(Debug, Deserialize)]
struct ElicitationParams {
    #[serde(default)]
    codex_elicitation: Option<String>,
    #[serde(default)]
    codex_call_id: Option<String>,
    #[serde(default)]
    codex_command: Option<Value>,
    #[serde(default)]
    codex_cwd: Option<String>,
    #[serde(default)]
    codex_changes: Option<Value>,
    #[serde(default)]
    codex_reason: Option<String>,
}

impl ElicitationParams {
    fn tool_name(&self) -> &'static str {
        match self.codex_elicitation.as_deref() {
            Some("patch-approval") => TOOL_PATCH,
            Some("exec-approval") => TOOL_BASH,
            _ if self.codex_changes.is_some() => TOOL_PATCH,
            _ => TOOL_BASH,
        }
    }

    fn payload(&self) -> Value {
        let mut payload = if self.tool_name() == TOOL_PATCH {
            json!({ "changes": self.codex_changes.clone().unwrap_or(Value::Null) })
        } else {
            json!({
                "command": self.codex_command.clone().unwrap_or(Value::Null),
                "cwd": self.codex_cwd,
            })
        };
        if let Some(reason) = &self.codex_reason {
            payload["reason"] = json!(reason);
        }
        payload
    }
}

/// Receives what the agent sends on its own initiative
struct AgentInbound {
    ids: Arc<StdMutex<TrackedIds>>,
    events: mpsc::UnboundedSender<NativeEvent>,
    elicitation: Option<Arc<dyn ElicitationHandler>>,
}

#[async_trait]
impl InboundHandler for AgentInbound {
    fn on_notification(&self, method: &str, params: Value) {
        if method != EVENT_NOTIFICATION {
            tracing::trace!(method = %method, "Ignoring agent notification");
            return;
        }
        let seen = extract_identifiers(&params);
        if !seen.is_empty() {
            lock_ids(&self.ids).apply_event(seen);
        }
        let event = NativeEvent::from_notification(&params);
        if self.events.send(event).is_err() {
            tracing::debug!("Event consumer gone, dropping agent event");
        }
    }

    async fn on_request(&self, method: &str, params: Value) -> Result<Value> {
        match method {
            ELICITATION_METHOD => {
                let request: ElicitationParams = serde_json::from_value(params)?;
                let call_id = request
                    .codex_call_id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                let outcome = match &self.elicitation {
                    Some(handler) => {
                        handler
                            .handle(&call_id, request.tool_name(), request.payload())
                            .await
                    }
                    None => PermissionOutcome::denied("No permission handler attached"),
                };
                Ok(json!({ "decision": outcome.decision }))
            }
            "ping" => Ok(json!({})),
            other => Err(method_not_found(other)),
        }
    }
}

/// Agent adapter over a stdio subprocess
pub struct AgentClient {
    config: AgentConfig,
    subcommand: String,
    cwd: PathBuf,
    rpc: Mutex<Option<Arc<StdioRpc>>>,
    ids: Arc<StdMutex<TrackedIds>>,
    events: mpsc::UnboundedSender<NativeEvent>,
    elicitation: Option<Arc<dyn ElicitationHandler>>,
}

impl AgentClient {
    pub fn new(
        config: AgentConfig,
        subcommand: impl Into<String>,
        cwd: PathBuf,
        events: mpsc::UnboundedSender<NativeEvent>,
        elicitation: Option<Arc<dyn ElicitationHandler>>,
    ) -> Self {
        Self {
            config,
            subcommand: subcommand.into(),
            cwd,
            rpc: Mutex::new(None),
            ids: Arc::new(StdMutex::new(TrackedIds::default())),
            events,
            elicitation,
        }
    }

    /// Conversation id, falling back to the session id when the agent never
    /// reported one
    pub fn conversation_id(&self) -> Option<String> {
        let ids = lock_ids(&self.ids);
        ids.ids
            .conversation_id
            .clone()
            .or_else(|| ids.ids.session_id.clone())
    }

    async fn connected_rpc(&self) -> Result<Arc<StdioRpc>> {
        self.connect().await?;
        self.rpc
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Agent("Agent is not connected".to_string()))
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let rpc = self.connected_rpc().await?;
        lock_ids(&self.ids).begin_call();
        let params = json!({ "name": name, "arguments": arguments });
        let response = rpc
            .request("tools/call", Some(params), Some(cancel), None)
            .await?;
        lock_ids(&self.ids).apply_response(extract_identifiers(&response));
        Ok(response)
    }
}

#[async_trait]
impl AgentBackend for AgentClient {
    async fn connect(&self) -> Result<()> {
        let mut slot = self.rpc.lock().await;
        if let Some(rpc) = slot.as_ref() {
            if rpc.is_connected() {
                return Ok(());
            }
            tracing::info!("Agent process gone, reconnecting");
        }

        let inbound = Arc::new(AgentInbound {
            ids: self.ids.clone(),
            events: self.events.clone(),
            elicitation: self.elicitation.clone(),
        });
        let rpc = StdioRpc::spawn(
            &self.config.binary,
            std::slice::from_ref(&self.subcommand),
            &self.cwd,
            &self.config.env,
            inbound,
        )
        .await?;

        let init = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": { "elicitation": {} },
            "clientInfo": { "name": "tether", "version": env!("CARGO_PKG_VERSION") },
        });
        let timeout = Duration::from_secs(self.config.request_timeout_secs);
        if let Err(e) = rpc
            .request("initialize", Some(init), None, Some(timeout))
            .await
        {
            rpc.shutdown().await;
            return Err(Error::Agent(format!("Agent initialization failed: {}", e)));
        }
        rpc.notify("notifications/initialized", None).await?;

        tracing::info!(subcommand = %self.subcommand, "Agent connected");
        *slot = Some(Arc::new(rpc));
        Ok(())
    }

    async fn start_session(&self, config: StartConfig, cancel: CancellationToken) -> Result<Value> {
        tracing::info!(
            approval_policy = %config.approval_policy,
            sandbox = %config.sandbox,
            model = ?config.model,
            resume = ?config.resume,
            "Starting agent session"
        );
        self.call_tool(TOOL_START, config.to_arguments(), &cancel)
            .await
    }

    async fn continue_session(&self, prompt: &str, cancel: CancellationToken) -> Result<Value> {
        let session_id = self
            .session_id()
            .await
            .ok_or_else(|| Error::Session("No active agent session to continue".to_string()))?;
        let conversation_id = self.conversation_id().unwrap_or_else(|| session_id.clone());
        let arguments = json!({
            "sessionId": session_id,
            "conversationId": conversation_id,
            "prompt": prompt,
        });
        self.call_tool(TOOL_REPLY, arguments, &cancel).await
    }

    async fn session_id(&self) -> Option<String> {
        lock_ids(&self.ids).ids.session_id.clone()
    }

    async fn identifiers(&self) -> Identifiers {
        lock_ids(&self.ids).ids.clone()
    }

    async fn clear_session(&self) {
        *lock_ids(&self.ids) = TrackedIds::default();
    }

    async fn disconnect(&self) -> Result<()> {
        let rpc = self.rpc.lock().await.take();
        if let Some(rpc) = rpc {
            tracing::info!(pid = ?rpc.pid(), "Disconnecting agent");
            rpc.shutdown().await;
        }
        Ok(())
    }

    async fn force_close(&self) -> Result<()> {
        let result = self.disconnect().await;
        self.clear_session().await;
        result
    }
}
