//! Transport-side session record
//!
//! [`SessionChannel`] is everything the orchestrator needs from the relay:
//! sealed outbound events, the keepalive, readiness and the end-of-life
//! notifications. [`RemoteSession`] implements it over a [`RelayClient`] and
//! also answers permission requests on behalf of the mediator.

use crate::crypto::{EncryptionScope, ScopeId};
use crate::error::{Error, Result};
use crate::permission::{PermissionOutcome, PermissionPeer, PermissionRequest};
use crate::retry::{shrink_until, ShrinkOutcome, ShrinkPolicy};
use crate::transport::{RelayClient, RelayHttpClient};
use crate::translator::SessionEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_SESSION_ALIVE: &str = "session-alive";
pub const EVENT_SESSION_READY: &str = "session-ready";
pub const EVENT_SESSION_END: &str = "session-end";
pub const EVENT_UPDATE_METADATA: &str = "update-metadata";
pub const METHOD_PERMISSION: &str = "permission";

/// Attempts allowed when fitting an oversize event into a frame
const MAX_SHRINK_ATTEMPTS: u32 = 6;

/// What the orchestrator sends to the remote side
#[async_trait]
pub trait SessionChannel: Send + Sync {
    /// Seal and send one session event
    async fn send_event(&self, event: &SessionEvent) -> Result<()>;
    /// Liveness ping; dropped while disconnected
    fn keep_alive(&self, thinking: bool);
    /// Best-effort idle notification
    fn notify_ready(&self);
    /// Mark the record archived
    async fn archive(&self) -> Result<()>;
    fn send_session_death(&self);
    /// Withdraw the session's RPC methods and drop its encryption scope
    async fn release(&self);
    async fn flush(&self) -> Result<()>;
    fn close(&self);
}

/// Session metadata stored (sealed) on the relay
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionMetadata {
    pub path: String,
    pub host: String,
    pub pid: u32,
    pub version: String,
    pub machine_id: String,
    pub lifecycle_state: String,
    pub lifecycle_state_since: i64,
}

impl SessionMetadata {
    pub fn for_workspace(cwd: &Path, machine_id: &str) -> Self {
        let host = std::env::var("HOSTNAME")
            .ok()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| "localhost".to_string());
        Self {
            path: cwd.display().to_string(),
            host,
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            machine_id: machine_id.to_string(),
            lifecycle_state: "running".to_string(),
            lifecycle_state_since: now_ms(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Truncate every string in `value` to at most `max_chars` characters
pub fn truncate_strings(value: &Value, max_chars: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > max_chars => {
            let mut cut: String = s.chars().take(max_chars).collect();
            cut.push_str("…[truncated]");
            Value::String(cut)
        }
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| truncate_strings(item, max_chars))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), truncate_strings(v, max_chars)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Seal `content`, shrinking long strings until the blob fits `max_bytes`
pub fn seal_within(scope: &EncryptionScope, content: &Value, max_bytes: usize) -> Result<String> {
    let policy: ShrinkPolicy<usize, String> = ShrinkPolicy {
        max_attempts: MAX_SHRINK_ATTEMPTS,
        shrink: Box::new(move |limit: usize| {
            if limit == usize::MAX {
                (max_bytes / 4).max(64)
            } else {
                (limit / 2).max(16)
            }
        }),
        accept: Box::new(move |sealed: &String| sealed.len() <= max_bytes),
    };
    let outcome = shrink_until(&policy, usize::MAX, |limit: &usize| {
        if *limit == usize::MAX {
            scope.encrypt(content)
        } else {
            scope.encrypt(&truncate_strings(content, *limit))
        }
    })?;
    match outcome {
        ShrinkOutcome::Accepted { result, attempts } => {
            if attempts > 1 {
                tracing::debug!(attempts, "Shrunk oversize event to fit the frame");
            }
            Ok(result)
        }
        ShrinkOutcome::Exhausted { last, attempts } => Err(Error::Session(format!(
            "Event still {} bytes after {} attempts (limit {})",
            last.len(),
            attempts,
            max_bytes
        ))),
    }
}

pub struct RemoteSession {
    id: String,
    client: RelayClient,
    scope: Arc<EncryptionScope>,
    metadata: Mutex<SessionMetadata>,
    max_event_bytes: usize,
    flush_timeout: Duration,
}

impl RemoteSession {
    pub fn new(
        id: impl Into<String>,
        client: RelayClient,
        scope: Arc<EncryptionScope>,
        metadata: SessionMetadata,
        max_event_bytes: usize,
    ) -> Self {
        Self {
            id: id.into(),
            client,
            scope,
            metadata: Mutex::new(metadata),
            max_event_bytes,
            flush_timeout: Duration::from_secs(5),
        }
    }

    /// Create the session record on the relay and register its scope.
    ///
    /// The metadata is sealed in the machine scope since the session scope
    /// does not exist until the relay assigns an id.
    pub async fn create(
        http: &RelayHttpClient,
        client: RelayClient,
        machine_scope: &EncryptionScope,
        metadata: SessionMetadata,
        max_event_bytes: usize,
    ) -> Result<Self> {
        let sealed = machine_scope.encrypt(&serde_json::to_value(&metadata)?)?;
        let body = json!({
            "tag": uuid::Uuid::new_v4().to_string(),
            "machineId": machine_scope.id().id(),
            "metadata": sealed,
        });
        let created: CreatedSession = http.post_json("/v1/sessions", &body).await?;
        let scope = client
            .scopes()
            .register(ScopeId::Session(created.id.clone()))
            .await?;
        tracing::info!(session_id = %created.id, "Session created on relay");
        Ok(Self::new(created.id, client, scope, metadata, max_event_bytes))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn scope_id(&self) -> ScopeId {
        ScopeId::Session(self.id.clone())
    }

    pub fn scope(&self) -> &Arc<EncryptionScope> {
        &self.scope
    }

    pub fn client(&self) -> &RelayClient {
        &self.client
    }

    pub async fn metadata(&self) -> SessionMetadata {
        self.metadata.lock().await.clone()
    }

    /// Open an inbound `message` event addressed to this session
    pub fn open_message(&self, data: &Value) -> Result<Option<Value>> {
        if data.get("sid").and_then(Value::as_str) != Some(self.id.as_str()) {
            return Ok(None);
        }
        let sealed = data
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("Message event has no payload".to_string()))?;
        self.scope.decrypt(sealed).map(Some)
    }
}

#[async_trait]
impl SessionChannel for RemoteSession {
    async fn send_event(&self, event: &SessionEvent) -> Result<()> {
        let content = json!({ "role": "agent", "content": event.to_value() });
        let sealed = seal_within(&self.scope, &content, self.max_event_bytes)?;
        self.client.emit(
            EVENT_MESSAGE,
            json!({ "sid": self.id, "message": sealed }),
        )
    }

    fn keep_alive(&self, thinking: bool) {
        self.client.emit_volatile(
            EVENT_SESSION_ALIVE,
            json!({ "sid": self.id, "time": now_ms(), "thinking": thinking, "mode": "remote" }),
        );
    }

    fn notify_ready(&self) {
        if !self
            .client
            .emit_volatile(EVENT_SESSION_READY, json!({ "sid": self.id, "time": now_ms() }))
        {
            tracing::debug!(session_id = %self.id, "Ready notification dropped while offline");
        }
    }

    async fn archive(&self) -> Result<()> {
        let sealed = {
            let mut metadata = self.metadata.lock().await;
            metadata.lifecycle_state = "archived".to_string();
            metadata.lifecycle_state_since = now_ms();
            self.scope.encrypt(&serde_json::to_value(&*metadata)?)?
        };
        self.client.emit(
            EVENT_UPDATE_METADATA,
            json!({ "sid": self.id, "metadata": sealed }),
        )
    }

    fn send_session_death(&self) {
        if let Err(e) = self
            .client
            .emit(EVENT_SESSION_END, json!({ "sid": self.id, "time": now_ms() }))
        {
            tracing::warn!(session_id = %self.id, "Failed to send session end: {}", e);
        }
    }

    async fn release(&self) {
        let scope_id = self.scope_id();
        let withdrawn = self.client.unregister_scope(&scope_id).await;
        let removed = self.client.scopes().remove(&scope_id).await;
        tracing::debug!(session_id = %self.id, withdrawn, removed, "Released session scope");
    }

    async fn flush(&self) -> Result<()> {
        self.client.flush(self.flush_timeout).await
    }

    fn close(&self) {
        self.client.close();
    }
}

#[async_trait]
impl PermissionPeer for RemoteSession {
    async fn request_decision(&self, request: &PermissionRequest) -> Result<PermissionOutcome> {
        let params = serde_json::to_value(request)?;
        let result = self
            .client
            .call(METHOD_PERMISSION, &params, &self.scope_id())
            .await?;
        serde_json::from_value(result)
            .map_err(|e| Error::Rpc(format!("Malformed permission decision: {}", e)))
    }
}
