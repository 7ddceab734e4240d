//! Daemon wiring
//!
//! Builds every component for one working directory, connects them and runs
//! until the session is killed (remotely or by Ctrl+C).

use crate::agent::{probe, AgentClient, AgentVersion};
use crate::config::TetherConfig;
use crate::crypto::{MasterSecret, ScopeId, ScopeRegistry};
use crate::error::{Error, Result};
use crate::handlers::{self, HandlerContext, ModelCatalog, ModelProvider};
use crate::permission::PermissionMediator;
use crate::session::{
    InboundMessage, Mode, Orchestrator, QueuedMessage, RemoteSession, ResumeLocator, Session,
    SessionChannel, SessionMetadata, TurnControl, EVENT_MESSAGE,
};
use crate::transport::{RelayClient, RelayHttpClient};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, RwLock};

/// Client type announced to the relay
pub const CLIENT_TYPE: &str = "session-scoped";

/// Daemon state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    ShuttingDown,
}

/// Mode most recently requested by the operator; messages without mode
/// metadata inherit from it
#[derive(Debug, Default)]
pub struct RequestedMode(StdMutex<Mode>);

impl RequestedMode {
    /// Decode an opened `message` payload and tag it with its mode
    pub fn accept(&self, payload: &Value) -> Result<QueuedMessage> {
        let message = InboundMessage::decode(payload)?;
        let mut current = match self.0.lock() {
            Ok(mode) => mode,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mode = message.resolve_mode(&current);
        *current = mode.clone();
        Ok(QueuedMessage::new(message.text, message.attachments, mode))
    }
}

struct Running {
    client: RelayClient,
    orchestrator: Arc<Orchestrator>,
}

pub struct Daemon {
    config: TetherConfig,
    /// File the configuration was loaded from, re-read on SIGHUP
    config_path: Option<PathBuf>,
    cwd: PathBuf,
    state: RwLock<DaemonState>,
    running: RwLock<Option<Running>>,
}

impl Daemon {
    pub fn new(config: TetherConfig, cwd: PathBuf) -> Self {
        Self {
            config,
            config_path: None,
            cwd,
            state: RwLock::new(DaemonState::Stopped),
            running: RwLock::new(None),
        }
    }

    /// Remember where the configuration came from so it can be reloaded
    pub fn with_config_path(mut self, path: Option<PathBuf>) -> Self {
        self.config_path = path;
        self
    }

    pub async fn state(&self) -> DaemonState {
        *self.state.read().await
    }

    /// Probe the agent, register the session and start the loop
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != DaemonState::Stopped {
                return Err(Error::Session("Daemon already running".to_string()));
            }
            *state = DaemonState::Starting;
        }

        match self.start_inner().await {
            Ok(running) => {
                *self.running.write().await = Some(running);
                *self.state.write().await = DaemonState::Running;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = DaemonState::Stopped;
                Err(e)
            }
        }
    }

    async fn start_inner(&self) -> Result<Running> {
        self.config.validate()?;
        let cwd = std::fs::canonicalize(&self.cwd).map_err(|e| {
            Error::Config(format!("Working directory {}: {}", self.cwd.display(), e))
        })?;

        let version: AgentVersion = probe(
            &self.config.agent.binary,
            &self.config.agent.mcp_server_min_version,
        )
        .await?;
        tracing::info!(
            binary = %self.config.agent.binary,
            version = ?version.version.as_ref().map(|v| v.to_string()),
            subcommand = version.subcommand,
            "Agent found"
        );

        let master = match &self.config.storage.secret {
            Some(secret) => MasterSecret::from_base64(secret)?,
            None => {
                tracing::warn!("No storage.secret configured; generated an ephemeral one (the client cannot decrypt this session unless paired with it)");
                MasterSecret::generate()
            }
        };
        let machine_id = self
            .config
            .storage
            .machine_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let scopes = Arc::new(ScopeRegistry::new(master));
        let machine_scope_id = ScopeId::Machine(machine_id.clone());
        let machine_scope = scopes.register(machine_scope_id.clone()).await?;

        let client = RelayClient::start(self.config.relay.clone(), CLIENT_TYPE, scopes);
        let wired = async {
            let http = RelayHttpClient::new(
                &self.config.relay.url,
                client.token_handle(),
                Duration::from_secs(self.config.relay.call_timeout_secs),
            )?;

            let remote = Arc::new(
                RemoteSession::create(
                    &http,
                    client.clone(),
                    &machine_scope,
                    SessionMetadata::for_workspace(&cwd, &machine_id),
                    self.config.session.max_event_bytes,
                )
                .await?,
            );
            let session_scope = remote.scope_id();
            let session = Arc::new(Session::new(remote.id(), cwd.clone()));

            let turn = Arc::new(TurnControl::new());
            let mediator = Arc::new(PermissionMediator::new(
                turn.clone(),
                Duration::from_secs(self.config.session.permission_timeout_secs),
            ));
            mediator.attach_peer(remote.clone()).await;

            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let backend = Arc::new(AgentClient::new(
                self.config.agent.clone(),
                version.subcommand,
                cwd.clone(),
                events_tx,
                Some(mediator.clone()),
            ));

            let orchestrator = Orchestrator::new(
                session,
                backend,
                remote.clone(),
                mediator,
                turn,
                ResumeLocator::new(self.config.session.transcripts_dir()),
                Duration::from_millis(self.config.session.keepalive_interval_ms),
            );

            // Remote execution
            let provider: Arc<dyn ModelProvider> = Arc::new(http.clone());
            let models = ModelCatalog::new(
                Some(provider),
                Duration::from_secs(self.config.models.cache_ttl_secs),
            );
            let ctx = Arc::new(HandlerContext::new(&cwd, self.config.sandbox.clone(), models)?);
            handlers::register_session_handlers(&client, &session_scope, &ctx).await;
            handlers::register_machine_handlers(&client, &machine_scope_id, &ctx).await;

            // Session control
            let target = orchestrator.clone();
            client
                .register_rpc(&session_scope, "abort", move |_params| {
                    let target = target.clone();
                    async move {
                        let aborted = target.abort();
                        Ok(json!({ "success": true, "aborted": aborted }))
                    }
                })
                .await;
            let target = orchestrator.clone();
            client
                .register_rpc(&session_scope, "killSession", move |_params| {
                    let target = target.clone();
                    async move {
                        // The ack must go out before the channel closes.
                        tokio::spawn(async move { target.kill().await });
                        Ok(json!({ "success": true, "message": "Killing session" }))
                    }
                })
                .await;

            // Inbound user messages
            let requested = Arc::new(RequestedMode::default());
            let target = orchestrator.clone();
            let inbox = remote.clone();
            client
                .subscribe(EVENT_MESSAGE, move |data| {
                    let payload = match inbox.open_message(&data) {
                        Ok(Some(payload)) => payload,
                        Ok(None) => return,
                        Err(e) => {
                            tracing::warn!("Dropping undecryptable message: {}", e);
                            return;
                        }
                    };
                    match requested.accept(&payload) {
                        Ok(message) => {
                            target.enqueue(message);
                        }
                        Err(e) => tracing::warn!("Dropping malformed message: {}", e),
                    }
                })
                .await;

            let target = orchestrator.clone();
            let channel = remote.clone();
            client
                .on_reconnect(move || {
                    tracing::info!("Relay session re-established, re-syncing state");
                    channel.keep_alive(target.is_thinking());
                })
                .await;

            tokio::spawn(orchestrator.clone().run(events_rx));

            tracing::info!(
                session_id = %remote.id(),
                cwd = %cwd.display(),
                "Session ready for remote control"
            );
            Ok::<_, Error>(orchestrator)
        }
        .await;

        let orchestrator = closing_on_error(&client, wired)?;
        Ok(Running {
            client,
            orchestrator,
        })
    }

    /// Wait for a kill from the peer or Ctrl+C; SIGHUP reloads the relay
    /// credential
    pub async fn run_until_shutdown(&self) -> Result<()> {
        let orchestrator = match self.running.read().await.as_ref() {
            Some(running) => running.orchestrator.clone(),
            None => return Err(Error::Session("Daemon is not running".to_string())),
        };
        let mut hangup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = orchestrator.wait_killed() => {
                    tracing::info!("Session killed remotely");
                    break;
                }
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                    }
                    tracing::info!("Interrupted, shutting down");
                    break;
                }
                _ = hangup.recv() => {
                    if let Err(e) = self.reload_credential().await {
                        tracing::warn!("Failed to reload relay credential: {}", e);
                    }
                }
            }
        }
        self.stop().await;
        Ok(())
    }

    /// Re-read `relay.token` from the configuration file and rotate the
    /// relay credential. Returns whether the credential changed.
    pub async fn reload_credential(&self) -> Result<bool> {
        let Some(path) = self.config_path.as_deref() else {
            tracing::info!("No configuration file to reload the relay credential from");
            return Ok(false);
        };
        let config = TetherConfig::load(path)?;
        if config.relay.token.is_empty() {
            return Err(Error::Config(format!(
                "relay.token is empty in {}",
                path.display()
            )));
        }
        match self.running.read().await.as_ref() {
            Some(running) => Ok(running.client.update_token(&config.relay.token).await),
            None => Err(Error::Session("Daemon is not running".to_string())),
        }
    }

    /// Kill the session and close the relay connection
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state != DaemonState::Running {
                return;
            }
            *state = DaemonState::ShuttingDown;
        }
        if let Some(running) = self.running.write().await.take() {
            running.orchestrator.kill().await;
            running.client.close();
        }
        *self.state.write().await = DaemonState::Stopped;
        tracing::info!("Daemon stopped");
    }
}

/// Close a started relay client when a later startup step failed
fn closing_on_error<T>(client: &RelayClient, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        tracing::warn!("Startup failed after connecting to the relay: {}", e);
        client.close();
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PermissionLevel;

    #[test]
    fn test_requested_mode_is_sticky() {
        let requested = RequestedMode::default();

        let first = requested
            .accept(&json!({
                "role": "user",
                "content": {"type": "text", "text": "a"},
                "meta": {"permissionMode": "safe-yolo", "model": "gpt-5"}
            }))
            .unwrap();
        assert_eq!(first.mode.permission_level, PermissionLevel::SafeYolo);
        assert_eq!(first.mode.model.as_deref(), Some("gpt-5"));

        let second = requested
            .accept(&json!({"role": "user", "content": {"type": "text", "text": "b"}}))
            .unwrap();
        assert_eq!(second.mode, first.mode);
        assert_eq!(second.text, "b");

        assert!(requested.accept(&json!({"role": "user"})).is_err());
    }

    #[tokio::test]
    async fn test_start_fails_fast_on_invalid_config() {
        let dir = tempfile::TempDir::new().unwrap();
        let daemon = Daemon::new(TetherConfig::default(), dir.path().to_path_buf());
        let err = daemon.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(daemon.state().await, DaemonState::Stopped);
    }

    #[tokio::test]
    async fn test_failed_startup_closes_relay_client() {
        let scopes = Arc::new(ScopeRegistry::new(MasterSecret::generate()));
        let mut relay = TetherConfig::default().relay;
        relay.url = "http://127.0.0.1:9".to_string();
        relay.token = "t".to_string();
        let client = RelayClient::start(relay, CLIENT_TYPE, scopes);

        assert_eq!(closing_on_error(&client, Ok(7)).unwrap(), 7);
        assert!(!client.is_closed());

        let failed: Result<()> = Err(Error::Transport("session create failed".to_string()));
        assert!(closing_on_error(&client, failed).is_err());
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_reload_credential_requires_config_and_running_daemon() {
        let dir = tempfile::TempDir::new().unwrap();
        let daemon = Daemon::new(TetherConfig::default(), dir.path().to_path_buf());
        assert!(!daemon.reload_credential().await.unwrap());

        let path = dir.path().join("tether.toml");
        std::fs::write(&path, "[relay]\ntoken = \"\"\n").unwrap();
        let daemon = Daemon::new(TetherConfig::default(), dir.path().to_path_buf())
            .with_config_path(Some(path.clone()));
        assert!(matches!(
            daemon.reload_credential().await,
            Err(Error::Config(_))
        ));

        std::fs::write(&path, "[relay]\ntoken = \"rotated\"\n").unwrap();
        assert!(matches!(
            daemon.reload_credential().await,
            Err(Error::Session(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_agent_is_a_setup_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = TetherConfig::default();
        config.relay.token = "t".to_string();
        config.agent.binary = "definitely-not-an-agent-binary".to_string();
        let daemon = Daemon::new(config, dir.path().to_path_buf());
        let err = daemon.start().await.unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("npm install"));
    }
}
