//! Tether configuration management

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Main Tether configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    /// Relay connection configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Agent subprocess configuration
    #[serde(default)]
    pub agent: AgentConfig,

    /// Session loop configuration
    #[serde(default)]
    pub session: SessionConfig,

    /// Remote execution sandbox configuration
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Model listing configuration
    #[serde(default)]
    pub models: ModelsConfig,

    /// Machine identity and key material
    #[serde(default)]
    pub storage: StorageConfig,
}

impl TetherConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| {
            Error::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }

    /// Default configuration file location (`<config dir>/tether/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs_next::config_dir().map(|p| p.join("tether").join("config.toml"))
    }

    /// Check that the values required to run a session are present
    pub fn validate(&self) -> Result<()> {
        if self.relay.url.trim().is_empty() {
            return Err(Error::Config("relay.url must be set".to_string()));
        }
        if self.relay.token.trim().is_empty() {
            return Err(Error::Config(
                "relay.token must be set (or pass --token / TETHER_TOKEN)".to_string(),
            ));
        }
        if self.relay.reconnect_base_delay_ms == 0
            || self.relay.reconnect_max_delay_ms < self.relay.reconnect_base_delay_ms
        {
            return Err(Error::Config(
                "relay reconnect delays must satisfy 0 < base <= max".to_string(),
            ));
        }
        Ok(())
    }
}

/// Relay connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base URL of the relay (http/https; the WebSocket URL is derived from it)
    pub url: String,

    /// Bearer credential used for both the WebSocket handshake and HTTP requests
    #[serde(default)]
    pub token: String,

    /// First reconnect delay in milliseconds
    pub reconnect_base_delay_ms: u64,

    /// Reconnect delay cap in milliseconds
    pub reconnect_max_delay_ms: u64,

    /// How long an RPC call waits for its acknowledgement, in seconds
    pub call_timeout_secs: u64,

    /// How long to wait for the relay's welcome frame after connecting, in seconds
    pub handshake_timeout_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            url: "https://relay.tether.dev".to_string(),
            token: String::new(),
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 30_000,
            call_timeout_secs: 30,
            handshake_timeout_secs: 10,
        }
    }
}

/// Agent subprocess configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent binary name or path
    pub binary: String,

    /// First version that ships the `mcp-server` sub-command
    pub mcp_server_min_version: String,

    /// Timeout for protocol requests other than turns, in seconds
    pub request_timeout_secs: u64,

    /// Extra environment for the child process
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            binary: "codex".to_string(),
            mcp_server_min_version: "0.43.0".to_string(),
            request_timeout_secs: 60,
            env: HashMap::new(),
        }
    }
}

/// Session loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keepalive interval in milliseconds
    pub keepalive_interval_ms: u64,

    /// How long a permission request waits for the operator, in seconds
    pub permission_timeout_secs: u64,

    /// Root of the agent's transcript files (defaults to `~/.codex/sessions`)
    pub transcripts_dir: Option<PathBuf>,

    /// Largest outbound event payload in bytes before shrinking kicks in
    pub max_event_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 2000,
            permission_timeout_secs: 300,
            transcripts_dir: None,
            max_event_bytes: 256 * 1024,
        }
    }
}

impl SessionConfig {
    /// Resolved transcript directory
    pub fn transcripts_dir(&self) -> PathBuf {
        self.transcripts_dir.clone().unwrap_or_else(|| {
            dirs_next::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".codex")
                .join("sessions")
        })
    }
}

/// Remote execution sandbox configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Default shell timeout in milliseconds
    pub bash_timeout_ms: u64,

    /// cwd value that skips validation for shell execution only
    pub sentinel_cwd: String,

    /// Ripgrep binary
    pub ripgrep_binary: String,

    /// Difftastic binary
    pub difftastic_binary: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            bash_timeout_ms: 30_000,
            sentinel_cwd: "/".to_string(),
            ripgrep_binary: "rg".to_string(),
            difftastic_binary: "difft".to_string(),
        }
    }
}

/// Model listing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelsConfig {
    /// Cache lifetime for the remote model list, in seconds
    pub cache_ttl_secs: u64,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self { cache_ttl_secs: 60 }
    }
}

/// Machine identity and key material
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Stable machine identifier (generated when absent)
    pub machine_id: Option<String>,

    /// Base64 master secret shared with the paired client
    pub secret: Option<String>,
}
