//! Session record

use super::mode::Mode;
use crate::agent::Identifiers;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Active,
    /// Terminal; set by kill
    Archived,
}

impl Lifecycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            Lifecycle::Active => "active",
            Lifecycle::Archived => "archived",
        }
    }
}

/// A remotely controlled agent session
#[derive(Debug)]
pub struct Session {
    /// Relay-assigned session ID
    pub id: String,
    /// Working directory of the agent
    cwd: PathBuf,
    lifecycle: RwLock<Lifecycle>,
    /// Mode of the running agent session, if one was started
    mode: RwLock<Option<Mode>>,
    /// Native identifiers last observed by the adapter
    native: RwLock<Identifiers>,
    /// Creation timestamp (ms)
    pub created_at: i64,
}

impl Session {
    pub fn new(id: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            id: id.into(),
            cwd: cwd.into(),
            lifecycle: RwLock::new(Lifecycle::Active),
            mode: RwLock::new(None),
            native: RwLock::new(Identifiers::default()),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn cwd(&self) -> &Path {
        &self.cwd
    }

    pub async fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle.read().await
    }

    pub async fn is_active(&self) -> bool {
        self.lifecycle().await == Lifecycle::Active
    }

    /// Move to `Archived`; returns false if already archived
    pub async fn archive(&self) -> bool {
        let mut lifecycle = self.lifecycle.write().await;
        if *lifecycle == Lifecycle::Archived {
            return false;
        }
        *lifecycle = Lifecycle::Archived;
        true
    }

    pub async fn mode(&self) -> Option<Mode> {
        self.mode.read().await.clone()
    }

    pub async fn set_mode(&self, mode: Option<Mode>) {
        *self.mode.write().await = mode;
    }

    pub async fn native_ids(&self) -> Identifiers {
        self.native.read().await.clone()
    }

    /// Record identifiers reported by the adapter; empty fields are ignored
    pub async fn observe_ids(&self, seen: Identifiers) {
        let mut native = self.native.write().await;
        if seen.session_id.is_some() {
            native.session_id = seen.session_id;
        }
        if seen.conversation_id.is_some() {
            native.conversation_id = seen.conversation_id;
        }
    }

    pub async fn clear_native_ids(&self) {
        *self.native.write().await = Identifiers::default();
    }
}
