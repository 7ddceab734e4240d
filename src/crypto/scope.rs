//! Encryption scopes bound to a session or a machine

use super::keys::{MasterSecret, ScopeKey};
use super::{open_json, seal_json};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Identifies the owner of an encryption scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ScopeId {
    /// Scope of one agent session
    Session(String),
    /// Scope of the host machine registration
    Machine(String),
}

impl ScopeId {
    /// Raw identifier (used as the RPC method prefix)
    pub fn id(&self) -> &str {
        match self {
            ScopeId::Session(id) | ScopeId::Machine(id) => id,
        }
    }

    fn kdf_info(&self) -> String {
        match self {
            ScopeId::Session(id) => format!("session:{}", id),
            ScopeId::Machine(id) => format!("machine:{}", id),
        }
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeId::Session(id) => write!(f, "session/{}", id),
            ScopeId::Machine(id) => write!(f, "machine/{}", id),
        }
    }
}

/// Symmetric-key context for one scope
pub struct EncryptionScope {
    id: ScopeId,
    key: ScopeKey,
}

impl EncryptionScope {
    /// Create a scope with an explicit key
    pub fn new(id: ScopeId, key: ScopeKey) -> Self {
        Self { id, key }
    }

    /// Scope identifier
    pub fn id(&self) -> &ScopeId {
        &self.id
    }

    /// Seal a JSON payload
    pub fn encrypt(&self, value: &serde_json::Value) -> Result<String> {
        seal_json(self.key.as_bytes(), value)
    }

    /// Open a sealed payload
    pub fn decrypt(&self, blob: &str) -> Result<serde_json::Value> {
        open_json(self.key.as_bytes(), blob)
    }
}

/// Registry of live scopes.
///
/// A scope lives exactly as long as its session or machine registration and
/// is removed when that registration ends.
pub struct ScopeRegistry {
    master: MasterSecret,
    scopes: RwLock<HashMap<ScopeId, Arc<EncryptionScope>>>,
}

impl ScopeRegistry {
    /// Create a registry deriving keys from the given master secret
    pub fn new(master: MasterSecret) -> Self {
        Self {
            master,
            scopes: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or return the existing) scope for an id
    pub async fn register(&self, id: ScopeId) -> Result<Arc<EncryptionScope>> {
        let mut scopes = self.scopes.write().await;
        if let Some(existing) = scopes.get(&id) {
            return Ok(existing.clone());
        }
        let key = self.master.derive(&id.kdf_info())?;
        let scope = Arc::new(EncryptionScope::new(id.clone(), key));
        scopes.insert(id.clone(), scope.clone());
        tracing::debug!(scope = %id, "Registered encryption scope");
        Ok(scope)
    }

    /// Resolve a registered scope
    pub async fn resolve(&self, id: &ScopeId) -> Result<Arc<EncryptionScope>> {
        self.scopes
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::Crypto(format!("No encryption scope for {}", id)))
    }

    /// Drop a scope when its registration ends; returns whether it existed
    pub async fn remove(&self, id: &ScopeId) -> bool {
        let removed = self.scopes.write().await.remove(id).is_some();
        if removed {
            tracing::debug!(scope = %id, "Removed encryption scope");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scopes_do_not_share_keys() {
        let registry = ScopeRegistry::new(MasterSecret::generate());
        let session = registry
            .register(ScopeId::Session("s1".to_string()))
            .await
            .unwrap();
        let machine = registry
            .register(ScopeId::Machine("s1".to_string()))
            .await
            .unwrap();

        let blob = session.encrypt(&serde_json::json!({"a": 1})).unwrap();
        assert!(machine.decrypt(&blob).is_err());
        assert_eq!(session.decrypt(&blob).unwrap()["a"], 1);
    }

    #[tokio::test]
    async fn test_peer_with_same_secret_can_decrypt() {
        let secret = MasterSecret::generate();
        let host = ScopeRegistry::new(secret.clone());
        let peer = ScopeRegistry::new(secret);
        let id = ScopeId::Session("shared".to_string());

        let blob = host
            .register(id.clone())
            .await
            .unwrap()
            .encrypt(&serde_json::json!("hi"))
            .unwrap();
        let opened = peer.register(id).await.unwrap().decrypt(&blob).unwrap();
        assert_eq!(opened, serde_json::json!("hi"));
    }

    #[tokio::test]
    async fn test_resolve_unknown_scope_fails() {
        let registry = ScopeRegistry::new(MasterSecret::generate());
        let id = ScopeId::Machine("m".to_string());
        assert!(registry.resolve(&id).await.is_err());

        registry.register(id.clone()).await.unwrap();
        assert!(registry.resolve(&id).await.is_ok());

        registry.remove(&id).await;
        assert!(registry.resolve(&id).await.is_err());
    }
}
