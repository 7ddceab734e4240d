//! Host-side RPC handler registry
//!
//! Handlers are registered per scope as `<scopeId>:<method>`. Incoming
//! requests are opened with the scope's key, dispatched, and the result is
//! sealed again. Handler failures come back as a failed [`Ack`] and never
//! propagate across the transport.

use super::frame::Ack;
use crate::crypto::{ScopeId, ScopeRegistry};
use crate::error::Result;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value>> + Send + Sync>;

struct Registration {
    scope: ScopeId,
    handler: Handler,
}

/// Registry of host RPC methods
pub struct RpcHandlerRegistry {
    scopes: Arc<ScopeRegistry>,
    handlers: RwLock<HashMap<String, Registration>>,
}

/// Fully-qualified method name for a scope
pub fn scoped_method(scope: &ScopeId, method: &str) -> String {
    format!("{}:{}", scope.id(), method)
}

impl RpcHandlerRegistry {
    /// Create an empty registry
    pub fn new(scopes: Arc<ScopeRegistry>) -> Self {
        Self {
            scopes,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler; returns the fully-qualified method name.
    ///
    /// Registering the same method twice replaces the earlier handler.
    pub async fn register<F, Fut>(&self, scope: &ScopeId, method: &str, handler: F) -> String
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let full = scoped_method(scope, method);
        let handler: Handler = Arc::new(move |params| handler(params).boxed());
        self.handlers.write().await.insert(
            full.clone(),
            Registration {
                scope: scope.clone(),
                handler,
            },
        );
        tracing::debug!(method = %full, "Registered RPC handler");
        full
    }

    /// Remove a handler
    pub async fn unregister(&self, scope: &ScopeId, method: &str) -> bool {
        self.handlers
            .write()
            .await
            .remove(&scoped_method(scope, method))
            .is_some()
    }

    /// Bare method names registered on one scope
    pub async fn methods_in(&self, scope: &ScopeId) -> Vec<String> {
        let prefix = scoped_method(scope, "");
        let mut names: Vec<String> = self
            .handlers
            .read()
            .await
            .iter()
            .filter(|(_, reg)| &reg.scope == scope)
            .filter_map(|(full, _)| full.strip_prefix(&prefix).map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// All registered fully-qualified names
    pub async fn methods(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Dispatch one request and build its acknowledgement
    pub async fn dispatch(&self, id: u64, method: &str, sealed_params: &str) -> Ack {
        let (scope_id, handler) = {
            let handlers = self.handlers.read().await;
            match handlers.get(method) {
                Some(reg) => (reg.scope.clone(), reg.handler.clone()),
                None => {
                    tracing::warn!(method = %method, "RPC request for unknown method");
                    return Ack::failure(id, format!("Method not found: {}", method));
                }
            }
        };

        let scope = match self.scopes.resolve(&scope_id).await {
            Ok(scope) => scope,
            Err(e) => return Ack::failure(id, e.to_string()),
        };

        let params = match scope.decrypt(sealed_params) {
            Ok(params) => params,
            Err(e) => {
                tracing::warn!(method = %method, "Failed to open RPC params: {}", e);
                return Ack::failure(id, "Failed to decrypt parameters");
            }
        };

        match handler(params).await {
            Ok(result) => match scope.encrypt(&result) {
                Ok(sealed) => Ack::success(id, sealed),
                Err(e) => Ack::failure(id, e.to_string()),
            },
            Err(e) => {
                tracing::warn!(method = %method, "RPC handler failed: {}", e);
                Ack::failure(id, e.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::MasterSecret;
    use crate::error::Error;

    async fn registry() -> (RpcHandlerRegistry, Arc<ScopeRegistry>, ScopeId) {
        let scopes = Arc::new(ScopeRegistry::new(MasterSecret::generate()));
        let scope = ScopeId::Session("sess".to_string());
        scopes.register(scope.clone()).await.unwrap();
        (RpcHandlerRegistry::new(scopes.clone()), scopes, scope)
    }

    #[tokio::test]
    async fn test_dispatch_roundtrip() {
        let (registry, scopes, scope) = registry().await;
        let full = registry
            .register(&scope, "echo", |params| async move {
                Ok(serde_json::json!({"echo": params}))
            })
            .await;
        assert_eq!(full, "sess:echo");

        let enc = scopes.resolve(&scope).await.unwrap();
        let sealed = enc.encrypt(&serde_json::json!({"x": 1})).unwrap();
        let ack = registry.dispatch(1, "sess:echo", &sealed).await;
        assert!(ack.ok);

        let result = enc.decrypt(&ack.into_result().unwrap()).unwrap();
        assert_eq!(result["echo"]["x"], 1);
    }

    #[tokio::test]
    async fn test_unknown_method_fails_with_error() {
        let (registry, _, _) = registry().await;
        let ack = registry.dispatch(5, "sess:nope", "").await;
        assert!(!ack.ok);
        assert_eq!(ack.id, 5);
        assert!(ack.error.unwrap().contains("Method not found"));
    }

    #[tokio::test]
    async fn test_handler_error_becomes_failed_ack() {
        let (registry, scopes, scope) = registry().await;
        registry
            .register(&scope, "fail", |_| async move {
                Err::<Value, _>(Error::Rpc("handler exploded".to_string()))
            })
            .await;

        let sealed = scopes
            .resolve(&scope)
            .await
            .unwrap()
            .encrypt(&Value::Null)
            .unwrap();
        let ack = registry.dispatch(2, "sess:fail", &sealed).await;
        assert!(!ack.ok);
        assert!(ack.error.unwrap().contains("handler exploded"));
    }

    #[tokio::test]
    async fn test_params_from_other_scope_are_rejected() {
        let (registry, scopes, scope) = registry().await;
        registry
            .register(&scope, "echo", |p| async move { Ok(p) })
            .await;
        let other = scopes
            .register(ScopeId::Machine("m".to_string()))
            .await
            .unwrap();
        let sealed = other.encrypt(&Value::Null).unwrap();
        let ack = registry.dispatch(3, "sess:echo", &sealed).await;
        assert!(!ack.ok);
        assert_eq!(ack.error.as_deref(), Some("Failed to decrypt parameters"));
    }

    #[tokio::test]
    async fn test_methods_and_unregister() {
        let (registry, _, scope) = registry().await;
        registry.register(&scope, "b", |p| async move { Ok(p) }).await;
        registry.register(&scope, "a", |p| async move { Ok(p) }).await;
        assert_eq!(registry.methods().await, vec!["sess:a", "sess:b"]);
        assert!(registry.unregister(&scope, "a").await);
        assert!(!registry.unregister(&scope, "a").await);
    }

    #[tokio::test]
    async fn test_methods_in_scope_excludes_other_scopes() {
        let (registry, _, scope) = registry().await;
        let machine = ScopeId::Machine("m".to_string());
        registry.register(&scope, "bash", |p| async move { Ok(p) }).await;
        registry.register(&scope, "abort", |p| async move { Ok(p) }).await;
        registry.register(&machine, "listModels", |p| async move { Ok(p) }).await;

        assert_eq!(registry.methods_in(&scope).await, vec!["abort", "bash"]);
        assert_eq!(registry.methods_in(&machine).await, vec!["listModels"]);
    }
}
