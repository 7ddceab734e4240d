//! Remote execution handlers
//!
//! RPC methods the peer invokes against the host filesystem. Every handler
//! answers with a structured `{success, ..., error?}` object; failures never
//! cross the transport as RPC errors.

pub mod bash;
pub mod files;
pub mod models;
pub mod sandbox;
pub mod search;

pub use models::{fallback_models, ModelCatalog, ModelInfo, ModelProvider, ModelSource};
pub use sandbox::PathPolicy;

use crate::config::SandboxConfig;
use crate::crypto::ScopeId;
use crate::error::Result;
use crate::transport::RelayClient;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;

/// Shared state for all handlers of one session
pub struct HandlerContext {
    pub policy: PathPolicy,
    pub sandbox: SandboxConfig,
    pub models: ModelCatalog,
}

impl HandlerContext {
    pub fn new(root: &Path, sandbox: SandboxConfig, models: ModelCatalog) -> Result<Self> {
        Ok(Self {
            policy: PathPolicy::new(root)?,
            sandbox,
            models,
        })
    }
}

/// Decode params, run the handler, encode its response.
///
/// Undecodable params become a `{success:false}` result rather than an error.
pub async fn invoke<Req, Resp, F, Fut>(
    ctx: Arc<HandlerContext>,
    params: serde_json::Value,
    handler: F,
) -> Result<serde_json::Value>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: FnOnce(Arc<HandlerContext>, Req) -> Fut,
    Fut: Future<Output = Resp>,
{
    let request: Req = match serde_json::from_value(params) {
        Ok(request) => request,
        Err(e) => {
            return Ok(serde_json::json!({
                "success": false,
                "error": format!("Invalid parameters: {}", e),
            }))
        }
    };
    Ok(serde_json::to_value(handler(ctx, request).await)?)
}

async fn register<Req, Resp, F, Fut>(
    client: &RelayClient,
    scope: &ScopeId,
    method: &str,
    ctx: &Arc<HandlerContext>,
    handler: F,
) where
    Req: DeserializeOwned + Send + 'static,
    Resp: Serialize + Send + 'static,
    F: Fn(Arc<HandlerContext>, Req) -> Fut + Copy + Send + Sync + 'static,
    Fut: Future<Output = Resp> + Send + 'static,
{
    let ctx = ctx.clone();
    client
        .register_rpc(scope, method, move |params| {
            invoke(ctx.clone(), params, handler)
        })
        .await;
}

/// Register the full handler set on a session scope
pub async fn register_session_handlers(
    client: &RelayClient,
    scope: &ScopeId,
    ctx: &Arc<HandlerContext>,
) {
    register(client, scope, "bash", ctx, bash::bash).await;
    register(client, scope, "readFile", ctx, files::read_file).await;
    register(client, scope, "writeFile", ctx, files::write_file).await;
    register(client, scope, "listDirectory", ctx, files::list_directory).await;
    register(client, scope, "getDirectoryTree", ctx, files::get_directory_tree).await;
    register(client, scope, "ripgrep", ctx, search::ripgrep).await;
    register(client, scope, "difftastic", ctx, search::difftastic).await;
    register(client, scope, "listModels", ctx, models::list_models).await;
}

/// Register the machine-level handlers
pub async fn register_machine_handlers(
    client: &RelayClient,
    scope: &ScopeId,
    ctx: &Arc<HandlerContext>,
) {
    register(client, scope, "listModels", ctx, models::list_models).await;
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    pub(crate) fn context() -> (TempDir, Arc<HandlerContext>) {
        let dir = TempDir::new().unwrap();
        let ctx = HandlerContext::new(
            dir.path(),
            SandboxConfig::default(),
            ModelCatalog::new(None, Duration::from_secs(60)),
        )
        .unwrap();
        (dir, Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_invoke_reports_bad_params_as_structured_failure() {
        let (_dir, ctx) = context();
        let value = invoke(ctx, serde_json::json!({"nope": 1}), bash::bash)
            .await
            .unwrap();
        assert_eq!(value["success"], false);
        assert!(value["error"]
            .as_str()
            .unwrap()
            .starts_with("Invalid parameters"));
    }

    #[tokio::test]
    async fn test_invoke_encodes_camel_case_response() {
        let (_dir, ctx) = context();
        let value = invoke(ctx, serde_json::json!({"command": "exit 0"}), bash::bash)
            .await
            .unwrap();
        assert_eq!(value["success"], true);
        assert_eq!(value["exitCode"], 0);
        assert!(value.get("error").is_none());
    }
}
