//! Raw passthrough to external search and diff tools

use super::HandlerContext;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Run `binary args...` in a sandboxed cwd.
///
/// `success` reports that the tool ran; its own status is in `exitCode`.
pub async fn run_tool(ctx: &HandlerContext, binary: &str, req: ToolRequest) -> ToolResponse {
    let cwd = match ctx.policy.resolve_dir(req.cwd.as_deref()) {
        Ok(cwd) => cwd,
        Err(e) => return ToolResponse::failed(e.to_string()),
    };

    let child = Command::new(binary)
        .args(&req.args)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return ToolResponse::failed(format!("Failed to run {}: {}", binary, e)),
    };

    let timeout = Duration::from_millis(ctx.sandbox.bash_timeout_ms);
    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => ToolResponse {
            success: true,
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            error: None,
        },
        Ok(Err(e)) => ToolResponse::failed(format!("Failed waiting for {}: {}", binary, e)),
        Err(_) => ToolResponse::failed(format!(
            "{} timed out after {}ms",
            binary,
            timeout.as_millis()
        )),
    }
}

pub async fn ripgrep(ctx: Arc<HandlerContext>, req: ToolRequest) -> ToolResponse {
    run_tool(&ctx, &ctx.sandbox.ripgrep_binary, req).await
}

pub async fn difftastic(ctx: Arc<HandlerContext>, req: ToolRequest) -> ToolResponse {
    run_tool(&ctx, &ctx.sandbox.difftastic_binary, req).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::context;

    #[tokio::test]
    async fn test_run_tool_passes_args_and_exit_code() {
        let (_dir, ctx) = context();
        let resp = run_tool(
            &ctx,
            "sh",
            ToolRequest {
                args: vec!["-c".to_string(), "echo found; exit 1".to_string()],
                cwd: None,
            },
        )
        .await;
        assert!(resp.success);
        assert_eq!(resp.exit_code, 1);
        assert_eq!(resp.stdout.trim(), "found");
    }

    #[tokio::test]
    async fn test_missing_tool_is_structured_failure() {
        let (_dir, ctx) = context();
        let resp = run_tool(
            &ctx,
            "definitely-not-a-real-binary-xyz",
            ToolRequest {
                args: vec![],
                cwd: None,
            },
        )
        .await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("Failed to run"));
    }

    #[tokio::test]
    async fn test_tool_cwd_is_sandboxed() {
        let (_dir, ctx) = context();
        let resp = ripgrep(
            ctx,
            ToolRequest {
                args: vec!["x".to_string()],
                cwd: Some("/".to_string()),
            },
        )
        .await;
        assert!(!resp.success);
    }
}
