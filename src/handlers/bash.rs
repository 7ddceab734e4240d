//! Shell command execution

use super::HandlerContext;
use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BashRequest {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<String>,
    /// Milliseconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BashResponse {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BashResponse {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            exit_code: -1,
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Run `command` through `sh -c`; success iff it exits with 0
pub async fn bash(ctx: Arc<HandlerContext>, req: BashRequest) -> BashResponse {
    let cwd = match ctx
        .policy
        .resolve_shell_cwd(req.cwd.as_deref(), &ctx.sandbox.sentinel_cwd)
    {
        Ok(cwd) => cwd,
        Err(e) => return BashResponse::failed(e.to_string()),
    };
    let timeout_ms = req.timeout.unwrap_or(ctx.sandbox.bash_timeout_ms);

    tracing::debug!(cwd = %cwd.display(), timeout_ms, "Running remote shell command");

    let child = Command::new("sh")
        .arg("-c")
        .arg(&req.command)
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();
    let child = match child {
        Ok(child) => child,
        Err(e) => return BashResponse::failed(format!("Failed to spawn shell: {}", e)),
    };

    // Dropping the future on timeout drops the child, which kills it.
    match tokio::time::timeout(Duration::from_millis(timeout_ms), child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let exit_code = output.status.code().unwrap_or(-1);
            BashResponse {
                success: exit_code == 0,
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                exit_code,
                error: None,
            }
        }
        Ok(Err(e)) => BashResponse::failed(format!("Failed waiting for shell: {}", e)),
        Err(_) => BashResponse::failed(format!("Command timed out after {}ms", timeout_ms)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::context;

    fn request(command: &str) -> BashRequest {
        BashRequest {
            command: command.to_string(),
            cwd: None,
            timeout: None,
        }
    }

    #[tokio::test]
    async fn test_bash_success_and_output() {
        let (_dir, ctx) = context();
        let resp = bash(ctx, request("echo hello; echo oops >&2")).await;
        assert!(resp.success);
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.stdout.trim(), "hello");
        assert_eq!(resp.stderr.trim(), "oops");
        assert!(resp.error.is_none());
    }

    #[tokio::test]
    async fn test_bash_nonzero_exit_is_not_success() {
        let (_dir, ctx) = context();
        let resp = bash(ctx, request("exit 3")).await;
        assert!(!resp.success);
        assert_eq!(resp.exit_code, 3);
    }

    #[tokio::test]
    async fn test_bash_runs_in_root_by_default() {
        let (dir, ctx) = context();
        let resp = bash(ctx, request("pwd")).await;
        let expected = dir.path().canonicalize().unwrap();
        assert_eq!(resp.stdout.trim(), expected.to_str().unwrap());
    }

    #[tokio::test]
    async fn test_bash_timeout() {
        let (_dir, ctx) = context();
        let mut req = request("sleep 5");
        req.timeout = Some(100);
        let resp = bash(ctx, req).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_bash_cwd_outside_root_rejected_but_sentinel_allowed() {
        let (_dir, ctx) = context();
        let mut req = request("pwd");
        req.cwd = Some("/tmp".to_string());
        let resp = bash(ctx.clone(), req).await;
        assert!(!resp.success);
        assert!(resp.error.unwrap().contains("outside"));

        let mut req = request("pwd");
        req.cwd = Some("/".to_string());
        let resp = bash(ctx, req).await;
        assert!(resp.success);
        assert_eq!(resp.stdout.trim(), "/");
    }
}
