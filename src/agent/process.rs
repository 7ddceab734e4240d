//! Agent subprocess with a JSON-RPC client on its standard streams
//!
//! A writer task drains an outbound line queue into stdin; a reader task
//! routes stdout lines to pending requests, the notification callback, or the
//! inbound-request handler. Stderr is forwarded to the log.

use super::protocol::{
    Incoming, JsonRpcError, JsonRpcNotification, JsonRpcReply, JsonRpcRequest,
    CANCELLED_NOTIFICATION, INTERNAL_ERROR, METHOD_NOT_FOUND,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

type PendingMap = HashMap<u64, oneshot::Sender<std::result::Result<Value, JsonRpcError>>>;

/// How long each shutdown stage waits for the child to exit
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Receives traffic the agent initiates
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Called in arrival order from the reader task; must not block
    fn on_notification(&self, method: &str, params: Value);

    /// Answer a request from the agent
    async fn on_request(&self, method: &str, params: Value) -> Result<Value>;
}

/// Error returned by [`InboundHandler::on_request`] for unsupported methods
pub fn method_not_found(method: &str) -> Error {
    Error::Rpc(format!("Method not found: {}", method))
}

/// Running agent process
pub struct StdioRpc {
    child: Mutex<Option<Child>>,
    pid: Option<u32>,
    stdin_tx: Mutex<Option<mpsc::Sender<String>>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    connected: Arc<AtomicBool>,
}

impl StdioRpc {
    /// Spawn `command args...` in `cwd`
    pub async fn spawn(
        command: &str,
        args: &[String],
        cwd: &Path,
        env: &HashMap<String, String>,
        handler: Arc<dyn InboundHandler>,
    ) -> Result<Self> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(|e| {
            Error::Agent(format!("Failed to spawn {} {:?}: {}", command, args, e))
        })?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Agent("Agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Agent("Agent stdout unavailable".to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::channel::<String>(100);
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let connected = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_loop(stdin, stdin_rx));
        tokio::spawn(read_loop(
            stdout,
            pending.clone(),
            connected.clone(),
            stdin_tx.downgrade(),
            handler,
        ));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(target: "tether::agent::stderr", "{}", line);
                }
            });
        }

        tracing::info!(command, ?args, pid, "Agent process started");

        Ok(Self {
            child: Mutex::new(Some(child)),
            pid,
            stdin_tx: Mutex::new(Some(stdin_tx)),
            pending,
            next_id: AtomicU64::new(1),
            connected,
        })
    }

    /// Whether the agent's stdout is still open
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Child pid, if it was available at spawn time
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn send_line(&self, line: String) -> Result<()> {
        let tx = self.stdin_tx.lock().await.clone();
        match tx {
            Some(tx) => tx
                .send(line)
                .await
                .map_err(|_| Error::Agent("Agent stdin closed".to_string())),
            None => Err(Error::Agent("Agent connection closed".to_string())),
        }
    }

    /// Send a notification
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))? + "\n";
        self.send_line(line).await
    }

    /// Send a request and wait for its response.
    ///
    /// A cancelled `cancel` token abandons the request and tells the agent via
    /// `notifications/cancelled`.
    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        cancel: Option<&CancellationToken>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if !self.is_connected() {
            return Err(Error::Agent("Agent process is not running".to_string()));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))? + "\n";
        if let Err(e) = self.send_line(line).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let never = CancellationToken::new();
        let cancel = cancel.unwrap_or(&never);
        let wait = async {
            let received = match timeout {
                Some(limit) => tokio::time::timeout(limit, rx).await.map_err(|_| {
                    Error::Timeout(format!("{} after {}s", method, limit.as_secs()))
                })?,
                None => rx.await,
            };
            received.map_err(|_| Error::Agent("Agent exited before responding".to_string()))
        };

        let outcome = tokio::select! {
            outcome = wait => outcome,
            _ = cancel.cancelled() => {
                self.pending.lock().await.remove(&id);
                let params = serde_json::json!({ "requestId": id, "reason": "aborted by user" });
                if let Err(e) = self.notify(CANCELLED_NOTIFICATION, Some(params)).await {
                    tracing::debug!("Could not deliver cancellation to agent: {}", e);
                }
                return Err(Error::Cancelled);
            }
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => Err(Error::Agent(format!("{} failed: {}", method, e.message))),
            Err(e) => {
                self.pending.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    /// Close stdin and give the agent a chance to exit on its own
    pub async fn close(&self) -> Result<()> {
        self.stdin_tx.lock().await.take();
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return Ok(());
        };
        let waited = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                tracing::debug!(?status, "Agent process exited");
                guard.take();
                Ok(())
            }
            Ok(Err(e)) => Err(Error::Agent(format!("Failed waiting for agent: {}", e))),
            Err(_) => Err(Error::Timeout("agent did not exit after stdin closed".to_string())),
        }
    }

    /// Cooperative close, then SIGTERM, then SIGKILL while the pid is alive
    pub async fn shutdown(&self) {
        if let Err(e) = self.close().await {
            tracing::debug!("Cooperative agent close failed: {}", e);
            self.terminate().await;
        }

        if let Some(pid) = self.pid {
            if self.child.lock().await.is_some() && is_process_alive(pid) {
                tracing::warn!(pid, "Force killing agent process");
                if let Some(mut child) = self.child.lock().await.take() {
                    if let Err(e) = child.kill().await {
                        tracing::warn!(pid, "Failed to kill agent process: {}", e);
                    }
                }
            }
        }
        self.child.lock().await.take();
        self.connected.store(false, Ordering::SeqCst);
        fail_pending(&self.pending, "Agent connection closed").await;
    }

    async fn terminate(&self) {
        let mut guard = self.child.lock().await;
        let Some(child) = guard.as_mut() else {
            return;
        };
        if let Some(pid) = child.id() {
            // SAFETY: plain signal delivery to our own child.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
        let waited = tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await;
        if matches!(waited, Ok(Ok(_))) {
            guard.take();
        }
    }
}

async fn write_loop(mut stdin: tokio::process::ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(line) = rx.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            tracing::warn!("Failed to write to agent stdin: {}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            tracing::warn!("Failed to flush agent stdin: {}", e);
            break;
        }
    }
}

async fn read_loop(
    stdout: tokio::process::ChildStdout,
    pending: Arc<Mutex<PendingMap>>,
    connected: Arc<AtomicBool>,
    replies: mpsc::WeakSender<String>,
    handler: Arc<dyn InboundHandler>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("Agent stdout closed");
                break;
            }
            Err(e) => {
                tracing::warn!("Failed to read agent stdout: {}", e);
                break;
            }
        };
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                tracing::debug!(line = %trimmed, "Ignoring non-JSON agent output");
                continue;
            }
        };

        match Incoming::classify(value) {
            Some(Incoming::Response { id, result }) => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(result);
                } else {
                    tracing::debug!(id, "Response for abandoned request");
                }
            }
            Some(Incoming::Notification { method, params }) => {
                handler.on_notification(&method, params);
            }
            Some(Incoming::Request { id, method, params }) => {
                let handler = handler.clone();
                let replies = replies.clone();
                tokio::spawn(async move {
                    let reply = match handler.on_request(&method, params).await {
                        Ok(result) => JsonRpcReply::result(id, result),
                        Err(Error::Rpc(msg)) if msg.starts_with("Method not found") => {
                            JsonRpcReply::error(id, METHOD_NOT_FOUND, msg)
                        }
                        Err(e) => JsonRpcReply::error(id, INTERNAL_ERROR, e.to_string()),
                    };
                    let text = match serde_json::to_string(&reply) {
                        Ok(text) => text,
                        Err(e) => {
                            tracing::warn!("Failed to encode reply: {}", e);
                            return;
                        }
                    };
                    // Weak so that closing stdin is not held up by the reader.
                    let delivered = match replies.upgrade() {
                        Some(tx) => tx.send(text + "\n").await.is_ok(),
                        None => false,
                    };
                    if !delivered {
                        tracing::debug!(method = %method, "Agent gone before reply");
                    }
                });
            }
            None => tracing::debug!(line = %trimmed, "Unrecognised agent message"),
        }
    }

    connected.store(false, Ordering::SeqCst);
    fail_pending(&pending, "Agent process exited").await;
}

async fn fail_pending(pending: &Mutex<PendingMap>, reason: &str) {
    for (_, tx) in pending.lock().await.drain() {
        let _ = tx.send(Err(JsonRpcError {
            code: INTERNAL_ERROR,
            message: reason.to_string(),
            data: None,
        }));
    }
}

/// Check whether a pid is alive by sending signal 0
pub fn is_process_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs only the existence/permission check.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct Recorder {
        notifications: StdMutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        fn on_notification(&self, method: &str, params: Value) {
            self.notifications
                .lock()
                .unwrap()
                .push((method.to_string(), params));
        }

        async fn on_request(&self, method: &str, _params: Value) -> Result<Value> {
            Err(method_not_found(method))
        }
    }

    /// Shell one-liner acting as a tiny JSON-RPC server.
    fn fake_agent(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    async fn spawn(script: &str, handler: Arc<dyn InboundHandler>) -> StdioRpc {
        StdioRpc::spawn(
            "sh",
            &fake_agent(script),
            Path::new("."),
            &HashMap::new(),
            handler,
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_is_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(99_999_999));
    }

    #[tokio::test]
    async fn test_spawn_missing_binary() {
        let result = StdioRpc::spawn(
            "nonexistent_agent_12345",
            &[],
            Path::new("."),
            &HashMap::new(),
            Arc::new(Recorder::default()),
        )
        .await;
        assert!(matches!(result, Err(Error::Agent(_))));
    }

    #[tokio::test]
    async fn test_request_response_and_notification_order() {
        let recorder = Arc::new(Recorder::default());
        let rpc = spawn(
            r#"read line; echo '{"jsonrpc":"2.0","method":"codex/event","params":{"msg":{"type":"task_started"}}}'; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; sleep 5"#,
            recorder.clone(),
        )
        .await;

        let result = rpc
            .request("tools/call", None, None, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result["ok"], true);

        let notes = recorder.notifications.lock().unwrap().clone();
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, "codex/event");
        rpc.shutdown().await;
        assert!(!rpc.is_connected());
    }

    #[tokio::test]
    async fn test_error_response_becomes_agent_error() {
        let rpc = spawn(
            r#"read line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32000,"message":"bad prompt"}}'; sleep 5"#,
            Arc::new(Recorder::default()),
        )
        .await;
        let err = rpc
            .request("tools/call", None, None, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("bad prompt"));
        rpc.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_abandons_request() {
        let rpc = spawn("cat > /dev/null", Arc::new(Recorder::default())).await;
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = rpc
            .request("tools/call", None, Some(&token), None)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(rpc.pending.lock().await.is_empty());
        rpc.shutdown().await;
    }

    #[tokio::test]
    async fn test_exit_fails_pending_requests() {
        let rpc = spawn("read line; exit 0", Arc::new(Recorder::default())).await;
        let err = rpc
            .request("tools/call", None, None, Some(Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("exited"));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_for_stubborn_child() {
        // Ignores stdin EOF and SIGTERM.
        let rpc = spawn(
            "trap '' TERM; while true; do sleep 1; done",
            Arc::new(Recorder::default()),
        )
        .await;
        let pid = rpc.pid().unwrap();
        rpc.shutdown().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!is_process_alive(pid));
    }

    #[tokio::test]
    async fn test_inbound_request_gets_method_not_found_reply() {
        // Sends a request, then echoes whatever reply it receives as a notification param.
        let script = r#"echo '{"jsonrpc":"2.0","id":"r1","method":"unknown/thing","params":{}}'; read reply; printf '{"jsonrpc":"2.0","method":"echo","params":%s}\n' "$reply"; sleep 5"#;
        let recorder = Arc::new(Recorder::default());
        let rpc = spawn(script, recorder.clone()).await;

        let mut reply = None;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Some((_, params)) = recorder.notifications.lock().unwrap().first() {
                reply = Some(params.clone());
                break;
            }
        }
        let reply = reply.unwrap();
        assert_eq!(reply["id"], "r1");
        assert_eq!(reply["error"]["code"], METHOD_NOT_FOUND);
        rpc.shutdown().await;
    }
}
