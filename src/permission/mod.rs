//! Permission mediation
//!
//! Turns an agent elicitation into a decision request to the remote operator
//! and waits a bounded time for the answer. Anything short of an explicit
//! answer is a denial. Pending requests are tracked by call id so that a
//! turn abort or session kill can abandon them.

use crate::error::Result;
use crate::session::TurnControl;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

/// Operator decision on a tool call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approved,
    /// Approve this and every later call of the same tool
    ApprovedForSession,
    Denied,
    /// Deny and abort the current turn
    Abort,
}

impl Decision {
    pub fn is_approved(self) -> bool {
        matches!(self, Decision::Approved | Decision::ApprovedForSession)
    }
}

/// An elicitation awaiting the operator
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionRequest {
    pub call_id: String,
    pub tool_name: String,
    pub payload: Value,
}

/// Decision plus an optional explanation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionOutcome {
    pub decision: Decision,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl PermissionOutcome {
    pub fn new(decision: Decision) -> Self {
        Self {
            decision,
            reason: None,
        }
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            decision: Decision::Denied,
            reason: Some(reason.into()),
        }
    }
}

/// Remote side that answers permission requests
#[async_trait]
pub trait PermissionPeer: Send + Sync {
    async fn request_decision(&self, request: &PermissionRequest) -> Result<PermissionOutcome>;
}

/// Entry point used by the agent adapter
#[async_trait]
pub trait ElicitationHandler: Send + Sync {
    async fn handle(&self, call_id: &str, tool_name: &str, payload: Value) -> PermissionOutcome;
}

struct Pending {
    tool_name: String,
    abandon: CancellationToken,
}

/// Bridges elicitations to the operator
pub struct PermissionMediator {
    peer: RwLock<Option<Arc<dyn PermissionPeer>>>,
    timeout: Duration,
    pending: Mutex<HashMap<String, Pending>>,
    session_approved: Mutex<HashSet<String>>,
    turn: Arc<TurnControl>,
}

impl PermissionMediator {
    pub fn new(turn: Arc<TurnControl>, timeout: Duration) -> Self {
        Self {
            peer: RwLock::new(None),
            timeout,
            pending: Mutex::new(HashMap::new()),
            session_approved: Mutex::new(HashSet::new()),
            turn,
        }
    }

    /// Attach (or replace) the operator channel
    pub async fn attach_peer(&self, peer: Arc<dyn PermissionPeer>) {
        *self.peer.write().await = Some(peer);
    }

    /// Call ids still waiting for an answer
    pub async fn pending_call_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.pending.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Release every waiting request without applying a decision
    pub async fn abandon_all(&self) -> usize {
        let drained: Vec<(String, Pending)> = self.pending.lock().await.drain().collect();
        for (call_id, pending) in &drained {
            tracing::debug!(call_id = %call_id, tool = %pending.tool_name, "Abandoning permission request");
            pending.abandon.cancel();
        }
        drained.len()
    }

    /// Forget tools approved for the session
    pub async fn reset(&self) {
        self.session_approved.lock().await.clear();
    }

    /// Decide on one tool call
    pub async fn handle(&self, call_id: &str, tool_name: &str, payload: Value) -> PermissionOutcome {
        if self.session_approved.lock().await.contains(tool_name) {
            tracing::debug!(tool = %tool_name, "Tool approved for session");
            return PermissionOutcome::new(Decision::Approved);
        }

        let Some(peer) = self.peer.read().await.clone() else {
            tracing::warn!(tool = %tool_name, "No permission handler attached, denying");
            return PermissionOutcome::denied("No permission handler attached");
        };

        let abandon = CancellationToken::new();
        self.pending.lock().await.insert(
            call_id.to_string(),
            Pending {
                tool_name: tool_name.to_string(),
                abandon: abandon.clone(),
            },
        );

        let request = PermissionRequest {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            payload,
        };
        tracing::info!(call_id = %call_id, tool = %tool_name, "Requesting permission");

        let answer = tokio::select! {
            _ = abandon.cancelled() => None,
            answer = tokio::time::timeout(self.timeout, peer.request_decision(&request)) => Some(answer),
        };
        self.pending.lock().await.remove(call_id);

        let outcome = match answer {
            None => {
                return PermissionOutcome {
                    decision: Decision::Abort,
                    reason: Some("Request abandoned".to_string()),
                }
            }
            Some(Ok(Ok(outcome))) => outcome,
            Some(Ok(Err(e))) => {
                tracing::warn!(call_id = %call_id, "Permission request failed: {}", e);
                return PermissionOutcome::denied(format!("Permission request failed: {}", e));
            }
            Some(Err(_)) => {
                tracing::warn!(call_id = %call_id, "Permission request timed out");
                return PermissionOutcome::denied(format!(
                    "No decision within {}s",
                    self.timeout.as_secs()
                ));
            }
        };

        match outcome.decision {
            Decision::ApprovedForSession => {
                self.session_approved
                    .lock()
                    .await
                    .insert(tool_name.to_string());
            }
            Decision::Abort => {
                tracing::info!(call_id = %call_id, "Operator aborted the turn");
                self.turn.abort();
            }
            Decision::Approved | Decision::Denied => {}
        }
        tracing::info!(call_id = %call_id, decision = ?outcome.decision, "Permission decided");
        outcome
    }
}

#[async_trait]
impl ElicitationHandler for PermissionMediator {
    async fn handle(&self, call_id: &str, tool_name: &str, payload: Value) -> PermissionOutcome {
        PermissionMediator::handle(self, call_id, tool_name, payload).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::Error;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers from a script; `None` entries never answer.
    pub(crate) struct ScriptedPeer {
        answers: std::sync::Mutex<VecDeque<Option<Result<PermissionOutcome>>>>,
        pub(crate) asked: AtomicUsize,
    }

    impl ScriptedPeer {
        pub(crate) fn new(answers: Vec<Option<Result<PermissionOutcome>>>) -> Arc<Self> {
            Arc::new(Self {
                answers: std::sync::Mutex::new(answers.into()),
                asked: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl PermissionPeer for ScriptedPeer {
        async fn request_decision(&self, _request: &PermissionRequest) -> Result<PermissionOutcome> {
            self.asked.fetch_add(1, Ordering::SeqCst);
            let next = self.answers.lock().unwrap().pop_front().flatten();
            match next {
                Some(answer) => answer,
                None => futures::future::pending().await,
            }
        }
    }

    fn mediator(timeout: Duration) -> (Arc<TurnControl>, Arc<PermissionMediator>) {
        let turn = Arc::new(TurnControl::new());
        let mediator = Arc::new(PermissionMediator::new(turn.clone(), timeout));
        (turn, mediator)
    }

    #[tokio::test]
    async fn test_no_peer_denies() {
        let (_, mediator) = mediator(Duration::from_secs(1));
        let outcome = mediator.handle("c1", "CodexBash", Value::Null).await;
        assert_eq!(outcome.decision, Decision::Denied);
        assert!(outcome.reason.unwrap().contains("No permission handler"));
    }

    #[tokio::test]
    async fn test_peer_decision_is_returned_verbatim() {
        let (_, mediator) = mediator(Duration::from_secs(1));
        mediator
            .attach_peer(ScriptedPeer::new(vec![Some(Ok(PermissionOutcome::new(
                Decision::Approved,
            )))]))
            .await;
        let outcome = mediator.handle("c1", "CodexBash", Value::Null).await;
        assert_eq!(outcome.decision, Decision::Approved);
        assert!(mediator.pending_call_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_timeout_and_errors_deny() {
        let (_, mediator) = mediator(Duration::from_millis(50));
        mediator
            .attach_peer(ScriptedPeer::new(vec![
                None,
                Some(Err(Error::Transport("offline".to_string()))),
            ]))
            .await;

        let timed_out = mediator.handle("c1", "CodexBash", Value::Null).await;
        assert_eq!(timed_out.decision, Decision::Denied);
        assert!(timed_out.reason.unwrap().contains("No decision"));

        let failed = mediator.handle("c2", "CodexBash", Value::Null).await;
        assert_eq!(failed.decision, Decision::Denied);
        assert!(failed.reason.unwrap().contains("offline"));
    }

    #[tokio::test]
    async fn test_approved_for_session_skips_later_prompts() {
        let (_, mediator) = mediator(Duration::from_secs(1));
        let peer = ScriptedPeer::new(vec![Some(Ok(PermissionOutcome::new(
            Decision::ApprovedForSession,
        )))]);
        mediator.attach_peer(peer.clone()).await;

        mediator.handle("c1", "CodexPatch", Value::Null).await;
        let second = mediator.handle("c2", "CodexPatch", Value::Null).await;
        assert_eq!(second.decision, Decision::Approved);
        assert_eq!(peer.asked.load(Ordering::SeqCst), 1);

        mediator.reset().await;
        let third = mediator.handle("c3", "CodexPatch", Value::Null).await;
        assert_eq!(third.decision, Decision::Denied);
        assert_eq!(peer.asked.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_abort_decision_cancels_turn() {
        let (turn, mediator) = mediator(Duration::from_secs(1));
        let token = turn.current();
        mediator
            .attach_peer(ScriptedPeer::new(vec![Some(Ok(PermissionOutcome::new(
                Decision::Abort,
            )))]))
            .await;
        let outcome = mediator.handle("c1", "CodexBash", Value::Null).await;
        assert_eq!(outcome.decision, Decision::Abort);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_abandon_all_releases_waiters() {
        let (turn, mediator) = mediator(Duration::from_secs(30));
        mediator.attach_peer(ScriptedPeer::new(vec![None])).await;

        let waiter = {
            let mediator = mediator.clone();
            tokio::spawn(async move { mediator.handle("c1", "CodexBash", Value::Null).await })
        };
        for _ in 0..100 {
            if !mediator.pending_call_ids().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(mediator.pending_call_ids().await, vec!["c1"]);
        assert_eq!(mediator.abandon_all().await, 1);

        let outcome = waiter.await.unwrap();
        assert!(!outcome.decision.is_approved());
        // Abandoning is not an operator abort.
        assert!(!turn.current().is_cancelled());
    }
}
