//! Native agent events
//!
//! The agent streams one event per `codex/event` notification. Every kind the
//! translator understands is a variant here; anything else decodes to
//! [`NativeEvent::Unknown`] and is dropped downstream.

use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NativeEvent {
    SessionConfigured {
        session_id: String,
        #[serde(default)]
        model: Option<String>,
    },
    TaskStarted {},
    TaskComplete {
        #[serde(default)]
        last_agent_message: Option<String>,
    },
    TurnAborted {
        #[serde(default)]
        reason: Option<String>,
    },
    AgentMessage {
        message: String,
    },
    AgentMessageDelta {
        delta: String,
    },
    AgentReasoning {
        text: String,
    },
    AgentReasoningDelta {
        delta: String,
    },
    AgentReasoningSectionBreak {},
    ExecCommandBegin {
        call_id: String,
        #[serde(default)]
        command: Vec<String>,
        #[serde(default)]
        cwd: Option<String>,
    },
    ExecCommandEnd {
        call_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        exit_code: i32,
    },
    ExecApprovalRequest {
        call_id: String,
        #[serde(default)]
        command: Vec<String>,
    },
    ApplyPatchApprovalRequest {
        call_id: String,
    },
    PatchApplyBegin {
        call_id: String,
        #[serde(default)]
        auto_approved: bool,
        #[serde(default)]
        changes: BTreeMap<String, Value>,
    },
    PatchApplyEnd {
        call_id: String,
        #[serde(default)]
        stdout: String,
        #[serde(default)]
        stderr: String,
        #[serde(default)]
        success: bool,
    },
    TurnDiff {
        unified_diff: String,
    },
    TokenCount {
        #[serde(flatten)]
        usage: Map<String, Value>,
    },
    Error {
        message: String,
    },
    StreamError {
        message: String,
    },
    #[serde(other)]
    Unknown,
}

impl NativeEvent {
    /// Decode the `msg` of a `codex/event` notification.
    ///
    /// Malformed known kinds fall back to [`NativeEvent::Unknown`].
    pub fn from_notification(params: &Value) -> Self {
        let msg = params.get("msg").unwrap_or(params);
        match serde_json::from_value(msg.clone()) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!("Undecodable agent event: {}", e);
                NativeEvent::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_known_events() {
        let ev = NativeEvent::from_notification(&json!({
            "msg": {"type": "exec_command_begin", "call_id": "c1", "command": ["ls", "-la"], "cwd": "/w"}
        }));
        assert_eq!(
            ev,
            NativeEvent::ExecCommandBegin {
                call_id: "c1".to_string(),
                command: vec!["ls".to_string(), "-la".to_string()],
                cwd: Some("/w".to_string()),
            }
        );

        let ev = NativeEvent::from_notification(&json!({"msg": {"type": "task_started"}}));
        assert_eq!(ev, NativeEvent::TaskStarted {});
    }

    #[test]
    fn test_token_count_keeps_payload() {
        let ev = NativeEvent::from_notification(&json!({
            "msg": {"type": "token_count", "input_tokens": 10, "output_tokens": 3}
        }));
        match ev {
            NativeEvent::TokenCount { usage } => {
                assert_eq!(usage["input_tokens"], 10);
                assert!(!usage.contains_key("type"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_unknown_and_malformed_events() {
        let ev = NativeEvent::from_notification(&json!({"msg": {"type": "mcp_list_tools_response"}}));
        assert_eq!(ev, NativeEvent::Unknown);

        let ev = NativeEvent::from_notification(&json!({"msg": {"type": "agent_message"}}));
        assert_eq!(ev, NativeEvent::Unknown);
    }
}
