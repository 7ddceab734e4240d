//! Event translator
//!
//! Turns the agent's native event stream into the session protocol the remote
//! client renders. The translator owns all per-turn accumulation (reasoning
//! sections, the running diff, open tool calls) and is reset at every turn
//! boundary so nothing leaks from one turn into the next.

mod diff;
mod reasoning;

pub use diff::DiffState;
pub use reasoning::{leading_title, ReasoningState, TOOL_REASONING};

use crate::agent::{NativeEvent, TOOL_BASH, TOOL_PATCH};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outbound session event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    Message {
        message: String,
    },
    Reasoning {
        message: String,
    },
    ToolCall {
        name: String,
        #[serde(rename = "callId")]
        call_id: String,
        input: Value,
        id: String,
    },
    ToolCallResult {
        #[serde(rename = "callId")]
        call_id: String,
        output: Value,
        #[serde(rename = "isError")]
        is_error: bool,
        id: String,
    },
    Diff {
        diff: String,
    },
    TokenCount {
        usage: Value,
        id: String,
    },
    Status {
        message: String,
        #[serde(rename = "isError")]
        is_error: bool,
    },
    Ready,
}

impl SessionEvent {
    pub fn tool_call(name: &str, call_id: impl Into<String>, input: Value) -> Self {
        SessionEvent::ToolCall {
            name: name.to_string(),
            call_id: call_id.into(),
            input,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn tool_result(call_id: impl Into<String>, output: Value, is_error: bool) -> Self {
        SessionEvent::ToolCallResult {
            call_id: call_id.into(),
            output,
            is_error,
            id: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn status(message: impl Into<String>) -> Self {
        SessionEvent::Status {
            message: message.into(),
            is_error: false,
        }
    }

    pub fn error_status(message: impl Into<String>) -> Self {
        SessionEvent::Status {
            message: message.into(),
            is_error: true,
        }
    }

    /// Wire form of the event
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Human-readable progress line for a patch
pub fn patch_progress(files: usize) -> String {
    if files == 1 {
        "Modifying 1 file...".to_string()
    } else {
        format!("Modifying {} files...", files)
    }
}

#[derive(Debug)]
pub struct EventTranslator {
    reasoning: ReasoningState,
    diff: DiffState,
    /// Tool calls announced but not yet completed: call id -> tool name
    open_calls: BTreeMap<String, String>,
    thinking: Arc<AtomicBool>,
}

impl EventTranslator {
    pub fn new(thinking: Arc<AtomicBool>) -> Self {
        Self {
            reasoning: ReasoningState::default(),
            diff: DiffState::default(),
            open_calls: BTreeMap::new(),
            thinking,
        }
    }

    pub fn is_thinking(&self) -> bool {
        self.thinking.load(Ordering::SeqCst)
    }

    fn set_thinking(&self, value: bool) {
        self.thinking.store(value, Ordering::SeqCst);
    }

    /// True when no per-turn state is held
    pub fn is_clean(&self) -> bool {
        self.reasoning.is_empty() && self.diff.is_empty() && self.open_calls.is_empty()
    }

    /// Start a turn with empty accumulators
    pub fn begin_turn(&mut self) {
        if !self.is_clean() {
            tracing::warn!("Translator state carried into a new turn; discarding");
        }
        self.reasoning.reset();
        self.diff.reset();
        self.open_calls.clear();
    }

    /// Translate one native event
    pub fn translate(&mut self, event: NativeEvent) -> Vec<SessionEvent> {
        match event {
            NativeEvent::SessionConfigured { .. } => Vec::new(),
            NativeEvent::TaskStarted {} => {
                self.set_thinking(true);
                Vec::new()
            }
            NativeEvent::TaskComplete { .. } => {
                self.set_thinking(false);
                self.reasoning.complete()
            }
            NativeEvent::TurnAborted { .. } => {
                self.set_thinking(false);
                self.reasoning.abort()
            }
            NativeEvent::AgentMessage { message } => {
                let mut events = self.reasoning.complete();
                events.push(SessionEvent::Message { message });
                events
            }
            // The complete message follows as agent_message.
            NativeEvent::AgentMessageDelta { .. } => Vec::new(),
            NativeEvent::AgentReasoningDelta { delta } => self.reasoning.on_delta(&delta),
            NativeEvent::AgentReasoning { text } => self.reasoning.on_full(&text),
            NativeEvent::AgentReasoningSectionBreak {} => self.reasoning.complete(),
            NativeEvent::ExecCommandBegin {
                call_id,
                command,
                cwd,
            } => {
                self.open_calls.insert(call_id.clone(), TOOL_BASH.to_string());
                vec![SessionEvent::tool_call(
                    TOOL_BASH,
                    call_id,
                    json!({ "command": command, "cwd": cwd }),
                )]
            }
            NativeEvent::ExecCommandEnd {
                call_id,
                stdout,
                stderr,
                exit_code,
            } => {
                self.close_call(&call_id);
                vec![SessionEvent::tool_result(
                    call_id,
                    json!({ "stdout": stdout, "stderr": stderr, "exitCode": exit_code }),
                    exit_code != 0,
                )]
            }
            // Approvals arrive as elicitation requests, not as events.
            NativeEvent::ExecApprovalRequest { .. }
            | NativeEvent::ApplyPatchApprovalRequest { .. } => Vec::new(),
            NativeEvent::PatchApplyBegin {
                call_id,
                auto_approved,
                changes,
            } => {
                self.open_calls
                    .insert(call_id.clone(), TOOL_PATCH.to_string());
                vec![
                    SessionEvent::Message {
                        message: patch_progress(changes.len()),
                    },
                    SessionEvent::tool_call(
                        TOOL_PATCH,
                        call_id,
                        json!({ "auto_approved": auto_approved, "changes": changes }),
                    ),
                ]
            }
            NativeEvent::PatchApplyEnd {
                call_id,
                stdout,
                stderr,
                success,
            } => {
                self.close_call(&call_id);
                vec![SessionEvent::tool_result(
                    call_id,
                    json!({ "stdout": stdout, "stderr": stderr, "success": success }),
                    !success,
                )]
            }
            NativeEvent::TurnDiff { unified_diff } => {
                self.diff.on_turn_diff(&unified_diff).into_iter().collect()
            }
            NativeEvent::TokenCount { usage } => vec![SessionEvent::TokenCount {
                usage: Value::Object(usage),
                id: uuid::Uuid::new_v4().to_string(),
            }],
            NativeEvent::Error { message } => vec![SessionEvent::error_status(message)],
            NativeEvent::StreamError { message } => {
                vec![SessionEvent::error_status(format!("Stream error: {}", message))]
            }
            NativeEvent::Unknown => Vec::new(),
        }
    }

    fn close_call(&mut self, call_id: &str) {
        if self.open_calls.remove(call_id).is_none() {
            tracing::debug!("Tool result without a matching call: {}", call_id);
        }
    }

    /// Flush and clear at the end of a turn that ran to completion
    pub fn finish_turn(&mut self) -> Vec<SessionEvent> {
        let mut events = self.reasoning.complete();
        events.extend(self.close_open_calls("incomplete"));
        self.diff.reset();
        self.set_thinking(false);
        events
    }

    /// Clear after a cancelled or failed turn; open calls end as canceled
    pub fn abort(&mut self) -> Vec<SessionEvent> {
        let mut events = self.reasoning.abort();
        events.extend(self.close_open_calls("canceled"));
        self.diff.reset();
        self.set_thinking(false);
        events
    }

    fn close_open_calls(&mut self, status: &str) -> Vec<SessionEvent> {
        std::mem::take(&mut self.open_calls)
            .into_keys()
            .map(|call_id| SessionEvent::tool_result(call_id, json!({ "status": status }), false))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn translator() -> EventTranslator {
        EventTranslator::new(Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_wire_shape() {
        let value = SessionEvent::tool_call(TOOL_BASH, "c1", json!({})).to_value();
        assert_eq!(value["type"], "tool-call");
        assert_eq!(value["callId"], "c1");
        assert_eq!(value["name"], "CodexBash");
        assert!(value["id"].is_string());

        assert_eq!(SessionEvent::Ready.to_value(), json!({"type": "ready"}));
        let status = SessionEvent::status("aborted by user").to_value();
        assert_eq!(status["type"], "status");
        assert_eq!(status["isError"], false);
    }

    #[test]
    fn test_patch_progress() {
        assert_eq!(patch_progress(1), "Modifying 1 file...");
        assert_eq!(patch_progress(3), "Modifying 3 files...");
    }

    #[test]
    fn test_thinking_follows_task_lifecycle() {
        let mut t = translator();
        t.begin_turn();
        t.translate(NativeEvent::TaskStarted {});
        assert!(t.is_thinking());
        t.translate(NativeEvent::TaskComplete {
            last_agent_message: None,
        });
        assert!(!t.is_thinking());
    }

    #[test]
    fn test_exec_call_and_result() {
        let mut t = translator();
        t.begin_turn();
        let begin = t.translate(NativeEvent::ExecCommandBegin {
            call_id: "c1".into(),
            command: vec!["ls".into()],
            cwd: Some("/w".into()),
        });
        assert!(matches!(&begin[..], [SessionEvent::ToolCall { name, .. }] if name == TOOL_BASH));
        assert!(!t.is_clean());

        let end = t.translate(NativeEvent::ExecCommandEnd {
            call_id: "c1".into(),
            stdout: "a\n".into(),
            stderr: String::new(),
            exit_code: 2,
        });
        match &end[..] {
            [SessionEvent::ToolCallResult {
                call_id,
                output,
                is_error,
                ..
            }] => {
                assert_eq!(call_id, "c1");
                assert_eq!(output["exitCode"], 2);
                assert!(*is_error);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.finish_turn().is_empty());
        assert!(t.is_clean());
    }

    #[test]
    fn test_patch_begin_reports_file_count() {
        let mut t = translator();
        let mut changes = BTreeMap::new();
        changes.insert("a.rs".to_string(), json!({"update": {}}));
        changes.insert("b.rs".to_string(), json!({"add": {}}));
        let events = t.translate(NativeEvent::PatchApplyBegin {
            call_id: "p1".into(),
            auto_approved: false,
            changes,
        });
        assert_eq!(
            events[0],
            SessionEvent::Message {
                message: "Modifying 2 files...".into()
            }
        );
        assert!(matches!(&events[1], SessionEvent::ToolCall { name, .. } if name == TOOL_PATCH));
    }

    #[test]
    fn test_abort_cancels_open_calls_and_clears_state() {
        let mut t = translator();
        t.begin_turn();
        t.translate(NativeEvent::TaskStarted {});
        t.translate(NativeEvent::ExecCommandBegin {
            call_id: "c9".into(),
            command: vec!["sleep".into(), "10".into()],
            cwd: None,
        });
        t.translate(NativeEvent::AgentReasoningDelta {
            delta: "half a thought".into(),
        });
        t.translate(NativeEvent::TurnDiff {
            unified_diff: "--- a\n+++ b\n".into(),
        });

        let events = t.abort();
        match &events[..] {
            [SessionEvent::ToolCallResult { call_id, output, .. }] => {
                assert_eq!(call_id, "c9");
                assert_eq!(output["status"], "canceled");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(t.is_clean());
        assert!(!t.is_thinking());

        // The same diff is reported again in the next turn.
        t.begin_turn();
        let again = t.translate(NativeEvent::TurnDiff {
            unified_diff: "--- a\n+++ b\n".into(),
        });
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_errors_become_status() {
        let mut t = translator();
        let events = t.translate(NativeEvent::StreamError {
            message: "retrying".into(),
        });
        assert_eq!(
            events,
            vec![SessionEvent::error_status("Stream error: retrying")]
        );
        assert!(t.translate(NativeEvent::Unknown).is_empty());
    }

    #[test]
    fn test_agent_message_flushes_pending_reasoning() {
        let mut t = translator();
        t.translate(NativeEvent::AgentReasoningDelta {
            delta: "plan".into(),
        });
        let events = t.translate(NativeEvent::AgentMessage {
            message: "done".into(),
        });
        assert_eq!(
            events,
            vec![
                SessionEvent::Reasoning {
                    message: "plan".into()
                },
                SessionEvent::Message {
                    message: "done".into()
                },
            ]
        );
    }
}
