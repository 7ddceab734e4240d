//! Reasoning reassembly
//!
//! Deltas are buffered and only surfaced when a section completes. A section
//! that opens with a bold `**Title**` becomes a reasoning tool call: the call
//! is announced as soon as the title is known and completed with the full
//! text at the section boundary.

use super::SessionEvent;
use regex::Regex;
use serde_json::json;
use std::sync::OnceLock;

/// Tool name used for titled reasoning sections
pub const TOOL_REASONING: &str = "CodexReasoning";

fn title_regex() -> Option<&'static Regex> {
    static TITLE: OnceLock<Option<Regex>> = OnceLock::new();
    TITLE
        .get_or_init(|| Regex::new(r"^\*\*([^*\n]+)\*\*").ok())
        .as_ref()
}

/// Extract a leading `**Title**`
pub fn leading_title(text: &str) -> Option<String> {
    let caps = title_regex()?.captures(text.trim_start())?;
    let title = caps.get(1)?.as_str().trim();
    (!title.is_empty()).then(|| title.to_string())
}

#[derive(Debug, Default)]
pub struct ReasoningState {
    buffer: String,
    /// Open reasoning tool call: (call id, title)
    open_call: Option<(String, String)>,
}

impl ReasoningState {
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.open_call.is_none()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.open_call = None;
    }

    /// Buffer a delta; announces the tool call once a title is complete
    pub fn on_delta(&mut self, delta: &str) -> Vec<SessionEvent> {
        self.buffer.push_str(delta);
        if self.open_call.is_some() {
            return Vec::new();
        }
        match leading_title(&self.buffer) {
            Some(title) => {
                let call_id = uuid::Uuid::new_v4().to_string();
                self.open_call = Some((call_id.clone(), title.clone()));
                vec![SessionEvent::tool_call(
                    TOOL_REASONING,
                    call_id,
                    json!({ "title": title }),
                )]
            }
            None => Vec::new(),
        }
    }

    /// A complete reasoning text; ignored if deltas already carried it
    pub fn on_full(&mut self, text: &str) -> Vec<SessionEvent> {
        if self.buffer.is_empty() {
            let mut events = self.on_delta(text);
            events.extend(self.complete());
            events
        } else {
            self.complete()
        }
    }

    /// Close the current section
    pub fn complete(&mut self) -> Vec<SessionEvent> {
        let text = std::mem::take(&mut self.buffer);
        let open_call = self.open_call.take();
        match open_call {
            Some((call_id, title)) => {
                let body = text
                    .trim_start()
                    .strip_prefix(&format!("**{}**", title))
                    .unwrap_or(&text)
                    .trim()
                    .to_string();
                vec![SessionEvent::tool_result(
                    call_id,
                    json!({ "title": title, "content": body, "status": "completed" }),
                    false,
                )]
            }
            None if text.trim().is_empty() => Vec::new(),
            None => vec![SessionEvent::Reasoning {
                message: text.trim().to_string(),
            }],
        }
    }

    /// Drop buffered text; an open titled call is completed as canceled
    pub fn abort(&mut self) -> Vec<SessionEvent> {
        let open_call = self.open_call.take();
        self.buffer.clear();
        match open_call {
            Some((call_id, title)) => vec![SessionEvent::tool_result(
                call_id,
                json!({ "title": title, "status": "canceled" }),
                false,
            )],
            None => Vec::new(),
        }
    }
}
