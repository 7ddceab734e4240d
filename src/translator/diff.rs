//! Turn diff tracking

use super::SessionEvent;

/// Last unified diff emitted in the current turn
#[derive(Debug, Default)]
pub struct DiffState {
    last: Option<String>,
}

impl DiffState {
    /// Emit a diff event only when the turn's diff changed
    pub fn on_turn_diff(&mut self, unified_diff: &str) -> Option<SessionEvent> {
        if unified_diff.trim().is_empty() || self.last.as_deref() == Some(unified_diff) {
            return None;
        }
        self.last = Some(unified_diff.to_string());
        Some(SessionEvent::Diff {
            diff: unified_diff.to_string(),
        })
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }
}
