//! Per-turn cancellation

use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Holds the cancellation token of the current (or next) turn.
///
/// `abort` cancels only the token that is current at the time of the call.
/// The orchestrator renews the token after every cancellation and after every
/// turn, so a stale abort can never reach a turn that has not started.
#[derive(Debug, Default)]
pub struct TurnControl {
    current: Mutex<CancellationToken>,
}

impl TurnControl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token of the current turn
    pub fn current(&self) -> CancellationToken {
        match self.current.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Cancel the current token; returns false if it was already cancelled
    pub fn abort(&self) -> bool {
        let token = self.current();
        if token.is_cancelled() {
            return false;
        }
        token.cancel();
        true
    }

    /// Install and return a fresh token
    pub fn renew(&self) -> CancellationToken {
        let fresh = CancellationToken::new();
        match self.current.lock() {
            Ok(mut token) => *token = fresh.clone(),
            Err(poisoned) => *poisoned.into_inner() = fresh.clone(),
        }
        fresh
    }
}
