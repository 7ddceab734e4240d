//! Tether error types

use thiserror::Error;

/// Tether error type
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Setup error that cannot be retried (missing or unsupported agent binary)
    #[error("{0}")]
    Setup(String),

    /// Relay transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Cryptographic error
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// RPC error reported by the peer or by a local handler
    #[error("RPC error: {0}")]
    Rpc(String),

    /// Agent subprocess error
    #[error("Agent error: {0}")]
    Agent(String),

    /// Session error
    #[error("Session error: {0}")]
    Session(String),

    /// Validation failure, raised before any side effect
    #[error("Validation error: {0}")]
    Validation(String),

    /// The current turn was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    /// A bounded wait expired
    #[error("Timed out: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether this error is a user-initiated cancellation rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Whether this error must abort startup
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Setup(_) | Error::Config(_))
    }
}

/// Result type alias for Tether operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_fatal() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Cancelled.is_fatal());
        assert!(!Error::Agent("boom".to_string()).is_cancelled());
    }

    #[test]
    fn test_setup_error_displays_remediation_verbatim() {
        let err = Error::Setup("Install it with: npm install -g @openai/codex".to_string());
        assert!(err.is_fatal());
        assert_eq!(
            err.to_string(),
            "Install it with: npm install -g @openai/codex"
        );
    }
}
