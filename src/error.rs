//! Error types for the live match service
//!
//! This module defines all error types using anyhow for consistent error handling
//! throughout the application.

use crate::types::SessionState;

/// Result type alias for convenience
pub type Result<T> = anyhow::Result<T>;

/// Custom error types for specific live match scenarios
#[derive(Debug, thiserror::Error)]
pub enum LiveMatchError {
    #[error("Operation '{operation}' not permitted in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("Message text is empty after trimming")]
    EmptyMessage,

    #[error("No match found within {waited_seconds} seconds")]
    NoMatchFound { waited_seconds: u64 },

    #[error("Message channel is closed: {reason}")]
    ChannelClosed { reason: String },

    #[error("Candidate pool unavailable: {reason}")]
    PoolUnavailable { reason: String },

    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    #[error("Internal service error: {message}")]
    InternalError { message: String },
}
