//! Error types for the call engine

use thiserror::Error;

/// Result type alias for call operations
pub type CallResult<T> = Result<T, CallError>;

/// Errors that can occur while driving a call
#[derive(Error, Debug)]
pub enum CallError {
    #[error("Telephony transport disconnected")]
    TransportDisconnected,

    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),

    #[error("Speech synthesis failed: {0}")]
    SynthesisFailed(String),

    #[error("Knowledge resolver unavailable: {0}")]
    ResolverUnavailable(String),

    #[error("Escalation sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("Configuration error: {0}")]
    Config(String),
}
