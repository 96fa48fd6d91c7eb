//! Error types for rexec.

use thiserror::Error;

use crate::{CommandId, SessionId};

/// Main error type for rexec operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Session not found
    #[error("Session not found: {0}")]
    SessionNotFound(SessionId),

    /// No live interaction context for this command
    #[error("Command not found: {0}")]
    CommandNotFound(CommandId),

    /// Session limit reached
    #[error("Session limit reached (max: {0})")]
    SessionLimitReached(usize),

    /// The session's stream has closed
    #[error("Session closed: {0}")]
    SessionClosed(SessionId),

    /// Stream-level failure (closed, not writable, write failed, drain timeout)
    #[error("Transport failure ({}): {0}", .0.code())]
    Transport(#[from] TransportFailure),

    /// No transport is registered for the requested kind
    #[error("No transport registered for {0}")]
    TransportUnavailable(String),

    /// The transport rejected the connection attempt
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Bastion menu navigation detected explicit failure text
    #[error("Bastion handshake failed: {0}")]
    HandshakeFailed(String),

    /// Bastion menu navigation did not reach a shell in time
    #[error("Bastion handshake timed out after {0}ms")]
    HandshakeTimeout(u64),

    /// Invalid input or parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with custom message
    #[error("{0}")]
    Other(String),
}

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Structured failure of a write to the underlying byte stream.
///
/// These are reported as values across the session boundary and never
/// raised as panics.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportFailure {
    /// The stream has been closed by either side
    #[error("stream is closed")]
    Closed,

    /// The stream exists but refuses writes
    #[error("stream is not writable")]
    NotWritable,

    /// The write itself failed
    #[error("write failed: {0}")]
    WriteFailed(String),

    /// The write was buffered but the drain signal never arrived
    #[error("stream did not drain within {0}ms")]
    Timeout(u64),
}

impl TransportFailure {
    /// Short machine-readable code for hosts.
    pub fn code(&self) -> &'static str {
        match self {
            TransportFailure::Closed => "closed",
            TransportFailure::NotWritable => "not-writable",
            TransportFailure::WriteFailed(_) => "write-failed",
            TransportFailure::Timeout(_) => "timeout",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_not_found_error() {
        let session_id = SessionId::new();
        let err = Error::SessionNotFound(session_id);
        assert!(err.to_string().starts_with("Session not found:"));
    }

    #[test]
    fn test_session_limit_reached_error() {
        let err = Error::SessionLimitReached(10);
        assert_eq!(err.to_string(), "Session limit reached (max: 10)");
    }

    #[test]
    fn test_transport_failure_codes() {
        assert_eq!(TransportFailure::Closed.code(), "closed");
        assert_eq!(TransportFailure::NotWritable.code(), "not-writable");
        assert_eq!(
            TransportFailure::WriteFailed("broken pipe".to_string()).code(),
            "write-failed"
        );
        assert_eq!(TransportFailure::Timeout(5000).code(), "timeout");
    }

    #[test]
    fn test_transport_error_display_includes_code() {
        let err: Error = TransportFailure::Timeout(250).into();
        assert_eq!(
            err.to_string(),
            "Transport failure (timeout): stream did not drain within 250ms"
        );
    }

    #[test]
    fn test_handshake_errors() {
        let err = Error::HandshakeFailed("no assets match 10.0.0.9".to_string());
        assert_eq!(
            err.to_string(),
            "Bastion handshake failed: no assets match 10.0.0.9"
        );

        let err = Error::HandshakeTimeout(35000);
        assert_eq!(err.to_string(), "Bastion handshake timed out after 35000ms");
    }

    #[test]
    fn test_transport_unavailable_error() {
        let err = Error::TransportUnavailable("plugin:teleport".to_string());
        assert_eq!(err.to_string(), "No transport registered for plugin:teleport");
    }

    #[test]
    fn test_config_error() {
        let err = Error::Config("detector.max_calls must be > 0".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: detector.max_calls must be > 0"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_err = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let err: Error = json_err.into();
        assert!(matches!(err, Error::Serialization(_)));
    }

    #[test]
    fn test_error_debug() {
        let err = Error::InvalidInput("test".to_string());
        let debug_str = format!("{err:?}");
        assert!(debug_str.contains("InvalidInput"));
    }
}
