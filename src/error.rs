//! Error types for the Asclepius learning loop
//!
//! This module provides structured error definitions using thiserror, with
//! anyhow accepted as a conversion source at the edges.

use thiserror::Error;

/// Main error type for Asclepius operations
#[derive(Error, Debug)]
pub enum AsclepiusError {
    /// Evaluation was requested over zero prediction records
    #[error("Empty input: {0}")]
    EmptyInput(String),

    /// The inference service failed for a single case
    #[error("Inference error for case {case_id}: {message}")]
    Inference { case_id: String, message: String },

    /// The inference service did not answer in time
    #[error("Inference timed out for case {case_id} after {timeout_ms}ms")]
    InferenceTimeout { case_id: String, timeout_ms: u64 },

    /// A store call or a whole session exceeded its time budget
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Database operation failed
    #[error("Database error: {0}")]
    Database(String),

    /// A training session failed and was marked as such
    #[error("Training session {session_id} failed: {message}")]
    SessionFailure { session_id: String, message: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid operation (e.g., approving a running session)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl AsclepiusError {
    /// Whether this error is confined to a single case and must not abort a batch
    pub fn is_per_case(&self) -> bool {
        matches!(
            self,
            AsclepiusError::Inference { .. } | AsclepiusError::InferenceTimeout { .. }
        )
    }
}

/// Result type alias for Asclepius operations
pub type Result<T> = std::result::Result<T, AsclepiusError>;

impl From<libsql::Error> for AsclepiusError {
    fn from(err: libsql::Error) -> Self {
        AsclepiusError::Database(err.to_string())
    }
}

impl From<::config::ConfigError> for AsclepiusError {
    fn from(err: ::config::ConfigError) -> Self {
        AsclepiusError::Config(err.to_string())
    }
}

impl From<toml::de::Error> for AsclepiusError {
    fn from(err: toml::de::Error) -> Self {
        AsclepiusError::Config(err.to_string())
    }
}

/// Convert anyhow::Error to AsclepiusError
impl From<anyhow::Error> for AsclepiusError {
    fn from(err: anyhow::Error) -> Self {
        AsclepiusError::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AsclepiusError::SessionFailure {
            session_id: "session-1".to_string(),
            message: "store offline".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "Training session session-1 failed: store offline"
        );
    }

    #[test]
    fn test_per_case_classification() {
        let timeout = AsclepiusError::InferenceTimeout {
            case_id: "c1".to_string(),
            timeout_ms: 100,
        };
        assert!(timeout.is_per_case());
        assert!(!AsclepiusError::Database("locked".to_string()).is_per_case());
        assert!(!AsclepiusError::Timeout {
            operation: "read_outcomes_since".to_string(),
            timeout_ms: 10_000,
        }
        .is_per_case());
    }

    #[test]
    fn test_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json");
        assert!(json_err.is_err());

        let err: AsclepiusError = json_err.unwrap_err().into();
        assert!(matches!(err, AsclepiusError::Serialization(_)));
    }
}
