//! Error types for ess-state

use thiserror::Error;

/// Errors raised while connecting to or initialising the ledger database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by [`crate::BuildLedger`] operations
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("build not found: {build_id}")]
    BuildNotFound { build_id: String },

    #[error("build {build_id} is {status}, expected {expected}")]
    InvalidBuildState {
        build_id: String,
        status: String,
        expected: String,
    },

    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    #[error("event seq {seq} is not after {last} for build {build_id}")]
    OutOfOrderEvent {
        build_id: String,
        seq: u64,
        last: u64,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_build_state_display() {
        let err = StorageError::InvalidBuildState {
            build_id: "b-1".to_string(),
            status: "failed".to_string(),
            expected: "running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("b-1"));
        assert!(msg.contains("failed"));
        assert!(msg.contains("running"));
    }

    #[test]
    fn test_state_error_from_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        let err: StateError = json_err.into();
        assert!(matches!(err, StateError::Serialization(_)));
    }
}
