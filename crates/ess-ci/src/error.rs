//! Error taxonomy for the pipeline engine.

use std::path::PathBuf;

use ess_state::StorageError;

/// Pipeline engine errors.
///
/// Stage failures are *not* errors: a stage that exits non-zero, times out
/// or is aborted produces a [`crate::StageResult`]. These variants cover
/// definitions that cannot be loaded and infrastructure that cannot be
/// reached.
#[derive(Debug, thiserror::Error)]
pub enum CiError {
    #[error("failed to read pipeline definition {path}: {source}")]
    ReadDefinition {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse pipeline definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid pipeline definition: {0}")]
    InvalidDefinition(String),

    #[error("stage {stage} has an empty command")]
    EmptyCommand { stage: String },

    #[error("stage {stage}: failed to spawn {program}: {source}")]
    Spawn {
        stage: String,
        program: String,
        source: std::io::Error,
    },

    #[error("stage {stage}: failed waiting for process: {source}")]
    Wait {
        stage: String,
        source: std::io::Error,
    },

    #[error("checkout of {dependency} failed: {message}")]
    Checkout { dependency: String, message: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ledger error: {0}")]
    Storage(#[from] StorageError),
}

/// Result type for pipeline engine operations.
pub type Result<T> = std::result::Result<T, CiError>;
