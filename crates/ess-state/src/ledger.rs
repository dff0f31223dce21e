//! Build ledger trait and record types.
//!
//! A build is created in the `Running` state, receives an ordered stream
//! of events and is finished exactly once with a terminal status. In-memory
//! fakes live in the `fakes` module; the SurrealDB backend lives in
//! `surreal_ledger`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::StorageError;

/// Result type for ledger operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

// ---------------------------------------------------------------------------
// ContentDigest
// ---------------------------------------------------------------------------

/// Content digest (SHA-256 hex string).
///
/// The inner field is private to guarantee the string is always valid
/// lowercase hex produced by `from_bytes` or validated via `TryFrom<String>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest(String);

impl ContentDigest {
    /// Compute the SHA-256 digest of the given bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        use sha2::Digest;
        let mut hasher = Sha256::new();
        hasher.update(data);
        ContentDigest(hex::encode(hasher.finalize()))
    }

    /// Return the full hex string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short form (first 12 hex chars).
    pub fn short(&self) -> &str {
        &self.0[..12.min(self.0.len())]
    }
}

impl TryFrom<String> for ContentDigest {
    type Error = StorageError;

    fn try_from(s: String) -> std::result::Result<Self, Self::Error> {
        if s.len() != 64 || !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StorageError::InvalidDigest { digest: s });
        }
        Ok(ContentDigest(s.to_ascii_lowercase()))
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Build records
// ---------------------------------------------------------------------------

/// Unique identifier for a build
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildId(pub String);

impl BuildId {
    /// Generate a new random BuildId
    pub fn new() -> Self {
        BuildId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for BuildId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BuildId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Metadata attached to a build at creation time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildMetadata {
    /// Job (pipeline) name
    pub job: String,
    /// Per-job build number
    pub build_number: u64,
    /// Identity of "the same change" for superseding builds
    pub change_key: String,
    /// Git reference the build resolved to
    pub git_ref: Option<String>,
    /// Arbitrary key-value tags
    pub tags: serde_json::Value,
}

/// A single event in a build
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEvent {
    /// Monotonic sequence number within the build (1-based)
    pub seq: u64,
    /// Event kind (e.g. "stage_started", "stage_failed")
    pub kind: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Timestamp
    pub timestamp: DateTime<Utc>,
}

/// Status of a build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Running,
    Succeeded,
    Unstable,
    Failed,
    Aborted,
}

impl BuildStatus {
    /// Lowercase name used in storage rows.
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Running => "running",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Unstable => "unstable",
            BuildStatus::Failed => "failed",
            BuildStatus::Aborted => "aborted",
        }
    }

    /// Parse a storage row status.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(BuildStatus::Running),
            "succeeded" => Some(BuildStatus::Succeeded),
            "unstable" => Some(BuildStatus::Unstable),
            "failed" => Some(BuildStatus::Failed),
            "aborted" => Some(BuildStatus::Aborted),
            _ => None,
        }
    }

    /// Whether the status is final.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Running)
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary produced when a build finishes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    /// Total events recorded
    pub total_events: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Stages whose failure failed the build
    #[serde(default)]
    pub failed_stages: Vec<String>,
    /// Stages whose failure downgraded the build to unstable
    #[serde(default)]
    pub unstable_stages: Vec<String>,
}

/// Full build record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: BuildId,
    pub definition_digest: ContentDigest,
    pub metadata: BuildMetadata,
    pub status: BuildStatus,
    pub summary: Option<BuildSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Build ledger.
///
/// Guarantees:
/// - Events are ordered by strictly increasing `seq` within a build.
/// - A build transitions: Running → Succeeded | Unstable | Failed | Aborted (terminal).
/// - Finished builds are immutable; running builds cannot be deleted.
#[async_trait]
pub trait BuildLedger: Send + Sync {
    /// Create a new build, returning its unique ID.
    async fn create_build(
        &self,
        definition_digest: &ContentDigest,
        metadata: BuildMetadata,
    ) -> StorageResult<BuildId>;

    /// Append an event to a running build.
    async fn append_event(&self, build_id: &BuildId, event: BuildEvent) -> StorageResult<()>;

    /// Finish a running build with a terminal status and summary.
    async fn finish_build(
        &self,
        build_id: &BuildId,
        status: BuildStatus,
        summary: BuildSummary,
    ) -> StorageResult<()>;

    /// Retrieve a build record by ID.
    async fn get_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord>;

    /// Retrieve all events for a build, ordered by seq.
    async fn get_events(&self, build_id: &BuildId) -> StorageResult<Vec<BuildEvent>>;

    /// List builds newest first, optionally filtered by job.
    async fn list_builds(&self, job: Option<&str>) -> StorageResult<Vec<BuildRecord>>;

    /// Delete a finished build and its events.
    async fn delete_build(&self, build_id: &BuildId) -> StorageResult<()>;

    /// Next build number for a job (one past the highest recorded).
    async fn next_build_number(&self, job: &str) -> StorageResult<u64> {
        let builds = self.list_builds(Some(job)).await?;
        Ok(builds
            .iter()
            .map(|b| b.metadata.build_number)
            .max()
            .unwrap_or(0)
            + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_names() {
        for status in [
            BuildStatus::Running,
            BuildStatus::Succeeded,
            BuildStatus::Unstable,
            BuildStatus::Failed,
            BuildStatus::Aborted,
        ] {
            assert_eq!(BuildStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BuildStatus::parse("RUNNING"), None);
    }

    #[test]
    fn test_only_running_is_not_terminal() {
        assert!(!BuildStatus::Running.is_terminal());
        assert!(BuildStatus::Unstable.is_terminal());
        assert!(BuildStatus::Aborted.is_terminal());
    }

    #[test]
    fn test_digest_rejects_bad_hex() {
        let err = ContentDigest::try_from("xyz".to_string()).unwrap_err();
        assert!(matches!(err, StorageError::InvalidDigest { .. }));

        let digest = ContentDigest::from_bytes(b"pipeline");
        let parsed = ContentDigest::try_from(digest.as_str().to_uppercase()).unwrap();
        assert_eq!(parsed, digest);
        assert_eq!(digest.short().len(), 12);
    }
}
