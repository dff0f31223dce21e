//! SurrealDB-backed BuildLedger implementation
//!
//! Uses `schema::BuildRow` and `schema::BuildEventRow` for persistence,
//! converting to/from `ledger` types at the boundary.

use std::path::Path;

use async_trait::async_trait;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::ledger::{
    BuildEvent, BuildId, BuildLedger, BuildMetadata, BuildRecord, BuildStatus, BuildSummary,
    ContentDigest, StorageResult,
};
use crate::migrations;
use crate::schema::{BuildEventRow, BuildRow};

const NAMESPACE: &str = "ess";
const DATABASE: &str = "ci";

/// Environment variable overriding the ledger endpoint (e.g. `mem://`, `ws://host:8000`).
pub const LEDGER_URL_ENV: &str = "ESS_LEDGER_URL";

/// SurrealDB-backed implementation of [`BuildLedger`].
pub struct SurrealBuildLedger {
    db: Surreal<Any>,
}

impl SurrealBuildLedger {
    /// Connect to an arbitrary SurrealDB endpoint and initialise the schema.
    pub async fn connect(url: &str) -> crate::Result<Self> {
        let db = surrealdb::engine::any::connect(url)
            .await
            .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))?;

        db.use_ns(NAMESPACE)
            .use_db(DATABASE)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db)
            .await
            .map_err(|e| StateError::SchemaSetup(e.to_string()))?;

        info!(url = %url, "Build ledger connected");
        Ok(Self { db })
    }

    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect("mem://").await
    }

    /// Open the on-disk ledger under `state_dir/ledger`, unless
    /// `ESS_LEDGER_URL` points somewhere else.
    pub async fn open(state_dir: &Path) -> crate::Result<Self> {
        if let Ok(url) = std::env::var(LEDGER_URL_ENV) {
            return Self::connect(&url).await;
        }

        let path = state_dir.join("ledger");
        std::fs::create_dir_all(&path).map_err(|e| {
            StateError::Connection(format!(
                "Failed to create ledger directory {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::connect(&format!("surrealkv://{}", path.display())).await
    }

    // -- private helpers -----------------------------------------------------

    async fn fetch_row(&self, bid: &str) -> StorageResult<BuildRow> {
        let mut res = self
            .db
            .query("SELECT * FROM builds WHERE build_id = $bid")
            .bind(("bid", bid.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BuildRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: bid.to_string(),
            })
    }

    async fn fetch_running(&self, bid: &str) -> StorageResult<BuildRow> {
        let row = self.fetch_row(bid).await?;
        if row.status != BuildStatus::Running.as_str() {
            return Err(StorageError::InvalidBuildState {
                build_id: bid.to_string(),
                status: row.status,
                expected: BuildStatus::Running.to_string(),
            });
        }
        Ok(row)
    }

    async fn last_seq(&self, bid: &str) -> StorageResult<Option<u64>> {
        let mut res = self
            .db
            .query("SELECT * FROM build_events WHERE build_id = $bid ORDER BY seq DESC LIMIT 1")
            .bind(("bid", bid.to_string()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BuildEventRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(rows.first().map(|r| r.seq))
    }

    fn row_to_record(row: BuildRow) -> StorageResult<BuildRecord> {
        let status = BuildStatus::parse(&row.status).ok_or_else(|| {
            StorageError::Backend(format!("unknown build status: {}", row.status))
        })?;

        let summary = if status.is_terminal() {
            Some(BuildSummary {
                total_events: row.total_events,
                duration_ms: row.duration_ms,
                failed_stages: row.failed_stages,
                unstable_stages: row.unstable_stages,
            })
        } else {
            None
        };

        Ok(BuildRecord {
            build_id: BuildId(row.build_id),
            definition_digest: ContentDigest::try_from(row.definition_digest)?,
            metadata: BuildMetadata {
                job: row.job,
                build_number: row.build_number,
                change_key: row.change_key,
                git_ref: row.git_ref,
                tags: row.tags,
            },
            status,
            summary,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }

    fn row_to_event(row: BuildEventRow) -> BuildEvent {
        BuildEvent {
            seq: row.seq,
            kind: row.kind,
            payload: row.payload,
            timestamp: row.timestamp,
        }
    }
}

#[async_trait]
impl BuildLedger for SurrealBuildLedger {
    async fn create_build(
        &self,
        definition_digest: &ContentDigest,
        metadata: BuildMetadata,
    ) -> StorageResult<BuildId> {
        let build_id = BuildId::new();
        let row = BuildRow::new(
            build_id.0.clone(),
            definition_digest.as_str().to_string(),
            metadata.job,
            metadata.build_number,
            metadata.change_key,
            metadata.git_ref,
            metadata.tags,
        );

        debug!(build_id = %build_id, "creating build");

        let _created: Option<BuildRow> = self
            .db
            .create("builds")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(build_id)
    }

    async fn append_event(&self, build_id: &BuildId, event: BuildEvent) -> StorageResult<()> {
        self.fetch_running(&build_id.0).await?;

        if let Some(last) = self.last_seq(&build_id.0).await? {
            if event.seq <= last {
                return Err(StorageError::OutOfOrderEvent {
                    build_id: build_id.0.clone(),
                    seq: event.seq,
                    last,
                });
            }
        }

        let row = BuildEventRow::new(
            build_id.0.clone(),
            event.seq,
            event.kind,
            event.payload,
            event.timestamp,
        );

        let _created: Option<BuildEventRow> = self
            .db
            .create("build_events")
            .content(row)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn finish_build(
        &self,
        build_id: &BuildId,
        status: BuildStatus,
        summary: BuildSummary,
    ) -> StorageResult<()> {
        if !status.is_terminal() {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.0.clone(),
                status: status.to_string(),
                expected: "a terminal status".to_string(),
            });
        }

        let row = self.fetch_running(&build_id.0).await?;
        let updated = row.finish(
            status.as_str(),
            summary.total_events,
            summary.duration_ms,
            summary.failed_stages,
            summary.unstable_stages,
        );

        self.db
            .query("UPDATE builds CONTENT $row WHERE build_id = $bid")
            .bind(("row", updated))
            .bind(("bid", build_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn get_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord> {
        let row = self.fetch_row(&build_id.0).await?;
        Self::row_to_record(row)
    }

    async fn get_events(&self, build_id: &BuildId) -> StorageResult<Vec<BuildEvent>> {
        self.fetch_row(&build_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM build_events WHERE build_id = $bid ORDER BY seq ASC")
            .bind(("bid", build_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        let rows: Vec<BuildEventRow> = res
            .take(0)
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        Ok(rows.into_iter().map(Self::row_to_event).collect())
    }

    async fn list_builds(&self, job: Option<&str>) -> StorageResult<Vec<BuildRecord>> {
        let rows: Vec<BuildRow> = if let Some(job) = job {
            let mut res = self
                .db
                .query("SELECT * FROM builds WHERE job = $job ORDER BY created_at DESC")
                .bind(("job", job.to_string()))
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        } else {
            let mut res = self
                .db
                .query("SELECT * FROM builds ORDER BY created_at DESC")
                .await
                .map_err(|e| StorageError::Backend(e.to_string()))?;
            res.take(0)
                .map_err(|e| StorageError::Backend(e.to_string()))?
        };

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn delete_build(&self, build_id: &BuildId) -> StorageResult<()> {
        let row = self.fetch_row(&build_id.0).await?;
        if row.status == BuildStatus::Running.as_str() {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.0.clone(),
                status: row.status,
                expected: "a finished build".to_string(),
            });
        }

        self.db
            .query("DELETE build_events WHERE build_id = $bid; DELETE builds WHERE build_id = $bid;")
            .bind(("bid", build_id.0.clone()))
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?
            .check()
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        debug!(build_id = %build_id, "deleted build");
        Ok(())
    }
}
