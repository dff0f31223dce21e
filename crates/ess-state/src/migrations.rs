//! SurrealDB schema initialization for the build ledger
//!
//! Safe to call on every connection; all definitions are idempotent.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize the ledger tables in SurrealDB
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing build ledger schema");

    init_builds_table(db).await?;
    init_build_events_table(db).await?;

    info!("Build ledger schema ready");
    Ok(())
}

/// Initialize `builds` table with constraints and indexes
///
/// Schema:
/// ```text
/// TABLE builds {
///   build_id:          STRING (unique)
///   definition_digest: STRING
///   job:               STRING (indexed)
///   build_number:      INT
///   change_key:        STRING (indexed)
///   git_ref:           STRING?
///   tags:              OBJECT
///   status:            STRING (running | succeeded | unstable | failed | aborted)
///   total_events:      INT
///   duration_ms:       INT
///   failed_stages:     ARRAY<STRING>
///   unstable_stages:   ARRAY<STRING>
///   created_at:        DATETIME (indexed)
///   completed_at:      DATETIME?
/// }
/// ```
///
/// Status transitions and immutability of finished builds are enforced by
/// the ledger, not the database.
async fn init_builds_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing builds table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS builds SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_build_id ON TABLE builds COLUMNS build_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_job ON TABLE builds COLUMNS job;
        DEFINE INDEX IF NOT EXISTS idx_change_key ON TABLE builds COLUMNS change_key;
        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE builds COLUMNS created_at;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}

/// Initialize `build_events` table
///
/// `(build_id, seq)` is unique; sequence ordering is checked on append.
async fn init_build_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing build_events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS build_events SCHEMALESS;

        DEFINE INDEX IF NOT EXISTS idx_build_seq ON TABLE build_events COLUMNS build_id, seq UNIQUE;
    "#;

    db.query(sql).await?.check()?;
    Ok(())
}
