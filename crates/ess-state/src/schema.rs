//! Row types for the ledger's SurrealDB tables
//!
//! Tables:
//! - builds: one row per build
//! - build_events: ordered events, keyed by (build_id, seq)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Module for serializing chrono DateTime to SurrealDB datetime format
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Module for serializing optional chrono DateTime to SurrealDB datetime format
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Build row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRow {
    /// SurrealDB record ID
    #[serde(skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique build ID (UUID string)
    pub build_id: String,
    /// Pipeline definition digest (SHA256)
    pub definition_digest: String,
    pub job: String,
    pub build_number: u64,
    pub change_key: String,
    pub git_ref: Option<String>,
    /// Arbitrary tags (JSON)
    pub tags: serde_json::Value,
    /// "running" | "succeeded" | "unstable" | "failed" | "aborted"
    pub status: String,
    pub total_events: u64,
    pub duration_ms: u64,
    #[serde(default)]
    pub failed_stages: Vec<String>,
    #[serde(default)]
    pub unstable_stages: Vec<String>,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl BuildRow {
    /// Create a new build row in "running" state
    pub fn new(
        build_id: String,
        definition_digest: String,
        job: String,
        build_number: u64,
        change_key: String,
        git_ref: Option<String>,
        tags: serde_json::Value,
    ) -> Self {
        BuildRow {
            id: None,
            build_id,
            definition_digest,
            job,
            build_number,
            change_key,
            git_ref,
            tags,
            status: "running".to_string(),
            total_events: 0,
            duration_ms: 0,
            failed_stages: Vec::new(),
            unstable_stages: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Move the row to a terminal status
    pub fn finish(
        mut self,
        status: &str,
        total_events: u64,
        duration_ms: u64,
        failed_stages: Vec<String>,
        unstable_stages: Vec<String>,
    ) -> Self {
        self.status = status.to_string();
        self.total_events = total_events;
        self.duration_ms = duration_ms;
        self.failed_stages = failed_stages;
        self.unstable_stages = unstable_stages;
        self.completed_at = Some(Utc::now());
        self
    }
}

/// Build event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildEventRow {
    /// SurrealDB record ID
    #[serde(skip_serializing)]
    pub id: Option<surrealdb::sql::Thing>,
    /// Build this event belongs to
    pub build_id: String,
    /// Monotonic sequence number within the build (1-indexed)
    pub seq: u64,
    pub kind: String,
    /// Event payload (JSON)
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl BuildEventRow {
    pub fn new(
        build_id: String,
        seq: u64,
        kind: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        BuildEventRow {
            id: None,
            build_id,
            seq,
            kind,
            payload,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_row_is_running() {
        let row = BuildRow::new(
            "b1".into(),
            "d".into(),
            "ts_envsensors".into(),
            3,
            "ts_envsensors/develop".into(),
            Some("develop".into()),
            serde_json::json!({}),
        );
        assert_eq!(row.status, "running");
        assert!(row.completed_at.is_none());
    }

    #[test]
    fn test_finish_sets_terminal_fields() {
        let row = BuildRow::new(
            "b1".into(),
            "d".into(),
            "job".into(),
            1,
            "job/main".into(),
            None,
            serde_json::json!({}),
        )
        .finish("unstable", 9, 1200, vec![], vec!["publish docs".into()]);
        assert_eq!(row.status, "unstable");
        assert_eq!(row.total_events, 9);
        assert_eq!(row.unstable_stages, vec!["publish docs".to_string()]);
        assert!(row.completed_at.is_some());
    }
}
