//! In-memory fakes for the ledger trait (testing only)
//!
//! `MemoryBuildLedger` satisfies the [`BuildLedger`] contract without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::ledger::*;

#[derive(Debug)]
struct BuildState {
    record: BuildRecord,
    events: Vec<BuildEvent>,
}

/// In-memory build ledger backed by a `HashMap<BuildId, BuildState>`.
#[derive(Debug, Default)]
pub struct MemoryBuildLedger {
    builds: Mutex<HashMap<String, BuildState>>,
}

impl MemoryBuildLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<String, BuildState>>> {
        self.builds
            .lock()
            .map_err(|_| StorageError::Backend("memory ledger lock poisoned".to_string()))
    }
}

fn running_state<'a>(
    builds: &'a mut HashMap<String, BuildState>,
    build_id: &BuildId,
) -> StorageResult<&'a mut BuildState> {
    let state = builds
        .get_mut(&build_id.0)
        .ok_or_else(|| StorageError::BuildNotFound {
            build_id: build_id.0.clone(),
        })?;
    if state.record.status != BuildStatus::Running {
        return Err(StorageError::InvalidBuildState {
            build_id: build_id.0.clone(),
            status: state.record.status.to_string(),
            expected: BuildStatus::Running.to_string(),
        });
    }
    Ok(state)
}

#[async_trait]
impl BuildLedger for MemoryBuildLedger {
    async fn create_build(
        &self,
        definition_digest: &ContentDigest,
        metadata: BuildMetadata,
    ) -> StorageResult<BuildId> {
        let build_id = BuildId::new();
        let record = BuildRecord {
            build_id: build_id.clone(),
            definition_digest: definition_digest.clone(),
            metadata,
            status: BuildStatus::Running,
            summary: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let mut builds = self.lock()?;
        builds.insert(
            build_id.0.clone(),
            BuildState {
                record,
                events: Vec::new(),
            },
        );
        Ok(build_id)
    }

    async fn append_event(&self, build_id: &BuildId, event: BuildEvent) -> StorageResult<()> {
        let mut builds = self.lock()?;
        let state = running_state(&mut builds, build_id)?;
        if let Some(last) = state.events.last() {
            if event.seq <= last.seq {
                return Err(StorageError::OutOfOrderEvent {
                    build_id: build_id.0.clone(),
                    seq: event.seq,
                    last: last.seq,
                });
            }
        }
        state.events.push(event);
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
        let mut builds = self.lock()?;
        let state = running_state(&mut builds, build_id)?;
        state.record.status = status;
        state.record.summary = Some(summary);
        state.record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn get_build(&self, build_id: &BuildId) -> StorageResult<BuildRecord> {
        let builds = self.lock()?;
        builds
            .get(&build_id.0)
            .map(|s| s.record.clone())
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })
    }

    async fn get_events(&self, build_id: &BuildId) -> StorageResult<Vec<BuildEvent>> {
        let builds = self.lock()?;
        let state = builds
            .get(&build_id.0)
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })?;
        let mut events = state.events.clone();
        events.sort_by_key(|e| e.seq);
        Ok(events)
    }

    async fn list_builds(&self, job: Option<&str>) -> StorageResult<Vec<BuildRecord>> {
        let builds = self.lock()?;
        let mut records: Vec<BuildRecord> = builds
            .values()
            .filter(|s| job.map(|j| s.record.metadata.job == j).unwrap_or(true))
            .map(|s| s.record.clone())
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.metadata.build_number.cmp(&a.metadata.build_number))
        });
        Ok(records)
    }

    async fn delete_build(&self, build_id: &BuildId) -> StorageResult<()> {
        let mut builds = self.lock()?;
        let state = builds
            .get(&build_id.0)
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })?;
        if state.record.status == BuildStatus::Running {
            return Err(StorageError::InvalidBuildState {
                build_id: build_id.0.clone(),
                status: BuildStatus::Running.to_string(),
                expected: "a finished build".to_string(),
            });
        }
        builds.remove(&build_id.0);
        Ok(())
    }
}

impl MemoryBuildLedger {
    /// Backdate a build's creation time (retention tests).
    pub fn set_created_at(
        &self,
        build_id: &BuildId,
        created_at: chrono::DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut builds = self.lock()?;
        let state = builds
            .get_mut(&build_id.0)
            .ok_or_else(|| StorageError::BuildNotFound {
                build_id: build_id.0.clone(),
            })?;
        state.record.created_at = created_at;
        Ok(())
    }
}
