//! Build retention: keep at most N builds per job and nothing older than D
//! days, whichever limit is hit first.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ess_state::{BuildId, BuildLedger, BuildStatus, BuildSummary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::event::BuildEventKind;
use crate::outcome::BuildOutcome;
use crate::recording::BuildRecorder;

fn default_max_builds() -> Option<usize> {
    Some(10)
}

fn default_max_age_days() -> Option<u64> {
    Some(14)
}

/// Policy controlling which finished builds are pruned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many builds (newest first).
    #[serde(default = "default_max_builds")]
    pub max_builds: Option<usize>,
    /// Remove builds older than this many days.
    #[serde(default = "default_max_age_days")]
    pub max_age_days: Option<u64>,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_builds: default_max_builds(),
            max_age_days: default_max_age_days(),
        }
    }
}

/// Result of a pruning pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneResult {
    pub removed: Vec<BuildId>,
    pub kept: usize,
}

/// Directory holding a build's archived artifacts.
pub fn build_dir(state_dir: &Path, build_id: &BuildId) -> std::path::PathBuf {
    state_dir.join("builds").join(&build_id.0)
}

/// Close builds left running by a process that is gone.
///
/// A build still `Running` more than `max_duration` after it was created has
/// outlived anything that could still be running it. It is finished as
/// aborted, so retention counts and removes it like any other build.
pub async fn abandon_stale_builds(
    ledger: Arc<dyn BuildLedger>,
    job: &str,
    max_duration: std::time::Duration,
    now: DateTime<Utc>,
) -> Result<Vec<BuildId>> {
    let Some(cutoff) = chrono::Duration::from_std(max_duration)
        .ok()
        .and_then(|d| now.checked_sub_signed(d))
    else {
        return Ok(Vec::new());
    };

    let mut abandoned = Vec::new();
    for build in ledger.list_builds(Some(job)).await? {
        if build.status != BuildStatus::Running || build.created_at >= cutoff {
            continue;
        }
        warn!(
            build_id = %build.build_id,
            build_number = build.metadata.build_number,
            "closing abandoned build"
        );
        let recorder = BuildRecorder::resume(ledger.clone(), build.build_id.clone()).await?;
        recorder
            .record(
                BuildEventKind::BuildAborted {
                    reason: "abandoned by its runner".to_string(),
                },
                Value::Null,
            )
            .await?;
        let summary = BuildSummary {
            duration_ms: (now - build.created_at).num_milliseconds().max(0) as u64,
            ..BuildSummary::default()
        };
        recorder.finish(BuildOutcome::Aborted, summary).await?;
        abandoned.push(build.build_id);
    }
    Ok(abandoned)
}

/// Prune a job's builds.
///
/// Builds are ranked newest first. A finished build is removed when its rank
/// reaches `max_builds` or it was created before `now - max_age_days`.
/// Running builds count towards the limit but are never removed. When
/// `state_dir` is given, the build's artifact directory is removed too.
pub async fn prune_builds(
    ledger: &dyn BuildLedger,
    job: &str,
    policy: &RetentionPolicy,
    state_dir: Option<&Path>,
    now: DateTime<Utc>,
) -> Result<PruneResult> {
    let builds = ledger.list_builds(Some(job)).await?;
    let cutoff = policy
        .max_age_days
        .map(|days| now - chrono::Duration::days(days as i64));

    let mut removed = Vec::new();
    for (rank, build) in builds.iter().enumerate() {
        if build.status == BuildStatus::Running {
            continue;
        }
        let over_count = policy.max_builds.map(|max| rank >= max).unwrap_or(false);
        let too_old = cutoff.map(|c| build.created_at < c).unwrap_or(false);
        if !(over_count || too_old) {
            continue;
        }

        debug!(
            build_id = %build.build_id,
            build_number = build.metadata.build_number,
            over_count,
            too_old,
            "pruning build"
        );
        ledger.delete_build(&build.build_id).await?;

        if let Some(state_dir) = state_dir {
            let dir = build_dir(state_dir, &build.build_id);
            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = %dir.display(), error = %e, "failed to remove build artifacts"),
            }
        }
        removed.push(build.build_id.clone());
    }

    let kept = builds.len() - removed.len();
    info!(job = %job, removed = removed.len(), kept, "retention pass complete");
    Ok(PruneResult { removed, kept })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use ess_state::fakes::MemoryBuildLedger;
    use crate::gate::CiGate;
    use ess_state::{BuildMetadata, ContentDigest};
    use serde_json::json;

    async fn add_build(
        ledger: &MemoryBuildLedger,
        job: &str,
        number: u64,
        age: Duration,
        finished: bool,
    ) -> BuildId {
        let id = ledger
            .create_build(
                &ContentDigest::from_bytes(b"def"),
                BuildMetadata {
                    job: job.to_string(),
                    build_number: number,
                    change_key: format!("{job}/develop"),
                    git_ref: None,
                    tags: json!({}),
                },
            )
            .await
            .unwrap();
        ledger.set_created_at(&id, Utc::now() - age).unwrap();
        if finished {
            ledger
                .finish_build(&id, BuildStatus::Succeeded, BuildSummary::default())
                .await
                .unwrap();
        }
        id
    }

    #[test]
    fn test_default_policy_is_ten_builds_fourteen_days() {
        let policy = RetentionPolicy::default();
        assert_eq!(policy.max_builds, Some(10));
        assert_eq!(policy.max_age_days, Some(14));
    }

    #[tokio::test]
    async fn test_count_limit_removes_oldest() {
        let ledger = MemoryBuildLedger::new();
        let mut ids = Vec::new();
        for n in 1..=12 {
            let age = Duration::minutes(100 - n as i64);
            ids.push(add_build(&ledger, "job", n, age, true).await);
        }

        let result = prune_builds(&ledger, "job", &RetentionPolicy::default(), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.removed.len(), 2);
        assert!(result.removed.contains(&ids[0]));
        assert!(result.removed.contains(&ids[1]));
        assert_eq!(result.kept, 10);
        assert_eq!(ledger.list_builds(Some("job")).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_age_limit_hits_first() {
        let ledger = MemoryBuildLedger::new();
        let old = add_build(&ledger, "job", 1, Duration::days(20), true).await;
        let fresh = add_build(&ledger, "job", 2, Duration::days(1), true).await;

        let result = prune_builds(&ledger, "job", &RetentionPolicy::default(), None, Utc::now())
            .await
            .unwrap();

        assert_eq!(result.removed, vec![old]);
        assert!(ledger.get_build(&fresh).await.is_ok());
    }

    #[tokio::test]
    async fn test_running_builds_never_pruned() {
        let ledger = MemoryBuildLedger::new();
        let running = add_build(&ledger, "job", 1, Duration::days(30), false).await;

        let result = prune_builds(&ledger, "job", &RetentionPolicy::default(), None, Utc::now())
            .await
            .unwrap();

        assert!(result.removed.is_empty());
        assert!(ledger.get_build(&running).await.is_ok());
    }

    #[tokio::test]
    async fn test_abandoned_running_build_closed_then_pruned() {
        let ledger = Arc::new(MemoryBuildLedger::new());
        let abandoned = add_build(&ledger, "job", 1, Duration::days(20), false).await;
        let live = add_build(&ledger, "job", 2, Duration::minutes(5), false).await;

        let closed = abandon_stale_builds(
            ledger.clone(),
            "job",
            std::time::Duration::from_secs(3600),
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(closed, vec![abandoned.clone()]);

        let record = ledger.get_build(&abandoned).await.unwrap();
        assert_eq!(record.status, BuildStatus::Aborted);
        let events = ledger.get_events(&abandoned).await.unwrap();
        let kinds: Vec<_> = events.iter().map(|e| e.kind.as_str()).collect();
        assert_eq!(kinds, vec!["build_aborted", "build_finished"]);
        assert_eq!(CiGate::evaluate(&events).outcome, BuildOutcome::Aborted);

        assert_eq!(
            ledger.get_build(&live).await.unwrap().status,
            BuildStatus::Running
        );

        let result = prune_builds(
            ledger.as_ref(),
            "job",
            &RetentionPolicy::default(),
            None,
            Utc::now(),
        )
        .await
        .unwrap();
        assert_eq!(result.removed, vec![abandoned]);
    }

    #[tokio::test]
    async fn test_other_jobs_untouched() {
        let ledger = MemoryBuildLedger::new();
        let other = add_build(&ledger, "other", 1, Duration::days(30), true).await;
        add_build(&ledger, "job", 1, Duration::days(30), true).await;

        prune_builds(&ledger, "job", &RetentionPolicy::default(), None, Utc::now())
            .await
            .unwrap();

        assert!(ledger.get_build(&other).await.is_ok());
    }

    #[tokio::test]
    async fn test_artifact_directory_removed() {
        let ledger = MemoryBuildLedger::new();
        let state = tempfile::tempdir().unwrap();
        let old = add_build(&ledger, "job", 1, Duration::days(20), true).await;
        let dir = build_dir(state.path(), &old).join("artifacts");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("junit.xml"), "<testsuite/>").unwrap();

        prune_builds(
            &ledger,
            "job",
            &RetentionPolicy::default(),
            Some(state.path()),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(!build_dir(state.path(), &old).exists());
    }

    #[tokio::test]
    async fn test_unlimited_policy_keeps_everything() {
        let ledger = MemoryBuildLedger::new();
        for n in 1..=3 {
            add_build(&ledger, "job", n, Duration::days(100), true).await;
        }
        let policy = RetentionPolicy {
            max_builds: None,
            max_age_days: None,
        };

        let result = prune_builds(&ledger, "job", &policy, None, Utc::now())
            .await
            .unwrap();
        assert!(result.removed.is_empty());
        assert_eq!(result.kept, 3);
    }
}
