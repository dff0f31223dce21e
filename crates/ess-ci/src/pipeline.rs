//! CI pipeline orchestration and build recording.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ess_state::{BuildId, BuildLedger, BuildMetadata, BuildSummary, ContentDigest};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::branch::{candidate_branches, resolve_git_ref};
use crate::checkout::checkout_dependencies;
use crate::context::BuildContext;
use crate::coordinator::BuildCoordinator;
use crate::definition::PipelineDefinition;
use crate::error::Result;
use crate::event::BuildEventKind;
use crate::obs;
use crate::outcome::BuildOutcome;
use crate::recording::BuildRecorder;
use crate::reports::{collect_reports, ReportCollection};
use crate::retention::build_dir;
use crate::runner::{CiRunner, StageResult};
use crate::stage::{FailurePolicy, StageAction, StageConfig};

/// Keep at most this much of a failed stage's stderr in its event.
const STDERR_TAIL_BYTES: usize = 4096;

/// Result of a complete pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub build_id: BuildId,
    pub build_number: u64,
    pub outcome: BuildOutcome,

    /// Results of the main stages that ran.
    pub stages: Vec<StageResult>,

    /// Results of the cleanup stages.
    pub cleanup: Vec<StageResult>,

    /// Stages that did not run (disabled, or skipped after a failure/abort).
    pub skipped: Vec<String>,

    pub reports: Vec<ReportCollection>,

    /// Total duration in milliseconds.
    pub duration_ms: u64,

    pub definition_digest: ContentDigest,
    pub git_ref: String,

    /// Stages whose failure failed the build.
    pub failed_stages: Vec<String>,

    /// Stages whose failure made the build unstable.
    pub unstable_stages: Vec<String>,
}

impl PipelineResult {
    /// Number of main stages that passed.
    pub fn passed_count(&self) -> usize {
        self.stages.iter().filter(|s| s.passed()).count()
    }

    /// Number of main stages that failed.
    pub fn failed_count(&self) -> usize {
        self.stages.iter().filter(|s| !s.passed()).count()
    }

    /// Result of a stage by name, main or cleanup.
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages
            .iter()
            .chain(self.cleanup.iter())
            .find(|s| s.stage_name == name)
    }
}

/// Mutable state of one running build.
struct BuildRun<'a> {
    recorder: BuildRecorder,
    definition: &'a PipelineDefinition,
    context: &'a BuildContext,
    env: BTreeMap<String, String>,
    candidates: Vec<String>,
    outcome: BuildOutcome,
    failed_stages: Vec<String>,
    unstable_stages: Vec<String>,
    skipped: Vec<String>,
}

impl BuildRun<'_> {
    /// Ledger failures must not stop the build (cleanup still has to run),
    /// so they are logged and otherwise ignored.
    async fn note(&self, kind: BuildEventKind, detail: Value) {
        if let Err(e) = self.recorder.record(kind, detail).await {
            obs::emit_record_error(&self.recorder.build_id().0, &e);
        }
    }

    async fn skip(&mut self, stage: &StageConfig, reason: &str) {
        info!(stage = %stage.name, reason = %reason, "skipping stage");
        self.note(
            BuildEventKind::StageSkipped {
                stage: stage.name.clone(),
                reason: reason.to_string(),
            },
            Value::Null,
        )
        .await;
        self.skipped.push(stage.name.clone());
    }

    async fn abort(&mut self, reason: &str) {
        if self.outcome == BuildOutcome::Aborted {
            return;
        }
        warn!(reason = %reason, "build aborted");
        self.outcome = BuildOutcome::Aborted;
        self.note(
            BuildEventKind::BuildAborted {
                reason: reason.to_string(),
            },
            Value::Null,
        )
        .await;
    }

    /// Record the start, run, and record the result of one stage, applying
    /// its failure policy to the build outcome.
    async fn execute(&mut self, stage: &StageConfig, cancel: &CancellationToken) -> StageResult {
        info!(stage = %stage.name, action = %stage.action.describe(), "executing stage");
        self.note(
            BuildEventKind::StageStarted {
                stage: stage.name.clone(),
            },
            json!({
                "action": stage.action.describe(),
                "timeout_secs": stage.timeout_secs,
                "on_failure": stage.on_failure,
            }),
        )
        .await;

        let result = self.run_action(stage, cancel).await;

        if result.passed() {
            info!(stage = %stage.name, duration_ms = result.duration_ms, "stage passed");
            self.note(
                BuildEventKind::StagePassed {
                    stage: stage.name.clone(),
                },
                json!({
                    "exit_code": result.exit_code,
                    "duration_ms": result.duration_ms,
                }),
            )
            .await;
            return result;
        }

        self.note(
            BuildEventKind::StageFailed {
                stage: stage.name.clone(),
                policy: stage.on_failure,
            },
            json!({
                "exit_code": result.exit_code,
                "duration_ms": result.duration_ms,
                "reason": result.failure_reason(),
                "timed_out": result.timed_out,
                "cancelled": result.cancelled,
                "stderr": stderr_tail(&result.stderr),
            }),
        )
        .await;

        if result.cancelled {
            self.abort(&format!("aborted during stage '{}'", stage.name))
                .await;
            return result;
        }

        match stage.on_failure {
            FailurePolicy::Fail => {
                warn!(stage = %stage.name, reason = %result.failure_reason(), "stage failed");
                self.failed_stages.push(stage.name.clone());
            }
            FailurePolicy::Unstable => {
                warn!(stage = %stage.name, reason = %result.failure_reason(), "stage failed, marking build unstable");
                self.unstable_stages.push(stage.name.clone());
            }
            FailurePolicy::Tolerate => {
                let message = stage
                    .fallback_message
                    .as_deref()
                    .unwrap_or("stage failure tolerated");
                warn!(stage = %stage.name, reason = %result.failure_reason(), "{}", message);
            }
        }
        self.outcome = self
            .outcome
            .combine(BuildOutcome::from_failure(stage.on_failure));
        result
    }

    async fn run_action(&self, stage: &StageConfig, cancel: &CancellationToken) -> StageResult {
        let mut env = self.env.clone();
        env.extend(stage.env.clone());
        let cwd = match &stage.working_dir {
            Some(dir) => self.context.workspace.join(dir),
            None => self.context.workspace.clone(),
        };

        match &stage.action {
            StageAction::Checkout => {
                let start = Instant::now();
                let checkout = checkout_dependencies(
                    &stage.name,
                    &self.definition.dependencies,
                    &self.context.packages_dir,
                    &self.candidates,
                    &env,
                    cancel,
                );
                let outcome = if stage.timeout_secs > 0 {
                    tokio::time::timeout(Duration::from_secs(stage.timeout_secs), checkout)
                        .await
                        .ok()
                } else {
                    Some(checkout.await)
                };
                let duration_ms = start.elapsed().as_millis() as u64;
                match outcome {
                    Some(Ok(checked_out)) => StageResult {
                        stage_name: stage.name.clone(),
                        exit_code: 0,
                        stdout: checked_out
                            .iter()
                            .map(|c| format!("{} -> {}\n", c.dependency, c.branch))
                            .collect(),
                        duration_ms,
                        success: true,
                        ..StageResult::default()
                    },
                    Some(Err(e)) => {
                        let mut result =
                            StageResult::infrastructure_failure(&stage.name, e.to_string(), duration_ms);
                        result.cancelled = cancel.is_cancelled();
                        result
                    }
                    None => {
                        let mut result = StageResult::infrastructure_failure(
                            &stage.name,
                            format!("checkout timed out after {} seconds", stage.timeout_secs),
                            duration_ms,
                        );
                        result.timed_out = true;
                        result
                    }
                }
            }
            action => {
                let argv = action.argv().unwrap_or_default();
                match CiRunner::execute_command(
                    &stage.name,
                    &argv,
                    &cwd,
                    &env,
                    stage.timeout_secs,
                    cancel,
                )
                .await
                {
                    Ok(result) => result,
                    Err(e) => StageResult::infrastructure_failure(&stage.name, e.to_string(), 0),
                }
            }
        }
    }

    async fn collect_reports(&self) -> Vec<ReportCollection> {
        if self.definition.reports.is_empty() {
            return Vec::new();
        }
        let artifacts_dir =
            build_dir(&self.context.state_dir, self.recorder.build_id()).join("artifacts");
        let config = self.definition.reports.clone();
        let workspace = self.context.workspace.clone();
        let archived = tokio::task::spawn_blocking(move || {
            collect_reports(&config, &workspace, &artifacts_dir)
        })
        .await;
        let collected = match archived {
            Ok(Ok(collected)) => collected,
            Ok(Err(e)) => {
                warn!(error = %e, "failed to archive reports");
                return Vec::new();
            }
            Err(e) => {
                warn!(error = %e, "report archiving task failed");
                return Vec::new();
            }
        };

        for report in &collected {
            match report {
                ReportCollection::Collected(archived) => {
                    self.note(
                        BuildEventKind::ReportCollected {
                            report: archived.kind,
                        },
                        json!({
                            "source": archived.source,
                            "destination": archived.destination,
                            "digest": archived.digest.as_str(),
                            "size_bytes": archived.size_bytes,
                            "files": archived.files,
                        }),
                    )
                    .await
                }
                ReportCollection::Missing { kind, path } => {
                    self.note(
                        BuildEventKind::ReportMissing { report: *kind },
                        json!({ "path": path }),
                    )
                    .await
                }
            }
        }
        collected
    }
}

fn stderr_tail(stderr: &str) -> &str {
    if stderr.len() <= STDERR_TAIL_BYTES {
        return stderr;
    }
    let mut start = stderr.len() - STDERR_TAIL_BYTES;
    while !stderr.is_char_boundary(start) {
        start += 1;
    }
    &stderr[start..]
}

/// CI pipeline orchestrator.
pub struct CiPipeline;

impl CiPipeline {
    /// Execute a pipeline and record every step in the ledger.
    ///
    /// Main stages run strictly in order. A failed stage with policy `fail`
    /// skips the remaining main stages; `unstable` downgrades the outcome and
    /// continues; `tolerate` logs the fallback message and continues.
    /// Cancelling `cancel` kills the running stage and skips the rest.
    /// Reports are archived next, then every cleanup stage runs regardless
    /// of the outcome, with a token that is never cancelled.
    pub async fn run(
        ledger: Arc<dyn BuildLedger>,
        definition: &PipelineDefinition,
        context: &BuildContext,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let start = Instant::now();

        let build_number = match context.build_number {
            Some(n) => n,
            None => ledger.next_build_number(&context.job).await?,
        };
        let branch = context.branch_name.as_deref();
        let change = context.change_branch.as_deref();
        let git_ref = resolve_git_ref(branch, change, &definition.default_branch);
        let candidates = candidate_branches(branch, change, &definition.default_branch);

        let metadata = BuildMetadata {
            job: context.job.clone(),
            build_number,
            change_key: context.change_key(&definition.default_branch),
            git_ref: Some(git_ref.clone()),
            tags: json!({
                "pipeline": &definition.name,
                "stages": definition.stage_names(),
                "workspace": context.workspace.to_string_lossy(),
                "branch_candidates": &candidates,
            }),
        };

        let recorder = BuildRecorder::start(ledger, &definition.digest, metadata).await?;
        let build_id = recorder.build_id().clone();
        let env = context.stage_environment(
            &build_id,
            build_number,
            &git_ref,
            &definition.environment,
        );

        let mut run = BuildRun {
            recorder,
            definition,
            context,
            env,
            candidates,
            outcome: BuildOutcome::Success,
            failed_stages: Vec::new(),
            unstable_stages: Vec::new(),
            skipped: Vec::new(),
        };

        let span = obs::build_span(&build_id.0, &context.job);
        let (stages, reports, cleanup) = async {
            let mut stages = Vec::new();
            for stage in &definition.stages {
                if cancel.is_cancelled() {
                    run.abort("build cancelled").await;
                }
                if !stage.enabled {
                    run.skip(stage, "disabled").await;
                    continue;
                }
                if !run.outcome.continues() {
                    let reason = match run.outcome {
                        BuildOutcome::Aborted => "build aborted",
                        _ => "previous stage failed",
                    };
                    run.skip(stage, reason).await;
                    continue;
                }
                stages.push(run.execute(stage, cancel).await);
            }

            let reports = run.collect_reports().await;

            let cleanup_token = CancellationToken::new();
            let mut cleanup = Vec::new();
            for stage in &definition.cleanup {
                if !stage.enabled {
                    run.skip(stage, "disabled").await;
                    continue;
                }
                cleanup.push(run.execute(stage, &cleanup_token).await);
            }
            (stages, reports, cleanup)
        }
        .instrument(span)
        .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        let outcome = run.outcome;
        let summary = BuildSummary {
            total_events: 0,
            duration_ms,
            failed_stages: run.failed_stages.clone(),
            unstable_stages: run.unstable_stages.clone(),
        };
        run.recorder.finish(outcome, summary).await?;
        info!(build_id = %build_id, outcome = %outcome, duration_ms, "pipeline finished");

        Ok(PipelineResult {
            build_id,
            build_number,
            outcome,
            stages,
            cleanup,
            skipped: run.skipped,
            reports,
            duration_ms,
            definition_digest: definition.digest.clone(),
            git_ref,
            failed_stages: run.failed_stages,
            unstable_stages: run.unstable_stages,
        })
    }

    /// Run a pipeline registered with `coordinator` under the context's
    /// change key. A newer build of the same change aborts this one when the
    /// definition sets `abort_previous`.
    pub async fn run_coordinated(
        coordinator: &BuildCoordinator,
        ledger: Arc<dyn BuildLedger>,
        definition: &PipelineDefinition,
        context: &BuildContext,
    ) -> Result<PipelineResult> {
        let ticket = coordinator.begin(
            &context.change_key(&definition.default_branch),
            definition.abort_previous,
        );
        let result = Self::run(ledger, definition, context, ticket.token()).await;
        drop(ticket);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str, exit_code: i32) -> StageResult {
        StageResult {
            stage_name: name.to_string(),
            exit_code,
            success: exit_code == 0,
            duration_ms: 100,
            ..StageResult::default()
        }
    }

    fn result(stages: Vec<StageResult>) -> PipelineResult {
        PipelineResult {
            build_id: BuildId("b1".to_string()),
            build_number: 1,
            outcome: BuildOutcome::Success,
            stages,
            cleanup: vec![stage("Cleanup", 0)],
            skipped: Vec::new(),
            reports: Vec::new(),
            duration_ms: 300,
            definition_digest: ContentDigest::from_bytes(b"def"),
            git_ref: "develop".to_string(),
            failed_stages: Vec::new(),
            unstable_stages: Vec::new(),
        }
    }

    #[test]
    fn test_pipeline_result_counts() {
        let r = result(vec![stage("Build", 0), stage("Unit tests", 0)]);
        assert_eq!(r.passed_count(), 2);
        assert_eq!(r.failed_count(), 0);
    }

    #[test]
    fn test_pipeline_result_with_failures() {
        let r = result(vec![stage("Build", 0), stage("Unit tests", 1)]);
        assert_eq!(r.passed_count(), 1);
        assert_eq!(r.failed_count(), 1);
        assert!(r.stage("Cleanup").is_some());
        assert!(r.stage("Missing").is_none());
    }

    #[test]
    fn test_stderr_tail_truncates_on_char_boundary() {
        let long = "é".repeat(STDERR_TAIL_BYTES);
        let tail = stderr_tail(&long);
        assert!(tail.len() <= STDERR_TAIL_BYTES);
        assert!(tail.chars().all(|c| c == 'é'));
        assert_eq!(stderr_tail("short"), "short");
    }
}
