//! Integration tests for the pipeline engine with MemoryBuildLedger.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ess_ci::{
    BuildContext, BuildCoordinator, BuildOutcome, CiGate, CiPipeline, PipelineDefinition,
    ReportCollection,
};
use ess_state::fakes::MemoryBuildLedger;
use ess_state::{BuildLedger, BuildStatus};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn definition(body: &str) -> PipelineDefinition {
    let text = format!("[pipeline]\nname = \"ts_envsensors\"\ndefault_branch = \"develop\"\n{body}");
    PipelineDefinition::from_toml_str(&text).expect("definition should parse")
}

fn context(workspace: &TempDir) -> BuildContext {
    BuildContext::new("ts_envsensors", workspace.path())
        .with_state_dir(workspace.path().join(".state"))
}

async fn run(
    ledger: &Arc<MemoryBuildLedger>,
    def: &PipelineDefinition,
    ctx: &BuildContext,
) -> ess_ci::PipelineResult {
    CiPipeline::run(ledger.clone(), def, ctx, &CancellationToken::new())
        .await
        .expect("pipeline should run")
}

fn exists(workspace: &TempDir, name: &str) -> bool {
    workspace.path().join(name).exists()
}

async fn event_kinds(ledger: &MemoryBuildLedger, result: &ess_ci::PipelineResult) -> Vec<String> {
    ledger
        .get_events(&result.build_id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.kind)
        .collect()
}

/// Test: all stages pass, cleanup runs, build recorded as succeeded
#[tokio::test]
async fn test_successful_pipeline() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Build"
run = "echo building"

[[stages]]
name = "Unit tests"
command = ["echo", "testing"]

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Success);
    assert_eq!(result.passed_count(), 2);
    assert_eq!(result.failed_count(), 0);
    assert_eq!(result.build_number, 1);
    assert_eq!(result.git_ref, "develop");
    assert!(result.stages[0].stdout.contains("building"));
    assert!(exists(&workspace, "cleaned"));

    let record = ledger.get_build(&result.build_id).await.unwrap();
    assert_eq!(record.status, BuildStatus::Succeeded);
    assert_eq!(record.definition_digest, def.digest);
    assert_eq!(record.metadata.change_key, "ts_envsensors/develop");

    // build_started + 3 x (stage_started, stage_passed) + build_finished
    let summary = record.summary.unwrap();
    assert_eq!(summary.total_events, 8);

    let events = ledger.get_events(&result.build_id).await.unwrap();
    let verdict = CiGate::evaluate(&events);
    assert!(verdict.passed, "violations: {:?}", verdict.violations);
}

/// Test: a failing `fail` stage skips the rest, cleanup still runs
#[tokio::test]
async fn test_failed_stage_skips_remaining_and_cleans_up() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Build"
run = "echo broken >&2; exit 1"

[[stages]]
name = "Unit tests"
run = "touch tests-ran"

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Failure);
    assert_eq!(result.failed_stages, vec!["Build"]);
    assert_eq!(result.skipped, vec!["Unit tests"]);
    assert!(!exists(&workspace, "tests-ran"));
    assert!(exists(&workspace, "cleaned"));

    let record = ledger.get_build(&result.build_id).await.unwrap();
    assert_eq!(record.status, BuildStatus::Failed);
    assert_eq!(record.summary.unwrap().failed_stages, vec!["Build"]);

    let events = ledger.get_events(&result.build_id).await.unwrap();
    let failed = events.iter().find(|e| e.kind == "stage_failed").unwrap();
    assert_eq!(failed.payload["exit_code"], 1);
    assert!(failed.payload["stderr"].as_str().unwrap().contains("broken"));

    let verdict = CiGate::evaluate(&events);
    assert!(verdict.violations.is_empty(), "{:?}", verdict.violations);
    assert!(!verdict.passed);
}

/// Test: an `unstable` failure downgrades the build and later stages run
#[tokio::test]
async fn test_unstable_stage_continues() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Publish docs"
run = "exit 3"
on_failure = "unstable"

[[stages]]
name = "After docs"
run = "touch after"

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Unstable);
    assert_eq!(result.outcome.exit_code(), 2);
    assert_eq!(result.unstable_stages, vec!["Publish docs"]);
    assert!(exists(&workspace, "after"));
    assert!(exists(&workspace, "cleaned"));

    let record = ledger.get_build(&result.build_id).await.unwrap();
    assert_eq!(record.status, BuildStatus::Unstable);
}

/// Test: a tolerated failure leaves the build successful
#[tokio::test]
async fn test_tolerated_failure() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Setup"
run = ". ./missing-setup.sh"
on_failure = "tolerate"
fallback_message = "setup script not found, continuing"

[[stages]]
name = "Build"
run = "true"
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Success);
    assert!(!result.stages[0].passed());
    assert!(result.stages[1].passed());
    assert!(result.failed_stages.is_empty());
}

/// Test: a stage exceeding its timeout is killed and fails the build
#[tokio::test]
async fn test_stage_timeout_fails_build() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Hangs"
run = "sleep 30"
timeout_secs = 1

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Failure);
    assert!(result.stages[0].timed_out);
    assert!(result.duration_ms < 20_000);
    assert!(exists(&workspace, "cleaned"));
}

/// Test: the checkout stage as a whole is held to its timeout
#[tokio::test]
async fn test_checkout_stage_timeout() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[dependencies]]
name = "ts_ess_common"
url = "ssh://git@example.invalid/ts_ess_common.git"

[[stages]]
name = "Checkout dependencies"
uses = "checkout"
timeout_secs = 1
env = { GIT_SSH_COMMAND = "sh -c 'sleep 30' --", GIT_SSH_VARIANT = "simple" }

[[stages]]
name = "Unit tests"
run = "touch tests-ran"

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Failure);
    assert!(result.stages[0].timed_out);
    assert_eq!(result.stages[0].failure_reason(), "timed out");
    assert!(result.stages[0].duration_ms < 10_000);
    assert_eq!(result.skipped, vec!["Unit tests"]);
    assert!(exists(&workspace, "cleaned"));
}

/// Test: disabled stages are skipped without affecting the outcome
#[tokio::test]
async fn test_disabled_stage_skipped() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Build"
run = "true"

[[stages]]
name = "Integration"
run = "exit 1"
enabled = false
"#,
    );

    let result = run(&ledger, &def, &context(&workspace)).await;

    assert_eq!(result.outcome, BuildOutcome::Success);
    assert_eq!(result.skipped, vec!["Integration"]);
    assert!(event_kinds(&ledger, &result)
        .await
        .contains(&"stage_skipped".to_string()));
}

/// Test: build variables and branch fallback reach the stage environment
#[tokio::test]
async fn test_stage_environment() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[environment]
LSST_PRODUCT = "ts_envsensors"

[[stages]]
name = "Check env"
run = 'test "$GIT_REF" = "tickets/DM-1" && test "$BUILD_NUMBER" = "7" && test "$LSST_PRODUCT" = "ts_envsensors" && test "$STAGE_ONLY" = "yes"'
env = { STAGE_ONLY = "yes" }
"#,
    );
    let ctx = context(&workspace)
        .with_branches(None, Some("tickets/DM-1".to_string()))
        .with_build_number(7);

    let result = run(&ledger, &def, &ctx).await;

    assert_eq!(
        result.outcome,
        BuildOutcome::Success,
        "stderr: {}",
        result.stages[0].stderr
    );
    assert_eq!(result.git_ref, "tickets/DM-1");
    assert_eq!(result.build_number, 7);
}

/// Test: build numbers increase per job
#[tokio::test]
async fn test_build_numbers_increment() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition("[[stages]]\nname = \"Build\"\nrun = \"true\"\n");
    let ctx = context(&workspace);

    let first = run(&ledger, &def, &ctx).await;
    let second = run(&ledger, &def, &ctx).await;

    assert_eq!(first.build_number, 1);
    assert_eq!(second.build_number, 2);
}

/// Test: reports are archived with digests, missing ones only recorded
#[tokio::test]
async fn test_reports_collected_and_missing() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Unit tests"
run = "mkdir -p tests/.tests && echo '<testsuite tests=\"1\"/>' > tests/.tests/junit.xml"

[reports]
junit = "tests/.tests/junit.xml"
coverage = "tests/.tests/htmlcov"
"#,
    );
    let ctx = context(&workspace);

    let result = run(&ledger, &def, &ctx).await;

    assert_eq!(result.outcome, BuildOutcome::Success);
    assert_eq!(result.reports.len(), 2);
    assert!(matches!(result.reports[0], ReportCollection::Collected(_)));
    assert!(matches!(result.reports[1], ReportCollection::Missing { .. }));

    let archived = ctx
        .state_dir
        .join("builds")
        .join(&result.build_id.0)
        .join("artifacts")
        .join("junit")
        .join("junit.xml");
    assert!(archived.exists());

    let kinds = event_kinds(&ledger, &result).await;
    assert!(kinds.contains(&"report_collected".to_string()));
    assert!(kinds.contains(&"report_missing".to_string()));
}

async fn wait_for(path: &Path) {
    for _ in 0..200 {
        if path.exists() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("{} never appeared", path.display());
}

/// Test: a newer build of the same change aborts the running one, whose
/// cleanup still runs
#[tokio::test]
async fn test_new_build_aborts_previous_and_cleans_up() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Long tests"
run = "touch started; sleep 30"

[[stages]]
name = "Publish docs"
run = "touch published"

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );
    let ctx = context(&workspace).with_branches(Some("PR-42".to_string()), None);
    let coordinator = BuildCoordinator::new();

    let handle = {
        let coordinator = coordinator.clone();
        let ledger = ledger.clone();
        let def = def.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            CiPipeline::run_coordinated(&coordinator, ledger, &def, &ctx).await
        })
    };

    wait_for(&workspace.path().join("started")).await;
    let _newer = coordinator.begin(&ctx.change_key(&def.default_branch), def.abort_previous);

    let result = tokio::time::timeout(Duration::from_secs(20), handle)
        .await
        .expect("aborted build should finish promptly")
        .unwrap()
        .unwrap();

    assert_eq!(result.outcome, BuildOutcome::Aborted);
    assert_eq!(result.outcome.exit_code(), 3);
    assert!(result.stages[0].cancelled);
    assert_eq!(result.skipped, vec!["Publish docs"]);
    assert!(!exists(&workspace, "published"));
    assert!(exists(&workspace, "cleaned"));

    let record = ledger.get_build(&result.build_id).await.unwrap();
    assert_eq!(record.status, BuildStatus::Aborted);

    let events = ledger.get_events(&result.build_id).await.unwrap();
    assert!(events.iter().any(|e| e.kind == "build_aborted"));
    let verdict = CiGate::evaluate(&events);
    assert_eq!(verdict.outcome, BuildOutcome::Aborted);
    assert!(verdict.violations.is_empty(), "{:?}", verdict.violations);
}

/// Test: a token cancelled before the build starts aborts every main stage
#[tokio::test]
async fn test_cancelled_before_start() {
    let ledger = Arc::new(MemoryBuildLedger::new());
    let workspace = tempfile::tempdir().unwrap();
    let def = definition(
        r#"
[[stages]]
name = "Build"
run = "touch built"

[[cleanup]]
name = "Cleanup"
run = "touch cleaned"
"#,
    );
    let token = CancellationToken::new();
    token.cancel();

    let result = CiPipeline::run(ledger.clone(), &def, &context(&workspace), &token)
        .await
        .unwrap();

    assert_eq!(result.outcome, BuildOutcome::Aborted);
    assert!(result.stages.is_empty());
    assert!(!exists(&workspace, "built"));
    assert!(exists(&workspace, "cleaned"));
}
