//! ESS - command-line interface for the ESS CI pipeline engine
//!
//! The `ess` command runs and inspects pipeline builds and checks
//! controller configurations.
//!
//! ## Commands
//!
//! - `ci run`: Run a pipeline definition and record the build
//! - `ci validate`: Check a pipeline definition
//! - `ci history`: List recorded builds of a job
//! - `ci show`: Show a build's events and re-check its outcome
//! - `ci prune`: Apply the retention policy
//! - `sensors check-config`: Validate a controller device configuration

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};

use ess_ci::obs::BuildSpan;
use ess_ci::{
    abandon_stale_builds, prune_builds, BuildContext, BuildEventKind, BuildOutcome, ChangeLease,
    CiGate, CiPipeline, PipelineDefinition, PipelineResult, ReportCollection, StageAction,
};
use ess_controller::Configuration;
use ess_state::{BuildId, BuildLedger, SurrealBuildLedger};

/// Default pipeline definition file.
const DEFAULT_DEFINITION: &str = "Pipeline.toml";

#[derive(Parser)]
#[command(name = "ess")]
#[command(author = "ESS Developers")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Environmental Sensor Suite CI and controller tools", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// CI pipeline operations
    Ci {
        #[command(subcommand)]
        action: CiAction,
    },

    /// Controller configuration tools
    Sensors {
        #[command(subcommand)]
        action: SensorsAction,
    },
}

#[derive(Subcommand)]
enum CiAction {
    /// Run a pipeline and record the build
    Run {
        /// Pipeline definition file
        #[arg(short, long, default_value = DEFAULT_DEFINITION)]
        file: PathBuf,

        /// Workspace path (default: current directory)
        #[arg(short, long, default_value = ".")]
        workspace: PathBuf,

        /// Job name (default: the pipeline name)
        #[arg(long, env = "JOB_NAME")]
        job: Option<String>,

        /// Branch being built
        #[arg(long, env = "BRANCH_NAME")]
        branch: Option<String>,

        /// Source branch of the change request
        #[arg(long, env = "CHANGE_BRANCH")]
        change_branch: Option<String>,

        /// Build number (default: next number recorded for the job)
        #[arg(long, env = "BUILD_NUMBER")]
        build_number: Option<u64>,

        /// State directory for the ledger and archived reports
        /// (default: <workspace>/.ess)
        #[arg(long, env = "ESS_STATE_DIR")]
        state_dir: Option<PathBuf>,

        /// Directory dependencies are checked out into
        /// (default: <workspace>/.ess/packages)
        #[arg(long)]
        packages_dir: Option<PathBuf>,
    },

    /// Validate a pipeline definition
    Validate {
        /// Pipeline definition file
        #[arg(short, long, default_value = DEFAULT_DEFINITION)]
        file: PathBuf,
    },

    /// List recorded builds, newest first
    History {
        /// Only show builds of this job
        #[arg(long)]
        job: Option<String>,

        /// Maximum number of builds to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// State directory holding the ledger
        #[arg(long, env = "ESS_STATE_DIR", default_value = ".ess")]
        state_dir: PathBuf,
    },

    /// Show a build's events and re-evaluate its outcome
    Show {
        /// Build ID
        build_id: String,

        /// State directory holding the ledger
        #[arg(long, env = "ESS_STATE_DIR", default_value = ".ess")]
        state_dir: PathBuf,
    },

    /// Remove builds outside the definition's retention policy
    Prune {
        /// Pipeline definition file
        #[arg(short, long, default_value = DEFAULT_DEFINITION)]
        file: PathBuf,

        /// Job name (default: the pipeline name)
        #[arg(long, env = "JOB_NAME")]
        job: Option<String>,

        /// State directory holding the ledger
        #[arg(long, env = "ESS_STATE_DIR", default_value = ".ess")]
        state_dir: PathBuf,
    },
}

#[derive(Subcommand)]
enum SensorsAction {
    /// Validate a device configuration JSON file
    CheckConfig {
        /// Configuration file (`{"devices": [...]}`)
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    ess_controller::init_tracing(cli.json, level);

    let code = dispatch(cli.command).await?;
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

/// Run a command and return the process exit code.
async fn dispatch(command: Commands) -> Result<i32> {
    match command {
        Commands::Ci { action } => match action {
            CiAction::Run {
                file,
                workspace,
                job,
                branch,
                change_branch,
                build_number,
                state_dir,
                packages_dir,
            } => {
                let definition = load_definition(&file)?;
                let state_dir = state_dir.unwrap_or_else(|| workspace.join(".ess"));
                let job = job.unwrap_or_else(|| definition.name.clone());
                let mut context = BuildContext::new(job, &workspace)
                    .with_branches(branch, change_branch)
                    .with_state_dir(&state_dir);
                if let Some(number) = build_number {
                    context = context.with_build_number(number);
                }
                if let Some(dir) = packages_dir {
                    context = context.with_packages_dir(dir);
                }
                let ledger = open_ledger(&state_dir).await?;
                cmd_ci_run(ledger, &definition, &context).await
            }
            CiAction::Validate { file } => cmd_ci_validate(&file),
            CiAction::History {
                job,
                limit,
                state_dir,
            } => {
                let ledger = open_ledger(&state_dir).await?;
                cmd_ci_history(ledger.as_ref(), job.as_deref(), limit).await
            }
            CiAction::Show {
                build_id,
                state_dir,
            } => {
                let ledger = open_ledger(&state_dir).await?;
                cmd_ci_show(ledger.as_ref(), &build_id).await
            }
            CiAction::Prune {
                file,
                job,
                state_dir,
            } => {
                let definition = load_definition(&file)?;
                let job = job.unwrap_or_else(|| definition.name.clone());
                let ledger = open_ledger(&state_dir).await?;
                cmd_ci_prune(ledger, &definition, &job, &state_dir).await
            }
        },
        Commands::Sensors { action } => match action {
            SensorsAction::CheckConfig { file } => cmd_check_config(&file),
        },
    }
}

fn load_definition(path: &Path) -> Result<PipelineDefinition> {
    PipelineDefinition::load(path)
        .with_context(|| format!("Failed to load pipeline definition {}", path.display()))
}

async fn open_ledger(state_dir: &Path) -> Result<Arc<dyn BuildLedger>> {
    let ledger = SurrealBuildLedger::open(state_dir)
        .await
        .context("Failed to open the build ledger")?;
    Ok(Arc::new(ledger))
}

/// Run a pipeline and record the build
async fn cmd_ci_run(
    ledger: Arc<dyn BuildLedger>,
    definition: &PipelineDefinition,
    context: &BuildContext,
) -> Result<i32> {
    println!("Running pipeline '{}' for job {}", definition.name, context.job);
    println!("Workspace: {}", context.workspace.display());
    println!("Stages: {}", definition.stage_names().join(", "));
    println!();

    let lease = ChangeLease::acquire(
        &context.state_dir,
        &context.change_key(&definition.default_branch),
        definition.abort_previous,
    )
    .await
    .context("Failed to register the build of this change")?;

    let abort = lease.token().clone();
    let signal_watch = tokio::spawn(async move {
        let signal = termination_signal().await;
        warn!(signal, "termination requested, aborting build");
        abort.cancel();
    });

    let result = CiPipeline::run(ledger.clone(), definition, context, lease.token()).await;
    signal_watch.abort();
    drop(lease);
    let result = result.context("CI pipeline failed to run")?;

    print_result(&result);

    close_abandoned_builds(ledger.clone(), definition, &context.job).await;
    let pruned = prune_builds(
        ledger.as_ref(),
        &context.job,
        &definition.retention,
        Some(&context.state_dir),
        Utc::now(),
    )
    .await;
    match pruned {
        Ok(pruned) if !pruned.removed.is_empty() => {
            info!(removed = pruned.removed.len(), kept = pruned.kept, "old builds pruned");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "retention pass failed"),
    }

    let events = ledger.get_events(&result.build_id).await?;
    let verdict = CiGate::evaluate(&events);
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }

    Ok(result.outcome.exit_code())
}

/// Resolve on Ctrl-C or, on Unix, SIGTERM. Never resolves when neither can
/// be listened for.
async fn termination_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    Ok(()) = tokio::signal::ctrl_c() => return "SIGINT",
                    Some(()) = terminate.recv() => return "SIGTERM",
                    else => {}
                }
            }
            Err(e) => warn!(error = %e, "cannot listen for SIGTERM"),
        }
    }
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(_) => std::future::pending().await,
    }
}

/// Finish builds of `job` whose runner died, so retention can count them.
async fn close_abandoned_builds(
    ledger: Arc<dyn BuildLedger>,
    definition: &PipelineDefinition,
    job: &str,
) {
    let Some(max_duration) = definition.max_build_duration() else {
        return;
    };
    match abandon_stale_builds(ledger, job, max_duration, Utc::now()).await {
        Ok(closed) if !closed.is_empty() => {
            info!(closed = closed.len(), "abandoned builds closed as aborted");
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "failed to close abandoned builds"),
    }
}

fn print_result(result: &PipelineResult) {
    println!("Build ID: {}", result.build_id);
    println!("Build number: {}", result.build_number);
    println!("Git ref: {}", result.git_ref);
    println!("Status: {}", outcome_label(result.outcome));
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for stage in result.stages.iter().chain(&result.cleanup) {
        let status = if stage.passed() { "✓" } else { "✗" };
        let detail = if stage.passed() {
            format!("{}ms", stage.duration_ms)
        } else {
            format!("{}ms, {}", stage.duration_ms, stage.failure_reason())
        };
        println!("  {} {} ({})", status, stage.stage_name, detail);
    }
    for name in &result.skipped {
        println!("  - {} (skipped)", name);
    }

    for report in &result.reports {
        match report {
            ReportCollection::Collected(archived) => println!(
                "  ✓ {} report archived ({} file(s), {})",
                archived.kind,
                archived.files,
                archived.digest.short()
            ),
            ReportCollection::Missing { kind, path } => {
                println!("  ✗ {} report missing at {}", kind, path.display())
            }
        }
    }

    println!();
    println!(
        "Summary: {}/{} stages passed",
        result.passed_count(),
        result.stages.len()
    );
}

fn outcome_label(outcome: BuildOutcome) -> String {
    match outcome {
        BuildOutcome::Success => "✓ SUCCESS".to_string(),
        other => format!("✗ {}", other),
    }
}

/// Validate a pipeline definition
fn cmd_ci_validate(path: &Path) -> Result<i32> {
    let definition = match PipelineDefinition::load(path) {
        Ok(definition) => definition,
        Err(e) => {
            println!("✗ {}: {}", path.display(), e);
            return Ok(1);
        }
    };

    println!("✓ {} is valid", path.display());
    println!("  Pipeline: {}", definition.name);
    println!("  Default branch: {}", definition.default_branch);
    println!("  Digest: {}", definition.digest.short());
    for stage in definition.stages.iter().chain(&definition.cleanup) {
        let action = match &stage.action {
            StageAction::Checkout => format!(
                "checkout {} dependencies",
                definition.dependencies.len()
            ),
            other => other.describe(),
        };
        let enabled = if stage.enabled { "" } else { " [disabled]" };
        println!(
            "  - {} ({:?}, {}s): {}{}",
            stage.name, stage.on_failure, stage.timeout_secs, action, enabled
        );
    }
    Ok(0)
}

/// List recorded builds, newest first
async fn cmd_ci_history(ledger: &dyn BuildLedger, job: Option<&str>, limit: usize) -> Result<i32> {
    let builds = ledger.list_builds(job).await?;
    if builds.is_empty() {
        println!("No builds recorded.");
        return Ok(0);
    }

    for build in builds.iter().take(limit) {
        println!(
            "#{:<5} {:<9} {:<24} {}  {}",
            build.metadata.build_number,
            build.status,
            build.metadata.git_ref.as_deref().unwrap_or("-"),
            build.created_at.format("%Y-%m-%d %H:%M:%S"),
            build.build_id
        );
    }
    if builds.len() > limit {
        println!("... {} older build(s)", builds.len() - limit);
    }
    Ok(0)
}

/// Show a build's events and re-evaluate its outcome
async fn cmd_ci_show(ledger: &dyn BuildLedger, build_id: &str) -> Result<i32> {
    let build_id = BuildId(build_id.to_string());
    let build = ledger
        .get_build(&build_id)
        .await
        .with_context(|| format!("Build {} not found", build_id))?;
    let events = ledger.get_events(&build_id).await?;

    let _span = BuildSpan::enter(&build_id.0, &build.metadata.job);
    println!("Build {} ({} #{})", build.build_id, build.metadata.job, build.metadata.build_number);
    println!("Status: {}", build.status);
    println!("Change: {}", build.metadata.change_key);
    if let Some(git_ref) = &build.metadata.git_ref {
        println!("Git ref: {}", git_ref);
    }
    println!("Definition: {}", build.definition_digest.short());
    if let Some(summary) = &build.summary {
        println!("Duration: {}ms", summary.duration_ms);
    }
    println!();

    for event in &events {
        let subject = BuildEventKind::from_payload(&event.payload)
            .and_then(|kind| kind.stage().map(str::to_string))
            .unwrap_or_default();
        println!(
            "  {:>3} {} {:<16} {}",
            event.seq,
            event.timestamp.format("%H:%M:%S"),
            event.kind,
            subject
        );
    }

    let verdict = CiGate::evaluate(&events);
    println!();
    println!("Gate: {}", if verdict.passed { "✓ PASSED" } else { "✗ FAILED" });
    println!("  {}", verdict.message);
    for violation in &verdict.violations {
        println!("  - {}", violation);
    }
    Ok(0)
}

/// Remove builds outside the definition's retention policy
async fn cmd_ci_prune(
    ledger: Arc<dyn BuildLedger>,
    definition: &PipelineDefinition,
    job: &str,
    state_dir: &Path,
) -> Result<i32> {
    close_abandoned_builds(ledger.clone(), definition, job).await;
    let result = prune_builds(
        ledger.as_ref(),
        job,
        &definition.retention,
        Some(state_dir),
        Utc::now(),
    )
        .await
        .context("Retention pass failed")?;
    println!("✓ Pruned {} build(s), kept {}", result.removed.len(), result.kept);
    for build_id in &result.removed {
        println!("  - {}", build_id);
    }
    Ok(0)
}

/// Validate a controller device configuration
fn cmd_check_config(path: &Path) -> Result<i32> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let value: Value = serde_json::from_str(&text)
        .with_context(|| format!("{} is not valid JSON", path.display()))?;

    match Configuration::from_value(&value) {
        Ok(configuration) => {
            println!("✓ {} is valid", path.display());
            for device in &configuration.devices {
                println!(
                    "  - {} ({}, {} channels, {:?})",
                    device.name, device.device_type, device.channels, device.sensor_type
                );
            }
            Ok(0)
        }
        Err(e) => {
            println!("✗ {}: {} (code {})", path.display(), e, e.response_code.code());
            Ok(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ess_state::fakes::MemoryBuildLedger;
    use ess_state::BuildStatus;
    use std::time::Duration;

    const PIPELINE: &str = r#"
[pipeline]
name = "ts_envsensors"

[retention]
max_builds = 2

[[stages]]
name = "Build"
run = "true"

[[cleanup]]
name = "Cleanup"
run = "true"
"#;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "ess",
            "ci",
            "run",
            "--file",
            "ci/Pipeline.toml",
            "--branch",
            "tickets/DM-1",
            "--build-number",
            "12",
        ])
        .unwrap();
        match cli.command {
            Commands::Ci {
                action:
                    CiAction::Run {
                        file,
                        branch,
                        build_number,
                        ..
                    },
            } => {
                assert_eq!(file, PathBuf::from("ci/Pipeline.toml"));
                assert_eq!(branch.as_deref(), Some("tickets/DM-1"));
                assert_eq!(build_number, Some(12));
            }
            _ => panic!("expected ci run"),
        }
    }

    #[test]
    fn test_validate_reports_bad_definition() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(dir.path(), "good.toml", PIPELINE);
        let bad = write(dir.path(), "bad.toml", "[pipeline]\nname = \"x\"\n");
        assert_eq!(cmd_ci_validate(&good).unwrap(), 0);
        assert_eq!(cmd_ci_validate(&bad).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_run_show_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let ledger: Arc<dyn BuildLedger> = Arc::new(MemoryBuildLedger::new());
        let definition = PipelineDefinition::from_toml_str(PIPELINE).unwrap();
        let context = BuildContext::new("ts_envsensors", dir.path());

        for _ in 0..3 {
            let code = cmd_ci_run(ledger.clone(), &definition, &context).await.unwrap();
            assert_eq!(code, 0);
        }

        // cmd_ci_run prunes after every build
        let builds = ledger.list_builds(Some("ts_envsensors")).await.unwrap();
        assert_eq!(builds.len(), 2);
        assert!(builds.iter().all(|b| b.status == BuildStatus::Succeeded));

        let newest = builds[0].build_id.0.clone();
        assert_eq!(cmd_ci_show(ledger.as_ref(), &newest).await.unwrap(), 0);
        assert!(cmd_ci_show(ledger.as_ref(), "missing").await.is_err());
        assert_eq!(
            cmd_ci_history(ledger.as_ref(), Some("ts_envsensors"), 1)
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_run_exit_code_follows_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let ledger: Arc<dyn BuildLedger> = Arc::new(MemoryBuildLedger::new());
        let definition = PipelineDefinition::from_toml_str(
            r#"
[pipeline]
name = "ts_envsensors"

[[stages]]
name = "Publish docs"
run = "exit 1"
on_failure = "unstable"
"#,
        )
        .unwrap();
        let context = BuildContext::new("ts_envsensors", dir.path());
        let code = cmd_ci_run(ledger, &definition, &context).await.unwrap();
        assert_eq!(code, BuildOutcome::Unstable.exit_code());
    }

    #[tokio::test]
    async fn test_newer_run_aborts_running_build_of_same_change() {
        let dir = tempfile::tempdir().unwrap();
        let ledger: Arc<dyn BuildLedger> = Arc::new(MemoryBuildLedger::new());
        let definition = PipelineDefinition::from_toml_str(
            r#"
[pipeline]
name = "ts_envsensors"
abort_previous = true

[[stages]]
name = "Long tests"
run = "sleep 3"

[[cleanup]]
name = "Cleanup"
run = "true"
"#,
        )
        .unwrap();
        let context = BuildContext::new("ts_envsensors", dir.path())
            .with_branches(Some("PR-1".to_string()), None);

        let first = cmd_ci_run(ledger.clone(), &definition, &context);
        let second = async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            cmd_ci_run(ledger.clone(), &definition, &context).await
        };
        let (first, second) = tokio::join!(first, second);

        assert_eq!(first.unwrap(), BuildOutcome::Aborted.exit_code());
        assert_eq!(second.unwrap(), 0);

        let builds = ledger.list_builds(Some("ts_envsensors")).await.unwrap();
        let statuses: Vec<_> = builds.iter().map(|b| b.status).collect();
        assert_eq!(statuses, vec![BuildStatus::Succeeded, BuildStatus::Aborted]);

        // Both leases released.
        let leases = std::fs::read_dir(context.state_dir.join("changes"))
            .unwrap()
            .count();
        assert_eq!(leases, 0);
    }

    #[tokio::test]
    async fn test_prune_closes_abandoned_build() {
        let dir = tempfile::tempdir().unwrap();
        let memory = Arc::new(MemoryBuildLedger::new());
        let ledger: Arc<dyn BuildLedger> = memory.clone();
        let definition = PipelineDefinition::from_toml_str(PIPELINE).unwrap();

        let stale = ledger
            .create_build(
                &definition.digest,
                ess_state::BuildMetadata {
                    job: "ts_envsensors".to_string(),
                    build_number: 1,
                    change_key: "ts_envsensors/develop".to_string(),
                    git_ref: None,
                    tags: Value::Null,
                },
            )
            .await
            .unwrap();
        memory
            .set_created_at(&stale, Utc::now() - chrono::Duration::days(1))
            .unwrap();

        let code = cmd_ci_prune(ledger.clone(), &definition, "ts_envsensors", dir.path())
            .await
            .unwrap();
        assert_eq!(code, 0);
        let record = ledger.get_build(&stale).await.unwrap();
        assert_eq!(record.status, BuildStatus::Aborted);
    }

    #[test]
    fn test_check_config() {
        let dir = tempfile::tempdir().unwrap();
        let good = write(
            dir.path(),
            "good.json",
            r#"{"devices": [{"name": "Test1", "channels": 4, "type": "FTDI", "ftdi_id": "ABC"}]}"#,
        );
        let bad = write(dir.path(), "bad.json", r#"{"devices": []}"#);
        let broken = write(dir.path(), "broken.json", "{");

        assert_eq!(cmd_check_config(&good).unwrap(), 0);
        assert_eq!(cmd_check_config(&bad).unwrap(), 1);
        assert!(cmd_check_config(&broken).is_err());
    }
}
