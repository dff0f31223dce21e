//! Pipeline definitions.
//!
//! A pipeline is declared in TOML:
//!
//! ```toml
//! [pipeline]
//! name = "ts_envsensors"
//! default_branch = "develop"
//!
//! [[dependencies]]
//! name = "ts_ess_common"
//! url = "https://github.com/lsst-ts/ts_ess_common.git"
//!
//! [[stages]]
//! name = "Checkout"
//! uses = "checkout"
//!
//! [[stages]]
//! name = "Unit tests"
//! run = "pytest --junitxml=tests/.tests/junit.xml"
//!
//! [[cleanup]]
//! name = "Cleanup"
//! command = ["chmod", "-R", "a+rw", "."]
//!
//! [reports]
//! junit = "tests/.tests/junit.xml"
//! ```
//!
//! Each stage declares exactly one of `run` (shell script), `command`
//! (argv) or `uses = "checkout"`.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ess_state::ContentDigest;
use serde::Deserialize;

use crate::error::{CiError, Result};
use crate::reports::ReportsConfig;
use crate::retention::RetentionPolicy;
use crate::stage::{FailurePolicy, StageAction, StageConfig, DEFAULT_TIMEOUT_SECS};

const CHECKOUT_ACTION: &str = "checkout";

fn default_branch() -> String {
    "develop".to_string()
}

fn default_true() -> bool {
    true
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawDefinition {
    pipeline: RawPipeline,
    #[serde(default)]
    retention: RetentionPolicy,
    #[serde(default)]
    environment: BTreeMap<String, String>,
    #[serde(default)]
    dependencies: Vec<Dependency>,
    #[serde(default)]
    stages: Vec<RawStage>,
    #[serde(default)]
    cleanup: Vec<RawStage>,
    #[serde(default)]
    reports: ReportsConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPipeline {
    name: String,
    #[serde(default = "default_branch")]
    default_branch: String,
    #[serde(default = "default_true")]
    abort_previous: bool,
    #[serde(default = "default_timeout")]
    timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawStage {
    name: String,
    run: Option<String>,
    command: Option<Vec<String>>,
    uses: Option<String>,
    timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    on_failure: FailurePolicy,
    fallback_message: Option<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
}

impl RawStage {
    fn into_stage(self, default_timeout: u64) -> Result<StageConfig> {
        let action = match (self.run, self.command, self.uses) {
            (Some(script), None, None) => {
                if script.trim().is_empty() {
                    return Err(CiError::EmptyCommand { stage: self.name });
                }
                StageAction::Shell { script }
            }
            (None, Some(argv), None) => {
                if argv.first().map(|a| a.trim().is_empty()).unwrap_or(true) {
                    return Err(CiError::EmptyCommand { stage: self.name });
                }
                StageAction::Exec { argv }
            }
            (None, None, Some(uses)) if uses == CHECKOUT_ACTION => StageAction::Checkout,
            (None, None, Some(uses)) => {
                return Err(CiError::InvalidDefinition(format!(
                    "stage '{}': unknown action '{}' (expected '{}')",
                    self.name, uses, CHECKOUT_ACTION
                )))
            }
            _ => {
                return Err(CiError::InvalidDefinition(format!(
                    "stage '{}' must declare exactly one of 'run', 'command' or 'uses'",
                    self.name
                )))
            }
        };

        Ok(StageConfig {
            name: self.name,
            action,
            timeout_secs: self.timeout_secs.unwrap_or(default_timeout),
            enabled: self.enabled,
            on_failure: self.on_failure,
            fallback_message: self.fallback_message,
            env: self.env,
            working_dir: self.working_dir,
        })
    }
}

/// A sibling package checked out before the build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Dependency {
    pub name: String,
    /// Clone URL (any form `git clone` accepts, including local paths).
    pub url: String,
    /// Directory under the packages dir; defaults to `name`.
    pub directory: Option<String>,
}

impl Dependency {
    pub fn directory(&self) -> &str {
        self.directory.as_deref().unwrap_or(&self.name)
    }
}

/// A validated pipeline definition.
#[derive(Debug, Clone)]
pub struct PipelineDefinition {
    pub name: String,
    pub default_branch: String,
    /// Abort an in-flight build of the same change when a new one starts.
    pub abort_previous: bool,
    pub default_timeout_secs: u64,
    pub retention: RetentionPolicy,
    /// Exported to every stage.
    pub environment: BTreeMap<String, String>,
    pub dependencies: Vec<Dependency>,
    pub stages: Vec<StageConfig>,
    /// Always run after the main stages, whatever their outcome.
    pub cleanup: Vec<StageConfig>,
    pub reports: ReportsConfig,
    /// Digest of the definition source text.
    pub digest: ContentDigest,
}

impl PipelineDefinition {
    /// Parse and validate a definition from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawDefinition = toml::from_str(text)?;
        let digest = ContentDigest::from_bytes(text.as_bytes());

        let pipeline = raw.pipeline;
        if pipeline.name.trim().is_empty() {
            return Err(CiError::InvalidDefinition(
                "pipeline name must not be empty".to_string(),
            ));
        }
        if pipeline.default_branch.trim().is_empty() {
            return Err(CiError::InvalidDefinition(
                "default_branch must not be empty".to_string(),
            ));
        }
        if raw.retention.max_builds == Some(0) {
            return Err(CiError::InvalidDefinition(
                "retention.max_builds must be at least 1".to_string(),
            ));
        }

        let mut dependency_names = HashSet::new();
        for dep in &raw.dependencies {
            if dep.name.trim().is_empty() || dep.url.trim().is_empty() {
                return Err(CiError::InvalidDefinition(
                    "dependencies need a name and a url".to_string(),
                ));
            }
            if !dependency_names.insert(dep.directory().to_string()) {
                return Err(CiError::InvalidDefinition(format!(
                    "duplicate dependency directory '{}'",
                    dep.directory()
                )));
            }
        }

        let stages = raw
            .stages
            .into_iter()
            .map(|s| s.into_stage(pipeline.timeout_secs))
            .collect::<Result<Vec<_>>>()?;
        let cleanup = raw
            .cleanup
            .into_iter()
            .map(|s| s.into_stage(pipeline.timeout_secs))
            .collect::<Result<Vec<_>>>()?;

        if stages.is_empty() {
            return Err(CiError::InvalidDefinition(
                "pipeline declares no stages".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for stage in stages.iter().chain(cleanup.iter()) {
            if stage.name.trim().is_empty() {
                return Err(CiError::InvalidDefinition(
                    "stage names must not be empty".to_string(),
                ));
            }
            if !names.insert(stage.name.as_str()) {
                return Err(CiError::InvalidDefinition(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            if stage.action == StageAction::Checkout && raw.dependencies.is_empty() {
                return Err(CiError::InvalidDefinition(format!(
                    "stage '{}' checks out dependencies but none are declared",
                    stage.name
                )));
            }
        }

        Ok(Self {
            name: pipeline.name,
            default_branch: pipeline.default_branch,
            abort_previous: pipeline.abort_previous,
            default_timeout_secs: pipeline.timeout_secs,
            retention: raw.retention,
            environment: raw.environment,
            dependencies: raw.dependencies,
            stages,
            cleanup,
            reports: raw.reports,
            digest,
        })
    }

    /// Read, parse and validate a definition file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|source| CiError::ReadDefinition {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Names of the main stages, in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Longest a build can run: the sum of every enabled stage's timeout.
    /// `None` when some stage has no timeout.
    pub fn max_build_duration(&self) -> Option<Duration> {
        self.stages
            .iter()
            .chain(self.cleanup.iter())
            .filter(|s| s.enabled)
            .map(|s| (s.timeout_secs > 0).then_some(s.timeout_secs))
            .sum::<Option<u64>>()
            .map(Duration::from_secs)
    }
}
