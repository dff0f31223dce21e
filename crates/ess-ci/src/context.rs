//! Build context: where a build runs and what it exports to its stages.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ess_state::BuildId;
use serde::{Deserialize, Serialize};

/// Inputs identifying one build of one change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildContext {
    /// Job name; defaults to the pipeline name.
    pub job: String,

    /// Explicit build number; assigned from the ledger when `None`.
    pub build_number: Option<u64>,

    /// Branch being built (e.g. `develop`, `PR-42`).
    pub branch_name: Option<String>,

    /// Source branch of a change request.
    pub change_branch: Option<String>,

    /// Directory stages run in.
    pub workspace: PathBuf,

    /// Shared directory dependencies are checked out into.
    pub packages_dir: PathBuf,

    /// Ledger and archived artifacts.
    pub state_dir: PathBuf,
}

impl BuildContext {
    pub fn new(job: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        let workspace = workspace.into();
        Self {
            job: job.into(),
            build_number: None,
            branch_name: None,
            change_branch: None,
            packages_dir: workspace.join(".ess").join("packages"),
            state_dir: workspace.join(".ess"),
            workspace,
        }
    }

    pub fn with_branches(
        mut self,
        branch_name: Option<String>,
        change_branch: Option<String>,
    ) -> Self {
        self.branch_name = branch_name.filter(|b| !b.trim().is_empty());
        self.change_branch = change_branch.filter(|b| !b.trim().is_empty());
        self
    }

    pub fn with_build_number(mut self, number: u64) -> Self {
        self.build_number = Some(number);
        self
    }

    pub fn with_packages_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.packages_dir = dir.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Identity of "the same change": job plus branch, change branch or
    /// default branch, whichever is known first.
    pub fn change_key(&self, default_branch: &str) -> String {
        let branch = self
            .branch_name
            .as_deref()
            .or(self.change_branch.as_deref())
            .unwrap_or(default_branch);
        format!("{}/{}", self.job, branch)
    }

    /// Environment exported to every stage.
    ///
    /// Definition-level variables come first so the build variables always
    /// win; per-stage variables are layered on later by the pipeline.
    pub fn stage_environment(
        &self,
        build_id: &BuildId,
        build_number: u64,
        git_ref: &str,
        definition_env: &BTreeMap<String, String>,
    ) -> BTreeMap<String, String> {
        let mut env = definition_env.clone();
        env.insert("BUILD_ID".to_string(), build_id.to_string());
        env.insert("BUILD_NUMBER".to_string(), build_number.to_string());
        env.insert("JOB_NAME".to_string(), self.job.clone());
        env.insert(
            "BRANCH_NAME".to_string(),
            self.branch_name.clone().unwrap_or_default(),
        );
        env.insert(
            "CHANGE_BRANCH".to_string(),
            self.change_branch.clone().unwrap_or_default(),
        );
        env.insert("GIT_REF".to_string(), git_ref.to_string());
        env.insert(
            "WORKSPACE".to_string(),
            self.workspace.to_string_lossy().into_owned(),
        );
        env.insert(
            "PACKAGES_DIR".to_string(),
            self.packages_dir.to_string_lossy().into_owned(),
        );
        env
    }
}
