//! Dependency checkout with branch fallback.
//!
//! Each dependency is cloned into the packages directory (or fetched if the
//! clone already exists), then the first candidate branch that exists in
//! the repository is checked out.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::definition::Dependency;
use crate::error::{CiError, Result};
use crate::runner::{CiRunner, StageResult};

/// A dependency checked out at a resolved branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckedOut {
    pub dependency: String,
    pub branch: String,
    pub path: PathBuf,
}

struct Git<'a> {
    stage: &'a str,
    env: BTreeMap<String, String>,
    cancel: &'a CancellationToken,
}

impl Git<'_> {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<StageResult> {
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push("git".to_string());
        argv.extend(args.iter().map(|a| a.to_string()));
        CiRunner::execute_command(self.stage, &argv, cwd, &self.env, 0, self.cancel).await
    }

    /// Run a command that must succeed for the checkout to continue.
    async fn require(&self, dependency: &str, cwd: &Path, args: &[&str]) -> Result<()> {
        let result = self.run(cwd, args).await?;
        if result.passed() {
            return Ok(());
        }
        Err(CiError::Checkout {
            dependency: dependency.to_string(),
            message: format!(
                "git {} {}: {}",
                args.join(" "),
                result.failure_reason(),
                result.stderr.trim()
            ),
        })
    }
}

/// Check out every dependency at the first existing candidate branch.
///
/// Git commands run without a timeout of their own; the caller bounds the
/// whole checkout. Dropping the returned future kills the running command.
pub async fn checkout_dependencies(
    stage: &str,
    dependencies: &[Dependency],
    packages_dir: &Path,
    candidates: &[String],
    env: &BTreeMap<String, String>,
    cancel: &CancellationToken,
) -> Result<Vec<CheckedOut>> {
    std::fs::create_dir_all(packages_dir)?;

    let mut git_env = env.clone();
    git_env.insert("GIT_TERMINAL_PROMPT".to_string(), "0".to_string());
    let git = Git {
        stage,
        env: git_env,
        cancel,
    };

    let mut checked_out = Vec::with_capacity(dependencies.len());
    for dep in dependencies {
        let path = packages_dir.join(dep.directory());
        let fresh = !path.join(".git").exists();

        if fresh {
            info!(dependency = %dep.name, url = %dep.url, "cloning dependency");
            git.require(&dep.name, packages_dir, &["clone", dep.url.as_str(), dep.directory()])
                .await?;
        } else {
            info!(dependency = %dep.name, "updating existing clone");
            git.require(&dep.name, &path, &["fetch", "--all", "--prune"])
                .await?;
        }

        let mut resolved = None;
        for candidate in candidates {
            if cancel.is_cancelled() {
                break;
            }
            let result = git.run(&path, &["checkout", candidate.as_str()]).await?;
            if result.passed() {
                resolved = Some(candidate.clone());
                break;
            }
        }
        let Some(branch) = resolved else {
            return Err(CiError::Checkout {
                dependency: dep.name.clone(),
                message: format!("none of the branches {candidates:?} exist"),
            });
        };

        if !fresh {
            let upstream = format!("origin/{branch}");
            let merged = git.run(&path, &["merge", "--ff-only", upstream.as_str()]).await?;
            if !merged.passed() {
                warn!(
                    dependency = %dep.name,
                    branch = %branch,
                    stderr = %merged.stderr.trim(),
                    "could not fast-forward existing clone"
                );
            }
        }

        info!(dependency = %dep.name, branch = %branch, "dependency checked out");
        checked_out.push(CheckedOut {
            dependency: dep.name.clone(),
            branch,
            path,
        });
    }
    Ok(checked_out)
}
