//! Build outcomes and how they combine.

use std::fmt;

use ess_state::BuildStatus;
use serde::{Deserialize, Serialize};

use crate::stage::FailurePolicy;

/// Final verdict of a build.
///
/// Variants are ordered by severity so that combining two outcomes keeps
/// the worse one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildOutcome {
    #[default]
    Success,
    Unstable,
    Failure,
    Aborted,
}

impl BuildOutcome {
    /// Worst of two outcomes.
    pub fn combine(self, other: BuildOutcome) -> BuildOutcome {
        self.max(other)
    }

    /// Outcome contributed by a failed stage with the given policy.
    pub fn from_failure(policy: FailurePolicy) -> BuildOutcome {
        match policy {
            FailurePolicy::Fail => BuildOutcome::Failure,
            FailurePolicy::Unstable => BuildOutcome::Unstable,
            FailurePolicy::Tolerate => BuildOutcome::Success,
        }
    }

    /// Whether the remaining main stages still run.
    pub fn continues(self) -> bool {
        matches!(self, BuildOutcome::Success | BuildOutcome::Unstable)
    }

    /// Ledger status recorded for this outcome.
    pub fn status(self) -> BuildStatus {
        match self {
            BuildOutcome::Success => BuildStatus::Succeeded,
            BuildOutcome::Unstable => BuildStatus::Unstable,
            BuildOutcome::Failure => BuildStatus::Failed,
            BuildOutcome::Aborted => BuildStatus::Aborted,
        }
    }

    /// Inverse of [`BuildOutcome::status`]; `None` for running builds.
    pub fn from_status(status: BuildStatus) -> Option<BuildOutcome> {
        match status {
            BuildStatus::Running => None,
            BuildStatus::Succeeded => Some(BuildOutcome::Success),
            BuildStatus::Unstable => Some(BuildOutcome::Unstable),
            BuildStatus::Failed => Some(BuildOutcome::Failure),
            BuildStatus::Aborted => Some(BuildOutcome::Aborted),
        }
    }

    /// Process exit code reported by the `ess` CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            BuildOutcome::Success => 0,
            BuildOutcome::Failure => 1,
            BuildOutcome::Unstable => 2,
            BuildOutcome::Aborted => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BuildOutcome::Success => "success",
            BuildOutcome::Unstable => "unstable",
            BuildOutcome::Failure => "failure",
            BuildOutcome::Aborted => "aborted",
        }
    }

    pub fn parse(s: &str) -> Option<BuildOutcome> {
        match s {
            "success" => Some(BuildOutcome::Success),
            "unstable" => Some(BuildOutcome::Unstable),
            "failure" => Some(BuildOutcome::Failure),
            "aborted" => Some(BuildOutcome::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for BuildOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str().to_uppercase())
    }
}
