//! CI stage definitions and configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default stage timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// What a failed stage does to the build.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Fail the build and skip the remaining main stages.
    #[default]
    Fail,

    /// Mark the build unstable and keep going.
    Unstable,

    /// Log the fallback message and keep going.
    Tolerate,
}

/// The work a stage performs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageAction {
    /// `sh -c <script>`
    Shell { script: String },

    /// Direct exec; first element is the executable.
    Exec { argv: Vec<String> },

    /// Clone/update the pipeline's dependencies with branch fallback.
    Checkout,
}

impl StageAction {
    /// The argv this action runs, if it is a process action.
    pub fn argv(&self) -> Option<Vec<String>> {
        match self {
            StageAction::Shell { script } => {
                Some(vec!["sh".to_string(), "-c".to_string(), script.clone()])
            }
            StageAction::Exec { argv } => Some(argv.clone()),
            StageAction::Checkout => None,
        }
    }

    /// Short human-readable description for logs and events.
    pub fn describe(&self) -> String {
        match self {
            StageAction::Shell { script } => script.lines().next().unwrap_or_default().to_string(),
            StageAction::Exec { argv } => argv.join(" "),
            StageAction::Checkout => "checkout dependencies".to_string(),
        }
    }
}

/// Configuration for a CI stage.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageConfig {
    /// Human-readable stage name.
    pub name: String,

    pub action: StageAction,

    /// Timeout in seconds (0 disables the timeout).
    pub timeout_secs: u64,

    /// Whether this stage is enabled.
    pub enabled: bool,

    pub on_failure: FailurePolicy,

    /// Logged when a tolerated failure is swallowed.
    pub fallback_message: Option<String>,

    /// Extra environment for this stage only.
    pub env: BTreeMap<String, String>,

    /// Working directory relative to the workspace.
    pub working_dir: Option<PathBuf>,
}

impl StageConfig {
    fn new(name: String, action: StageAction, timeout_secs: u64) -> Self {
        Self {
            name,
            action,
            timeout_secs,
            enabled: true,
            on_failure: FailurePolicy::Fail,
            fallback_message: None,
            env: BTreeMap::new(),
            working_dir: None,
        }
    }

    /// A stage running a shell script.
    pub fn shell(name: impl Into<String>, script: impl Into<String>, timeout_secs: u64) -> Self {
        Self::new(
            name.into(),
            StageAction::Shell {
                script: script.into(),
            },
            timeout_secs,
        )
    }

    /// A stage executing an argv directly.
    pub fn exec(name: impl Into<String>, argv: Vec<String>, timeout_secs: u64) -> Self {
        Self::new(name.into(), StageAction::Exec { argv }, timeout_secs)
    }

    /// The dependency checkout stage.
    pub fn checkout(name: impl Into<String>, timeout_secs: u64) -> Self {
        Self::new(name.into(), StageAction::Checkout, timeout_secs)
    }

    /// Disable this stage.
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_fallback_message(mut self, message: impl Into<String>) -> Self {
        self.fallback_message = Some(message.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn in_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_stage_argv() {
        let config = StageConfig::shell("setup", "source ~/.setup.sh", 60);
        let argv = config.action.argv().unwrap();
        assert_eq!(argv, vec!["sh", "-c", "source ~/.setup.sh"]);
        assert!(config.enabled);
        assert_eq!(config.on_failure, FailurePolicy::Fail);
    }

    #[test]
    fn test_exec_stage_argv() {
        let config = StageConfig::exec(
            "echo_test",
            vec!["echo".to_string(), "hello".to_string()],
            60,
        );
        assert_eq!(config.action.argv().unwrap()[0], "echo");
        assert_eq!(config.action.describe(), "echo hello");
        assert_eq!(config.timeout_secs, 60);
    }

    #[test]
    fn test_checkout_has_no_argv() {
        let config = StageConfig::checkout("Checkout", 600);
        assert!(config.action.argv().is_none());
    }

    #[test]
    fn test_builders() {
        let config = StageConfig::shell("publish docs", "ltd upload", 60)
            .with_policy(FailurePolicy::Unstable)
            .with_env("LTD_PRODUCT", "ts-envsensors")
            .in_dir("doc")
            .disabled();
        assert_eq!(config.on_failure, FailurePolicy::Unstable);
        assert_eq!(config.env["LTD_PRODUCT"], "ts-envsensors");
        assert_eq!(config.working_dir, Some(PathBuf::from("doc")));
        assert!(!config.enabled);
    }

    #[test]
    fn test_policy_deserializes_snake_case() {
        let policy: FailurePolicy = serde_json::from_str("\"tolerate\"").unwrap();
        assert_eq!(policy, FailurePolicy::Tolerate);
    }
}
