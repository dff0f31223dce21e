//! Build lifecycle events recorded in the ledger.

use serde::{Deserialize, Serialize};

use crate::outcome::BuildOutcome;
use crate::reports::ReportKind;
use crate::stage::FailurePolicy;

/// Kind of a build event.
///
/// Serialized with a `type` tag; the tag is also the ledger's event kind
/// string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BuildEventKind {
    BuildStarted,
    StageStarted {
        stage: String,
    },
    StagePassed {
        stage: String,
    },
    StageFailed {
        stage: String,
        policy: FailurePolicy,
    },
    StageSkipped {
        stage: String,
        reason: String,
    },
    ReportCollected {
        report: ReportKind,
    },
    ReportMissing {
        report: ReportKind,
    },
    BuildAborted {
        reason: String,
    },
    BuildFinished {
        outcome: BuildOutcome,
    },
}

impl BuildEventKind {
    /// The snake_case tag, e.g. `stage_failed`.
    pub fn kind_str(&self) -> String {
        serde_json::to_value(self)
            .ok()
            .and_then(|v| v["type"].as_str().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Stage this event refers to, if any.
    pub fn stage(&self) -> Option<&str> {
        match self {
            BuildEventKind::StageStarted { stage }
            | BuildEventKind::StagePassed { stage }
            | BuildEventKind::StageFailed { stage, .. }
            | BuildEventKind::StageSkipped { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// Recover the kind from a stored event payload.
    pub fn from_payload(payload: &serde_json::Value) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_kind_str_uses_tag() {
        assert_eq!(BuildEventKind::BuildStarted.kind_str(), "build_started");
        assert_eq!(
            BuildEventKind::StageFailed {
                stage: "Unit tests".into(),
                policy: FailurePolicy::Fail
            }
            .kind_str(),
            "stage_failed"
        );
    }

    #[test]
    fn test_payload_with_extra_fields_parses() {
        let payload = json!({
            "type": "stage_failed",
            "stage": "Publish docs",
            "policy": "unstable",
            "exit_code": 1,
            "duration_ms": 12
        });
        let kind = BuildEventKind::from_payload(&payload).unwrap();
        assert_eq!(
            kind,
            BuildEventKind::StageFailed {
                stage: "Publish docs".into(),
                policy: FailurePolicy::Unstable
            }
        );
        assert_eq!(kind.stage(), Some("Publish docs"));
    }

    #[test]
    fn test_finished_serializes_outcome() {
        let value = serde_json::to_value(BuildEventKind::BuildFinished {
            outcome: BuildOutcome::Unstable,
        })
        .unwrap();
        assert_eq!(value, json!({"type": "build_finished", "outcome": "unstable"}));
    }
}
