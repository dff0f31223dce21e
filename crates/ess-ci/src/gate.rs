//! Build verification from recorded events.

use std::collections::BTreeSet;

use ess_state::BuildEvent;
use serde::{Deserialize, Serialize};

use crate::event::BuildEventKind;
use crate::outcome::BuildOutcome;

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Outcome implied by the recorded stage events.
    pub outcome: BuildOutcome,

    /// Outcome recorded by `build_finished`, if the build finished.
    pub recorded: Option<BuildOutcome>,

    /// Whether the build is usable: consistent, and success or unstable.
    pub passed: bool,

    /// Inconsistencies found in the event stream.
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Recomputes a build's outcome from its event stream.
pub struct CiGate;

impl CiGate {
    /// Evaluate a build's events (ordered by seq).
    ///
    /// Rules:
    /// - A `stage_failed` contributes the outcome of its policy; a
    ///   `build_aborted` makes the build aborted.
    /// - Every `stage_started` must be followed by a `stage_passed` or
    ///   `stage_failed` for the same stage.
    /// - Sequence numbers must be strictly increasing.
    /// - The recorded `build_finished` outcome must match the computed one.
    pub fn evaluate(events: &[BuildEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut outcome = BuildOutcome::Success;
        let mut recorded = None;
        let mut started = BTreeSet::new();
        let mut completed = BTreeSet::new();
        let mut last_seq = 0u64;

        for event in events {
            if event.seq <= last_seq {
                violations.push(format!(
                    "event seq {} does not follow seq {}",
                    event.seq, last_seq
                ));
            }
            last_seq = event.seq;

            let Some(kind) = BuildEventKind::from_payload(&event.payload) else {
                violations.push(format!(
                    "event {} has unrecognized kind '{}'",
                    event.seq, event.kind
                ));
                continue;
            };

            match kind {
                BuildEventKind::StageStarted { stage } => {
                    started.insert(stage);
                }
                BuildEventKind::StagePassed { stage } => {
                    completed.insert(stage);
                }
                BuildEventKind::StageFailed { stage, policy } => {
                    outcome = outcome.combine(BuildOutcome::from_failure(policy));
                    completed.insert(stage);
                }
                BuildEventKind::BuildAborted { .. } => {
                    outcome = BuildOutcome::Aborted;
                }
                BuildEventKind::BuildFinished { outcome } => {
                    recorded = Some(outcome);
                }
                BuildEventKind::BuildStarted
                | BuildEventKind::StageSkipped { .. }
                | BuildEventKind::ReportCollected { .. }
                | BuildEventKind::ReportMissing { .. } => {}
            }
        }

        for stage in started.difference(&completed) {
            violations.push(format!("stage '{}' was started but never completed", stage));
        }

        match recorded {
            None => violations.push("build has no build_finished event".to_string()),
            Some(recorded) if recorded != outcome => violations.push(format!(
                "recorded outcome {} but events imply {}",
                recorded, outcome
            )),
            Some(_) => {}
        }

        let passed = violations.is_empty() && outcome.continues();
        let message = if !violations.is_empty() {
            format!("Gate failed with {} violation(s)", violations.len())
        } else if passed {
            format!("Build {}", outcome)
        } else {
            format!("Build did not pass: {}", outcome)
        };

        GateVerdict {
            outcome,
            recorded,
            passed,
            violations,
            message,
        }
    }
}
