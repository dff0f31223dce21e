//! Structured observability hooks for the build lifecycle.
//!
//! Events are emitted at `info!` level with an `event` field naming the
//! lifecycle step (`build.started`, `build.event_appended`, ...). Filter
//! with `ESS_LOG` / `RUST_LOG`.

use tracing::{info, warn};

use crate::outcome::BuildOutcome;

/// Span tagging everything logged inside a build with its id and job.
///
/// Attach it to futures with `tracing::Instrument`.
pub fn build_span(build_id: &str, job: &str) -> tracing::Span {
    tracing::info_span!("ess.build", build_id = %build_id, job = %job)
}

/// RAII guard entering a build-scoped span in synchronous code.
///
/// ```ignore
/// let _span = BuildSpan::enter("b-12345", "ts_envsensors");
/// ```
pub struct BuildSpan {
    _span: tracing::span::EnteredSpan,
}

impl BuildSpan {
    pub fn enter(build_id: &str, job: &str) -> Self {
        Self {
            _span: build_span(build_id, job).entered(),
        }
    }
}

pub fn emit_build_started(build_id: &str, job: &str, build_number: u64, git_ref: &str) {
    info!(
        event = "build.started",
        build_id = %build_id,
        job = %job,
        build_number = build_number,
        git_ref = %git_ref,
    );
}

/// Emit event: a single event appended to the build.
pub fn emit_event_appended(build_id: &str, event_kind: &str, seq: u64) {
    info!(event = "build.event_appended", build_id = %build_id, kind = %event_kind, seq = seq);
}

/// Emit event: build finished with outcome, duration and event count.
pub fn emit_build_finished(
    build_id: &str,
    outcome: BuildOutcome,
    duration_ms: u64,
    total_events: u64,
) {
    info!(
        event = "build.finished",
        build_id = %build_id,
        outcome = %outcome.as_str(),
        duration_ms = duration_ms,
        total_events = total_events,
    );
}

/// Emit event: a newer build of the same change superseded a running one.
pub fn emit_build_superseded(change_key: &str, previous: &dyn std::fmt::Display) {
    warn!(event = "build.superseded", change_key = %change_key, previous = %previous);
}

/// Emit event: recording failed during cleanup (warning level).
pub fn emit_record_error(build_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "build.record_error", build_id = %build_id, error = %error);
}
