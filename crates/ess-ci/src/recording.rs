//! Bridges [`BuildEventKind`]s to [`BuildLedger`] persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use ess_state::{
    BuildEvent, BuildId, BuildLedger, BuildMetadata, BuildSummary, ContentDigest, StorageResult,
};
use serde_json::Value;

use crate::event::BuildEventKind;
use crate::obs;
use crate::outcome::BuildOutcome;

/// Records one build's events with gap-free sequence numbers.
///
/// Usage:
/// 1. [`BuildRecorder::start`] creates the build.
/// 2. [`BuildRecorder::record`] appends each lifecycle event.
/// 3. [`BuildRecorder::finish`] appends `build_finished` and closes the build.
pub struct BuildRecorder {
    ledger: Arc<dyn BuildLedger>,
    build_id: BuildId,
    seq: AtomicU64,
}

impl BuildRecorder {
    /// Create a build in the ledger and record `build_started`.
    pub async fn start(
        ledger: Arc<dyn BuildLedger>,
        definition_digest: &ContentDigest,
        metadata: BuildMetadata,
    ) -> StorageResult<Self> {
        let build_id = ledger.create_build(definition_digest, metadata.clone()).await?;
        obs::emit_build_started(
            &build_id.0,
            &metadata.job,
            metadata.build_number,
            metadata.git_ref.as_deref().unwrap_or_default(),
        );
        let recorder = Self {
            ledger,
            build_id,
            seq: AtomicU64::new(0),
        };
        recorder
            .record(
                BuildEventKind::BuildStarted,
                serde_json::json!({ "build_number": metadata.build_number }),
            )
            .await?;
        Ok(recorder)
    }

    /// Continue recording a build created earlier, after its last event.
    pub async fn resume(ledger: Arc<dyn BuildLedger>, build_id: BuildId) -> StorageResult<Self> {
        let last_seq = ledger
            .get_events(&build_id)
            .await?
            .last()
            .map(|e| e.seq)
            .unwrap_or(0);
        Ok(Self {
            ledger,
            build_id,
            seq: AtomicU64::new(last_seq),
        })
    }

    /// Append an event. `detail` object fields are merged into the payload
    /// next to the kind's own fields.
    pub async fn record(&self, kind: BuildEventKind, detail: Value) -> StorageResult<()> {
        let kind_str = kind.kind_str();
        let mut payload = serde_json::to_value(&kind).unwrap_or(Value::Null);
        if let (Value::Object(base), Value::Object(extra)) = (&mut payload, detail) {
            for (key, value) in extra {
                base.entry(key).or_insert(value);
            }
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let event = BuildEvent {
            seq,
            kind: kind_str.clone(),
            payload,
            timestamp: Utc::now(),
        };
        obs::emit_event_appended(&self.build_id.0, &kind_str, seq);
        self.ledger.append_event(&self.build_id, event).await
    }

    /// Record `build_finished` and finish the build with the outcome's status.
    pub async fn finish(
        self,
        outcome: BuildOutcome,
        mut summary: BuildSummary,
    ) -> StorageResult<BuildSummary> {
        self.record(
            BuildEventKind::BuildFinished { outcome },
            serde_json::json!({ "duration_ms": summary.duration_ms }),
        )
        .await?;
        summary.total_events = self.events_recorded();
        obs::emit_build_finished(
            &self.build_id.0,
            outcome,
            summary.duration_ms,
            summary.total_events,
        );
        self.ledger
            .finish_build(&self.build_id, outcome.status(), summary.clone())
            .await?;
        Ok(summary)
    }

    pub fn build_id(&self) -> &BuildId {
        &self.build_id
    }

    /// Number of events recorded so far.
    pub fn events_recorded(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }
}
