//! ESS CI - pipeline engine for the ESS controller
//!
//! Provides a CI pipeline orchestrator that:
//! - Runs the stages of a TOML pipeline definition strictly in order
//! - Checks out sibling packages with a branch fallback
//! - Applies per-stage failure policies (fail, unstable, tolerate)
//! - Always runs cleanup stages, including after an abort
//! - Records every step of a build in the build ledger

pub mod branch;
pub mod checkout;
pub mod context;
pub mod coordinator;
pub mod definition;
pub mod error;
pub mod event;
pub mod gate;
pub mod lease;
pub mod obs;
pub mod outcome;
pub mod pipeline;
pub mod recording;
pub mod reports;
pub mod retention;
pub mod runner;
pub mod stage;

// Re-export key types
pub use context::BuildContext;
pub use coordinator::{BuildCoordinator, BuildTicket};
pub use definition::{Dependency, PipelineDefinition};
pub use error::{CiError, Result};
pub use event::BuildEventKind;
pub use gate::{CiGate, GateVerdict};
pub use lease::ChangeLease;
pub use outcome::BuildOutcome;
pub use pipeline::{CiPipeline, PipelineResult};
pub use recording::BuildRecorder;
pub use reports::{ReportCollection, ReportKind, ReportsConfig};
pub use retention::{abandon_stale_builds, prune_builds, PruneResult, RetentionPolicy};
pub use runner::{CiRunner, StageResult};
pub use stage::{FailurePolicy, StageAction, StageConfig};
