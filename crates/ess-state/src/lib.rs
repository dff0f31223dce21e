//! ess-state: build ledger persistence for the ESS CI pipeline engine.
//!
//! Every pipeline execution is recorded as a *build*: a ledger row carrying
//! the job, build number and change key, plus an ordered stream of build
//! events. The CI engine writes through the [`BuildLedger`] trait; retention
//! and the `ess ci` reporting commands read through it.
//!
//! ## Key Components
//!
//! - `BuildLedger`: backend-agnostic async trait
//! - `MemoryBuildLedger`: in-memory fake for tests
//! - `SurrealBuildLedger`: SurrealDB-backed ledger (in-memory, SurrealKV or remote)

mod error;
pub mod fakes;
pub mod ledger;
mod migrations;
mod schema;
pub mod surreal_ledger;

pub use error::{StateError, StorageError};
pub use ledger::{
    BuildEvent, BuildId, BuildLedger, BuildMetadata, BuildRecord, BuildStatus, BuildSummary,
    ContentDigest, StorageResult,
};
pub use surreal_ledger::SurrealBuildLedger;

/// Result type for ess-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
