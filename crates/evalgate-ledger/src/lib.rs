//! evalgate-ledger: durable evaluation ledger
//!
//! This crate owns the only mutable shared resource of an evaluation run: the
//! JSON artifact holding every committed iteration, the per-question registry
//! and per-pipeline trend history.
//!
//! ## Layer 0 - Data/Persistence
//!
//! Focus: single-writer commits, atomic persistence, deterministic layout.
//!
//! ## Key Components
//!
//! - `StateStore`: critical section around commit, read and reset
//! - `CommitBuffer`: staging map for results from concurrent workers
//! - `LedgerBackend`: persistence seam (`FsLedgerBackend`, `MemoryLedgerBackend`)
//! - `schema`: the persisted types

pub mod aggregate;
pub mod backend;
mod error;
pub mod fakes;
pub mod schema;
mod store;

pub use aggregate::CommitMeta;
pub use backend::{FsLedgerBackend, LedgerBackend};
pub use error::{StoreError, StoreResult};
pub use schema::{
    ErrorKind, ExecutionAttempt, Iteration, LedgerState, MatchMethod, OverallSummary,
    PipelineHistory, PipelineKind, PipelineSummary, QuestionRegistryEntry, QuestionStatus, RunRef,
    ScoredResult, Source, StepTrace, Trend, TrendPoint, UnknownPipeline, SCHEMA_VERSION,
};
pub use store::{CommitBuffer, StateStore};
