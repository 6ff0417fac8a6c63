//! Domain models for evalgate.
//!
//! Canonical definitions for the inputs of an evaluation:
//! - `Question`: immutable benchmark question loaded from a corpus
//! - `PipelineEndpoint`: how to reach one answering pipeline
//!
//! Persisted outcome types (`ExecutionAttempt`, `ScoredResult`, ...) live in
//! `evalgate-ledger` and are re-exported from the crate root.

pub mod error;
pub mod pipeline;
pub mod question;

pub use error::{ConfigError, CorpusError, DiagnosticsError, EvalError, Result};
pub use pipeline::{PipelineEndpoint, PipelineRequest, ANSWER_FIELDS};
pub use question::Question;
