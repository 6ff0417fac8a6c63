//! evalgate core library
//!
//! Loads a question corpus, runs it against one or more answering pipelines
//! under bounded concurrency, scores every answer, commits the iteration to
//! the ledger and evaluates phase gates over the accumulated history.

pub mod client;
pub mod config;
pub mod corpus;
pub mod diagnostics;
pub mod domain;
pub mod evaluation;
pub mod gate;
pub mod metrics;
pub mod obs;
pub mod reporting;
pub mod retry;
pub mod scheduler;
pub mod scorer;
pub mod telemetry;

pub use domain::{
    ConfigError, CorpusError, DiagnosticsError, EvalError, PipelineEndpoint,
    PipelineRequest, Question, Result, ANSWER_FIELDS,
};

pub use client::{classify_response, AnswerService, Classified, HttpPipelineClient};
pub use config::EngineConfig;
pub use diagnostics::DiagnosticsExtractor;
pub use evaluation::{EvaluationOutcome, EvaluationRequest, Evaluator, PipelineOutcome};
pub use gate::{
    evaluate_phases, Condition, GateOptions, GateResult, GateStatus, GateTable, PhaseGate,
    PipelineThreshold, PipelineVerdict, StabilityRule, UnmetCondition,
};
pub use metrics::METRICS;
pub use retry::RetryPolicy;
pub use scheduler::{
    CancelHandle, CancelToken, RunReport, RunStream, Scheduler, SchedulerOptions, StopReason,
};
pub use scorer::{Scorer, ScorerConfig, Verdict};

pub use evalgate_ledger::{
    CommitMeta, ErrorKind, ExecutionAttempt, FsLedgerBackend, Iteration, LedgerBackend,
    LedgerState, MatchMethod, PipelineKind, PipelineSummary, ScoredResult, StateStore, StoreError,
};
