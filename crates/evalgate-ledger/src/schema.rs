//! Persisted ledger schema.
//!
//! Everything in this module is part of the on-disk artifact. Maps are
//! `BTreeMap` so the serialized form is byte-for-byte deterministic for a
//! given state.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current artifact schema version. Readers must check it before parsing.
pub const SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Pipelines and outcome classification
// ---------------------------------------------------------------------------

/// The closed set of answering pipelines under evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineKind {
    Standard,
    Graph,
    Quantitative,
    Orchestrator,
}

impl PipelineKind {
    /// All pipelines, in canonical evaluation order.
    pub const ALL: [PipelineKind; 4] = [
        PipelineKind::Standard,
        PipelineKind::Graph,
        PipelineKind::Quantitative,
        PipelineKind::Orchestrator,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::Standard => "standard",
            PipelineKind::Graph => "graph",
            PipelineKind::Quantitative => "quantitative",
            PipelineKind::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a pipeline name is not one of [`PipelineKind::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown pipeline: {0}")]
pub struct UnknownPipeline(pub String);

impl FromStr for PipelineKind {
    type Err = UnknownPipeline;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(PipelineKind::Standard),
            "graph" => Ok(PipelineKind::Graph),
            "quantitative" => Ok(PipelineKind::Quantitative),
            "orchestrator" => Ok(PipelineKind::Orchestrator),
            _ => Err(UnknownPipeline(s.to_string())),
        }
    }
}

/// Failure classification for a single pipeline call.
///
/// A successful call has no `ErrorKind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "TIMEOUT")]
    Timeout,
    #[serde(rename = "NETWORK")]
    Network,
    #[serde(rename = "HTTP_5XX")]
    Http5xx,
    #[serde(rename = "HTTP_4XX")]
    Http4xx,
    #[serde(rename = "EMPTY_RESPONSE")]
    EmptyResponse,
    #[serde(rename = "MALFORMED")]
    Malformed,
}

impl ErrorKind {
    /// Transient failures are retried by the scheduler; everything else is
    /// terminal on first occurrence.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout | ErrorKind::Network | ErrorKind::Http5xx
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Network => "NETWORK",
            ErrorKind::Http5xx => "HTTP_5XX",
            ErrorKind::Http4xx => "HTTP_4XX",
            ErrorKind::EmptyResponse => "EMPTY_RESPONSE",
            ErrorKind::Malformed => "MALFORMED",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which scoring rule produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchMethod {
    #[serde(rename = "RECALL_OVERRIDE")]
    RecallOverride,
    #[serde(rename = "F1_THRESHOLD")]
    F1Threshold,
    #[serde(rename = "NON_EMPTY")]
    NonEmpty,
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MatchMethod::RecallOverride => "RECALL_OVERRIDE",
            MatchMethod::F1Threshold => "F1_THRESHOLD",
            MatchMethod::NonEmpty => "NON_EMPTY",
        })
    }
}

// ---------------------------------------------------------------------------
// Attempts and scored results
// ---------------------------------------------------------------------------

/// A retrieved source document returned alongside an answer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Outcome of one call to one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionAttempt {
    pub question_id: String,
    pub pipeline: PipelineKind,
    /// Evaluation run this attempt belongs to (becomes `Iteration::id`).
    pub iteration_id: String,
    /// 1-based attempt number within the question's retry sequence.
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub latency_ms: u64,
    /// Extracted answer text, `None` when the call produced no answer.
    pub raw_response: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Identifier used to fetch a step trace from the introspection endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

impl ExecutionAttempt {
    /// Whether the call completed with a usable answer.
    pub fn is_success(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// One normalized step of a pipeline execution trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepTrace {
    pub step_name: String,
    pub status: String,
    pub duration_ms: u64,
    pub input_preview: String,
    pub output_preview: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// An attempt plus its scoring verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredResult {
    #[serde(flatten)]
    pub attempt: ExecutionAttempt,
    pub correct: bool,
    /// Score in 0.0–1.0.
    pub score: f64,
    pub match_method: MatchMethod,
    /// Diagnostics trace, only captured for incorrect or errored results.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<StepTrace>,
}

impl ScoredResult {
    pub fn question_id(&self) -> &str {
        &self.attempt.question_id
    }

    pub fn pipeline(&self) -> PipelineKind {
        self.attempt.pipeline
    }

    pub fn is_error(&self) -> bool {
        self.attempt.error_kind.is_some()
    }
}

// ---------------------------------------------------------------------------
// Iterations
// ---------------------------------------------------------------------------

/// Per-pipeline aggregate for one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub tested: u32,
    pub correct: u32,
    pub errors: u32,
    pub accuracy_pct: f64,
    pub avg_latency_ms: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors_by_kind: BTreeMap<ErrorKind, u32>,
}

impl PipelineSummary {
    /// Share of tested questions that errored, in percent.
    pub fn error_pct(&self) -> f64 {
        if self.tested == 0 {
            0.0
        } else {
            round2(f64::from(self.errors) * 100.0 / f64::from(self.tested))
        }
    }
}

/// Accuracy across every pipeline in one iteration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OverallSummary {
    pub tested: u32,
    pub correct: u32,
    pub accuracy_pct: f64,
}

/// One committed batch of scored results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Iteration {
    /// Strictly increasing, gap-free, starting at 1.
    pub number: u64,
    pub id: String,
    pub label: String,
    pub committed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub corpus_digest: Option<String>,
    pub pipelines: BTreeMap<PipelineKind, PipelineSummary>,
    pub overall: OverallSummary,
    /// Results in canonical `(question_id, pipeline)` order.
    pub results: Vec<ScoredResult>,
}

// ---------------------------------------------------------------------------
// Question registry
// ---------------------------------------------------------------------------

/// Compact reference to a scored result inside an iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRef {
    pub iteration: u64,
    pub correct: bool,
    pub score: f64,
    pub match_method: MatchMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuestionStatus {
    Pass,
    Fail,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    New,
    Improving,
    Regressing,
    Stable,
    Flaky,
}

/// Lifetime aggregate for one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionRegistryEntry {
    pub question_id: String,
    pub pipeline: PipelineKind,
    /// Ordered by iteration number.
    pub runs: Vec<RunRef>,
    pub pass_rate: f64,
    pub best_score: f64,
    pub current_status: QuestionStatus,
    pub trend: Trend,
}

// ---------------------------------------------------------------------------
// Pipeline history
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub iteration: u64,
    pub tested: u32,
    pub correct: u32,
    pub errors: u32,
    pub accuracy_pct: f64,
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineHistory {
    pub trend: Vec<TrendPoint>,
    /// Cumulative error counts across all iterations.
    pub error_counters: BTreeMap<ErrorKind, u64>,
    pub total_tested: u64,
    pub total_correct: u64,
}

// ---------------------------------------------------------------------------
// Artifact root
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meta {
    pub schema_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of the most recent iteration, 0 when empty.
    pub last_iteration: u64,
}

/// The complete durable evaluation ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerState {
    pub meta: Meta,
    pub iterations: Vec<Iteration>,
    pub question_registry: BTreeMap<String, QuestionRegistryEntry>,
    pub pipelines: BTreeMap<PipelineKind, PipelineHistory>,
}

impl LedgerState {
    /// An empty ledger at the current schema version.
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            meta: Meta {
                schema_version: SCHEMA_VERSION,
                created_at: now,
                updated_at: now,
                last_iteration: 0,
            },
            iterations: Vec::new(),
            question_registry: BTreeMap::new(),
            pipelines: BTreeMap::new(),
        }
    }

    pub fn latest_iteration(&self) -> Option<&Iteration> {
        self.iterations.last()
    }

    /// Next iteration number: `max(existing) + 1`.
    pub fn next_iteration_number(&self) -> u64 {
        self.iterations
            .iter()
            .map(|it| it.number)
            .max()
            .unwrap_or(0)
            + 1
    }

    /// The most recent iteration that evaluated `pipeline`, with its summary.
    pub fn latest_summary(&self, pipeline: PipelineKind) -> Option<(&Iteration, &PipelineSummary)> {
        self.iterations
            .iter()
            .rev()
            .find_map(|it| it.pipelines.get(&pipeline).map(|s| (it, s)))
    }

    /// Every summary recorded for `pipeline`, oldest first, with its iteration number.
    pub fn summaries(&self, pipeline: PipelineKind) -> Vec<(u64, &PipelineSummary)> {
        self.iterations
            .iter()
            .filter_map(|it| it.pipelines.get(&pipeline).map(|s| (it.number, s)))
            .collect()
    }

    /// Check structural invariants of a loaded artifact.
    ///
    /// Iteration numbers must run `1..=n` without gaps and `meta.last_iteration`
    /// must match the newest one.
    pub fn validate(&self) -> Result<(), String> {
        for (idx, it) in self.iterations.iter().enumerate() {
            let expected = idx as u64 + 1;
            if it.number != expected {
                return Err(format!(
                    "iteration at position {} has number {} (expected {})",
                    idx, it.number, expected
                ));
            }
        }
        let last = self.iterations.last().map(|it| it.number).unwrap_or(0);
        if self.meta.last_iteration != last {
            return Err(format!(
                "meta.last_iteration is {} but newest iteration is {}",
                self.meta.last_iteration, last
            ));
        }
        Ok(())
    }
}

/// Round to two decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
