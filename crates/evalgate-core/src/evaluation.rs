//! Evaluation driver: scheduler, then scorer, then diagnostics, then one commit.
//!
//! One [`Evaluator::evaluate`] call runs every requested pipeline one after
//! another and commits a single iteration covering all of them.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use evalgate_ledger::{
    CommitBuffer, CommitMeta, Iteration, PipelineKind, PipelineSummary, ScoredResult, StateStore,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::client::AnswerService;
use crate::diagnostics::DiagnosticsExtractor;
use crate::domain::{EvalError, PipelineEndpoint, Question, Result};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::RetryPolicy;
use crate::scheduler::{CancelHandle, RunReport, Scheduler, SchedulerOptions};
use crate::scorer::Scorer;

/// What to evaluate.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub label: String,
    pub questions: Vec<Question>,
    /// Pipelines to run, in order. Questions targeting other pipelines are ignored.
    pub pipelines: Vec<PipelineKind>,
    pub corpus_digest: Option<String>,
    pub options: SchedulerOptions,
}

/// Per-pipeline comparison against the previous iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub pipeline: PipelineKind,
    pub current: PipelineSummary,
    pub previous: Option<PipelineSummary>,
    /// Accuracy change in percentage points, `None` without a previous run.
    pub delta_pp: Option<f64>,
    pub regressed: bool,
    pub error_rate_exceeded: bool,
}

impl PipelineOutcome {
    pub fn ok(&self) -> bool {
        !self.regressed && !self.error_rate_exceeded
    }
}

/// Result of one evaluation.
#[derive(Debug, Clone)]
pub struct EvaluationOutcome {
    pub iteration: Iteration,
    pub reports: Vec<RunReport>,
    pub pipelines: Vec<PipelineOutcome>,
}

impl EvaluationOutcome {
    /// Every invoked pipeline held or improved and stayed under the error ceiling.
    pub fn passed(&self) -> bool {
        self.pipelines.iter().all(PipelineOutcome::ok)
    }

    pub fn cancelled(&self) -> bool {
        self.reports.iter().any(RunReport::cancelled)
    }
}

/// Compare `current` with the previous summaries.
pub fn compare(
    current: &BTreeMap<PipelineKind, PipelineSummary>,
    previous: &BTreeMap<PipelineKind, PipelineSummary>,
    regression_tolerance_pp: f64,
    max_error_pct: f64,
) -> Vec<PipelineOutcome> {
    current
        .iter()
        .map(|(kind, summary)| {
            let prev = previous.get(kind).cloned();
            let delta_pp = prev
                .as_ref()
                .map(|p| evalgate_ledger::schema::round2(summary.accuracy_pct - p.accuracy_pct));
            PipelineOutcome {
                pipeline: *kind,
                current: summary.clone(),
                previous: prev,
                delta_pp,
                regressed: delta_pp.map(|d| -d > regression_tolerance_pp).unwrap_or(false),
                error_rate_exceeded: summary.error_pct() > max_error_pct,
            }
        })
        .collect()
}

pub struct Evaluator {
    scheduler: Scheduler,
    scorer: Scorer,
    diagnostics: Option<DiagnosticsExtractor>,
    endpoints: BTreeMap<PipelineKind, PipelineEndpoint>,
    regression_tolerance_pp: f64,
    max_error_pct: f64,
}

impl Evaluator {
    pub fn new(client: Arc<dyn AnswerService>, policy: RetryPolicy) -> Self {
        Self {
            scheduler: Scheduler::new(client, policy),
            scorer: Scorer::standard(),
            diagnostics: None,
            endpoints: BTreeMap::new(),
            regression_tolerance_pp: 2.0,
            max_error_pct: 10.0,
        }
    }

    pub fn with_endpoint(mut self, endpoint: PipelineEndpoint) -> Self {
        self.endpoints.insert(endpoint.kind, endpoint);
        self
    }

    pub fn with_scorer(mut self, scorer: Scorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: Option<DiagnosticsExtractor>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_thresholds(mut self, regression_tolerance_pp: f64, max_error_pct: f64) -> Self {
        self.regression_tolerance_pp = regression_tolerance_pp;
        self.max_error_pct = max_error_pct;
        self
    }

    /// Run, score and commit one iteration.
    ///
    /// Pipeline failures never abort the evaluation; only a missing endpoint,
    /// a request with no questions for any pipeline, or a failed commit does.
    /// Cancellation still commits what finished.
    pub async fn evaluate(
        &self,
        store: &StateStore,
        request: EvaluationRequest,
        cancel: &CancelHandle,
    ) -> Result<EvaluationOutcome> {
        let iteration_id = request.options.iteration_id.clone();
        obs::emit_evaluation_started(&iteration_id, &request.label, request.questions.len());

        let mut planned: Vec<(PipelineEndpoint, Vec<Question>)> = Vec::new();
        for kind in &request.pipelines {
            let endpoint = self
                .endpoints
                .get(kind)
                .cloned()
                .ok_or_else(|| EvalError::NoEndpoint(kind.to_string()))?;
            let questions: Vec<Question> = request
                .questions
                .iter()
                .filter(|q| q.target_pipeline == *kind)
                .cloned()
                .collect();
            if questions.is_empty() {
                warn!(pipeline = %kind, "no questions for pipeline, skipping");
                continue;
            }
            planned.push((endpoint, questions));
        }
        if planned.is_empty() {
            return Err(EvalError::NoQuestions);
        }

        let before = store.read().await;
        let previous: BTreeMap<PipelineKind, PipelineSummary> = planned
            .iter()
            .filter_map(|(endpoint, _)| {
                before
                    .latest_summary(endpoint.kind)
                    .map(|(_, s)| (endpoint.kind, s.clone()))
            })
            .collect();
        drop(before);

        let buffer = CommitBuffer::new();
        let mut reports = Vec::new();

        for (endpoint, questions) in planned {
            let report = self
                .run_pipeline(questions, endpoint, request.options.clone(), cancel, &buffer)
                .await;
            reports.push(report);
        }

        let meta = CommitMeta::new(request.label.clone()).with_run_id(iteration_id);
        let meta = match request.corpus_digest {
            Some(digest) => meta.with_corpus_digest(digest),
            None => meta,
        };
        let iteration = store.commit_with_meta(meta, buffer.drain().await).await?;
        METRICS.inc_commits();

        let pipelines = compare(
            &iteration.pipelines,
            &previous,
            self.regression_tolerance_pp,
            self.max_error_pct,
        );
        Ok(EvaluationOutcome {
            iteration,
            reports,
            pipelines,
        })
    }

    async fn run_pipeline(
        &self,
        questions: Vec<Question>,
        endpoint: PipelineEndpoint,
        options: SchedulerOptions,
        cancel: &CancelHandle,
        buffer: &CommitBuffer,
    ) -> RunReport {
        let by_id: HashMap<String, Question> = questions
            .iter()
            .map(|q| (q.id.clone(), q.clone()))
            .collect();

        let mut stream = self
            .scheduler
            .run(questions, endpoint, options, cancel.token());

        while let Some(attempt) = stream.next().await {
            let Some(question) = by_id.get(&attempt.question_id) else {
                warn!(question_id = %attempt.question_id, "attempt for unknown question dropped");
                continue;
            };
            let mut scored = self.scorer.score_attempt(attempt, question);
            self.attach_trace(&mut scored).await;
            buffer.push(scored).await;
        }

        stream.finish().await
    }

    /// Fetch a step trace for incorrect or errored results.
    async fn attach_trace(&self, scored: &mut ScoredResult) {
        if scored.correct {
            return;
        }
        let (Some(diagnostics), Some(execution_id)) =
            (&self.diagnostics, scored.attempt.execution_id.clone())
        else {
            return;
        };
        match diagnostics.extract(&execution_id).await {
            Ok(trace) => scored.trace = trace,
            Err(e) => {
                METRICS.inc_diagnostics_failures();
                obs::emit_diagnostics_failed(scored.question_id(), &execution_id, &e);
            }
        }
    }
}
