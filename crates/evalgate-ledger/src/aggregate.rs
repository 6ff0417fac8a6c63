//! Pure merge logic applied inside the store's critical section.
//!
//! Nothing here touches the filesystem or locks; [`crate::store::StateStore`]
//! calls [`apply_commit`] on a private copy of the state and only publishes
//! it once persistence succeeded.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::schema::{
    round2, Iteration, LedgerState, OverallSummary, PipelineKind, PipelineSummary, QuestionStatus,
    QuestionRegistryEntry, RunRef, ScoredResult, Trend, TrendPoint,
};

/// Number of most recent runs inspected for flakiness.
const FLAKY_WINDOW: usize = 5;

/// Descriptive fields of an iteration supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitMeta {
    pub label: String,
    /// Evaluation run id; a fresh UUID is generated when absent.
    pub run_id: Option<String>,
    /// SHA-256 of the corpus file the run was drawn from.
    pub corpus_digest: Option<String>,
}

impl CommitMeta {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_corpus_digest(mut self, digest: impl Into<String>) -> Self {
        self.corpus_digest = Some(digest.into());
        self
    }
}

/// Deduplicate by `(question_id, pipeline)` (last one wins) and sort canonically.
pub fn canonicalize(results: Vec<ScoredResult>) -> Vec<ScoredResult> {
    let mut by_key: BTreeMap<(String, PipelineKind), ScoredResult> = BTreeMap::new();
    for result in results {
        by_key.insert((result.question_id().to_string(), result.pipeline()), result);
    }
    by_key.into_values().collect()
}

/// Per-pipeline summaries for a set of results.
pub fn summarize(results: &[ScoredResult]) -> BTreeMap<PipelineKind, PipelineSummary> {
    let mut summaries: BTreeMap<PipelineKind, PipelineSummary> = BTreeMap::new();
    let mut latency_totals: BTreeMap<PipelineKind, u64> = BTreeMap::new();

    for result in results {
        let summary = summaries.entry(result.pipeline()).or_default();
        summary.tested += 1;
        if result.correct {
            summary.correct += 1;
        }
        if let Some(kind) = result.attempt.error_kind {
            summary.errors += 1;
            *summary.errors_by_kind.entry(kind).or_insert(0) += 1;
        }
        *latency_totals.entry(result.pipeline()).or_insert(0) += result.attempt.latency_ms;
    }

    for (kind, summary) in summaries.iter_mut() {
        let tested = f64::from(summary.tested);
        summary.accuracy_pct = round2(f64::from(summary.correct) * 100.0 / tested);
        let total_latency = latency_totals.get(kind).copied().unwrap_or(0);
        summary.avg_latency_ms = round2(total_latency as f64 / tested);
    }

    summaries
}

/// Accuracy across all pipelines.
pub fn overall(summaries: &BTreeMap<PipelineKind, PipelineSummary>) -> OverallSummary {
    let tested: u32 = summaries.values().map(|s| s.tested).sum();
    let correct: u32 = summaries.values().map(|s| s.correct).sum();
    let accuracy_pct = if tested == 0 {
        0.0
    } else {
        round2(f64::from(correct) * 100.0 / f64::from(tested))
    };
    OverallSummary {
        tested,
        correct,
        accuracy_pct,
    }
}

/// Classify a question's recent trajectory.
pub fn compute_trend(runs: &[RunRef]) -> Trend {
    if runs.len() < 2 {
        return Trend::New;
    }

    let window = &runs[runs.len().saturating_sub(FLAKY_WINDOW)..];
    let flips = window
        .windows(2)
        .filter(|pair| pair[0].correct != pair[1].correct)
        .count();
    if flips >= 2 {
        return Trend::Flaky;
    }

    let prev = &runs[runs.len() - 2];
    let last = &runs[runs.len() - 1];
    match (prev.correct, last.correct) {
        (false, true) => Trend::Improving,
        (true, false) => Trend::Regressing,
        _ => Trend::Stable,
    }
}

fn status_of(result: &ScoredResult) -> QuestionStatus {
    if result.is_error() {
        QuestionStatus::Error
    } else if result.correct {
        QuestionStatus::Pass
    } else {
        QuestionStatus::Fail
    }
}

fn update_registry(state: &mut LedgerState, number: u64, result: &ScoredResult) {
    let run = RunRef {
        iteration: number,
        correct: result.correct,
        score: result.score,
        match_method: result.match_method,
        error_kind: result.attempt.error_kind,
        latency_ms: result.attempt.latency_ms,
    };

    let entry = state
        .question_registry
        .entry(result.question_id().to_string())
        .or_insert_with(|| QuestionRegistryEntry {
            question_id: result.question_id().to_string(),
            pipeline: result.pipeline(),
            runs: Vec::new(),
            pass_rate: 0.0,
            best_score: 0.0,
            current_status: QuestionStatus::Fail,
            trend: Trend::New,
        });

    entry.pipeline = result.pipeline();
    entry.runs.push(run);

    let passes = entry.runs.iter().filter(|r| r.correct).count();
    entry.pass_rate = (passes as f64 / entry.runs.len() as f64 * 10_000.0).round() / 10_000.0;
    entry.best_score = entry.runs.iter().map(|r| r.score).fold(0.0, f64::max);
    entry.current_status = status_of(result);
    entry.trend = compute_trend(&entry.runs);
}

/// Merge one batch of results into `state` as a new iteration.
///
/// Assigns `number = max(existing) + 1`. An empty batch still produces an
/// iteration; the registry and pipeline histories are then left untouched.
pub fn apply_commit(
    state: &mut LedgerState,
    meta: CommitMeta,
    results: Vec<ScoredResult>,
    now: DateTime<Utc>,
) -> Iteration {
    let number = state.next_iteration_number();
    let results = canonicalize(results);
    let pipelines = summarize(&results);
    let overall = overall(&pipelines);

    for result in &results {
        update_registry(state, number, result);
    }

    for (kind, summary) in &pipelines {
        let history = state.pipelines.entry(*kind).or_default();
        history.trend.push(TrendPoint {
            iteration: number,
            tested: summary.tested,
            correct: summary.correct,
            errors: summary.errors,
            accuracy_pct: summary.accuracy_pct,
            avg_latency_ms: summary.avg_latency_ms,
        });
        for (error_kind, count) in &summary.errors_by_kind {
            *history.error_counters.entry(*error_kind).or_insert(0) += u64::from(*count);
        }
        history.total_tested += u64::from(summary.tested);
        history.total_correct += u64::from(summary.correct);
    }

    let iteration = Iteration {
        number,
        id: meta
            .run_id
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        label: meta.label,
        committed_at: now,
        corpus_digest: meta.corpus_digest,
        pipelines,
        overall,
        results,
    };

    state.iterations.push(iteration.clone());
    state.meta.last_iteration = number;
    state.meta.updated_at = now;

    iteration
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ErrorKind, ExecutionAttempt, MatchMethod};

    fn result(qid: &str, pipeline: PipelineKind, correct: bool, latency_ms: u64) -> ScoredResult {
        ScoredResult {
            attempt: ExecutionAttempt {
                question_id: qid.to_string(),
                pipeline,
                iteration_id: "run".to_string(),
                attempt: 1,
                started_at: Utc::now(),
                latency_ms,
                raw_response: Some("answer".to_string()),
                error_kind: None,
                error_message: None,
                http_status: Some(200),
                execution_id: None,
                sources: Vec::new(),
                confidence: None,
            },
            correct,
            score: if correct { 1.0 } else { 0.0 },
            match_method: MatchMethod::F1Threshold,
            trace: Vec::new(),
        }
    }

    fn errored(qid: &str, pipeline: PipelineKind, kind: ErrorKind) -> ScoredResult {
        let mut r = result(qid, pipeline, false, 30_000);
        r.attempt.raw_response = None;
        r.attempt.error_kind = Some(kind);
        r.attempt.error_message = Some("boom".to_string());
        r
    }

    fn run_ref(correct: bool) -> RunRef {
        RunRef {
            iteration: 0,
            correct,
            score: 0.0,
            match_method: MatchMethod::F1Threshold,
            error_kind: None,
            latency_ms: 0,
        }
    }

    #[test]
    fn test_summary_counts_and_accuracy() {
        let results = vec![
            result("q1", PipelineKind::Graph, true, 100),
            result("q2", PipelineKind::Graph, false, 300),
            errored("q3", PipelineKind::Graph, ErrorKind::Timeout),
            result("q4", PipelineKind::Standard, true, 50),
        ];
        let summaries = summarize(&results);

        let graph = &summaries[&PipelineKind::Graph];
        assert_eq!(graph.tested, 3);
        assert_eq!(graph.correct, 1);
        assert_eq!(graph.errors, 1);
        assert_eq!(graph.accuracy_pct, 33.33);
        assert_eq!(graph.errors_by_kind[&ErrorKind::Timeout], 1);
        assert_eq!(graph.avg_latency_ms, 10_133.33);

        let total = overall(&summaries);
        assert_eq!(total.tested, 4);
        assert_eq!(total.correct, 2);
        assert_eq!(total.accuracy_pct, 50.0);
    }

    #[test]
    fn test_canonical_order_is_independent_of_input_order() {
        let a = vec![
            result("q2", PipelineKind::Graph, true, 1),
            result("q1", PipelineKind::Graph, true, 1),
            result("q10", PipelineKind::Graph, true, 1),
        ];
        let mut b = a.clone();
        b.reverse();
        let ids = |v: Vec<ScoredResult>| {
            canonicalize(v)
                .into_iter()
                .map(|r| r.attempt.question_id)
                .collect::<Vec<_>>()
        };
        assert_eq!(ids(a.clone()), ids(b));
        assert_eq!(ids(a), vec!["q1", "q10", "q2"]);
    }

    #[test]
    fn test_duplicate_question_keeps_last() {
        let first = result("q1", PipelineKind::Graph, false, 1);
        let second = result("q1", PipelineKind::Graph, true, 2);
        let merged = canonicalize(vec![first, second]);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].correct);
    }

    #[test]
    fn test_numbering_is_gap_free() {
        let mut state = LedgerState::empty(Utc::now());
        for expected in 1..=4 {
            let it = apply_commit(&mut state, CommitMeta::new("x"), Vec::new(), Utc::now());
            assert_eq!(it.number, expected);
        }
        assert!(state.validate().is_ok());
        assert_eq!(state.meta.last_iteration, 4);
    }

    #[test]
    fn test_empty_commit_leaves_registry_untouched() {
        let mut state = LedgerState::empty(Utc::now());
        apply_commit(
            &mut state,
            CommitMeta::new("first"),
            vec![result("q1", PipelineKind::Graph, true, 10)],
            Utc::now(),
        );
        let registry_before = state.question_registry.clone();
        let pipelines_before = state.pipelines.clone();

        let it = apply_commit(&mut state, CommitMeta::new("empty"), Vec::new(), Utc::now());

        assert_eq!(it.number, 2);
        assert!(it.pipelines.is_empty());
        assert_eq!(state.question_registry, registry_before);
        assert_eq!(state.pipelines, pipelines_before);
    }

    #[test]
    fn test_registry_tracks_runs_and_status() {
        let mut state = LedgerState::empty(Utc::now());
        apply_commit(
            &mut state,
            CommitMeta::new("1"),
            vec![result("q1", PipelineKind::Graph, false, 10)],
            Utc::now(),
        );
        apply_commit(
            &mut state,
            CommitMeta::new("2"),
            vec![result("q1", PipelineKind::Graph, true, 10)],
            Utc::now(),
        );
        apply_commit(
            &mut state,
            CommitMeta::new("3"),
            vec![errored("q1", PipelineKind::Graph, ErrorKind::Http5xx)],
            Utc::now(),
        );

        let entry = &state.question_registry["q1"];
        assert_eq!(
            entry.runs.iter().map(|r| r.iteration).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(entry.pass_rate, 0.3333);
        assert_eq!(entry.best_score, 1.0);
        assert_eq!(entry.current_status, QuestionStatus::Error);
        assert_eq!(entry.trend, Trend::Flaky);

        let history = &state.pipelines[&PipelineKind::Graph];
        assert_eq!(history.trend.len(), 3);
        assert_eq!(history.error_counters[&ErrorKind::Http5xx], 1);
        assert_eq!(history.total_tested, 3);
        assert_eq!(history.total_correct, 1);
    }

    #[test]
    fn test_trend_classification() {
        assert_eq!(compute_trend(&[run_ref(true)]), Trend::New);
        assert_eq!(compute_trend(&[run_ref(false), run_ref(true)]), Trend::Improving);
        assert_eq!(compute_trend(&[run_ref(true), run_ref(false)]), Trend::Regressing);
        assert_eq!(compute_trend(&[run_ref(true), run_ref(true)]), Trend::Stable);
        assert_eq!(
            compute_trend(&[run_ref(true), run_ref(false), run_ref(true)]),
            Trend::Flaky
        );
        // Old flips outside the window do not count.
        let mut runs = vec![run_ref(true), run_ref(false), run_ref(true)];
        runs.extend((0..5).map(|_| run_ref(true)));
        assert_eq!(compute_trend(&runs), Trend::Stable);
    }

    #[test]
    fn test_run_id_becomes_iteration_id() {
        let mut state = LedgerState::empty(Utc::now());
        let it = apply_commit(
            &mut state,
            CommitMeta::new("labelled")
                .with_run_id("run-42")
                .with_corpus_digest("abc"),
            Vec::new(),
            Utc::now(),
        );
        assert_eq!(it.id, "run-42");
        assert_eq!(it.label, "labelled");
        assert_eq!(it.corpus_digest.as_deref(), Some("abc"));
    }
}
