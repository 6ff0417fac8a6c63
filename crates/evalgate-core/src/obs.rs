//! Structured lifecycle events.
//!
//! Each function logs one `event = "..."` record at `info!` (`warn!` for
//! failures). Scheduler driver tasks run inside [`pipeline_span`], so every
//! record of a pipeline run carries its iteration id and pipeline.

use evalgate_ledger::{ErrorKind, PipelineKind};
use tracing::{info, warn};

/// Span for one pipeline run, attached to the driver task with `Instrument`.
pub fn pipeline_span(iteration_id: &str, pipeline: PipelineKind) -> tracing::Span {
    tracing::info_span!(
        "evalgate.pipeline_run",
        iteration_id = %iteration_id,
        pipeline = %pipeline
    )
}

pub fn emit_evaluation_started(iteration_id: &str, label: &str, questions: usize) {
    info!(
        event = "evaluation.started",
        iteration_id = %iteration_id,
        label = %label,
        questions = questions,
    );
}

pub fn emit_run_started(pipeline: PipelineKind, questions: usize, concurrency: usize) {
    info!(
        event = "run.started",
        pipeline = %pipeline,
        questions = questions,
        concurrency = concurrency,
    );
}

pub fn emit_run_finished(
    pipeline: PipelineKind,
    completed: usize,
    skipped: usize,
    duration_ms: u64,
    cancelled: bool,
) {
    info!(
        event = "run.finished",
        pipeline = %pipeline,
        completed = completed,
        skipped = skipped,
        duration_ms = duration_ms,
        cancelled = cancelled,
    );
}

pub fn emit_attempt_completed(
    pipeline: PipelineKind,
    question_id: &str,
    attempt: u32,
    latency_ms: u64,
    error_kind: Option<ErrorKind>,
) {
    info!(
        event = "attempt.completed",
        pipeline = %pipeline,
        question_id = %question_id,
        attempt = attempt,
        latency_ms = latency_ms,
        error_kind = error_kind.map(|k| k.as_str()).unwrap_or("NONE"),
    );
}

pub fn emit_attempt_retrying(
    pipeline: PipelineKind,
    question_id: &str,
    attempt: u32,
    error_kind: ErrorKind,
    delay_ms: u64,
) {
    info!(
        event = "attempt.retrying",
        pipeline = %pipeline,
        question_id = %question_id,
        failed_attempt = attempt,
        error_kind = %error_kind,
        delay_ms = delay_ms,
    );
}

pub fn emit_attempt_abandoned(pipeline: PipelineKind, question_id: &str, attempt: u32) {
    warn!(
        event = "attempt.abandoned",
        pipeline = %pipeline,
        question_id = %question_id,
        attempt = attempt,
    );
}

pub fn emit_diagnostics_failed(question_id: &str, execution_id: &str, error: &dyn std::fmt::Display) {
    warn!(
        event = "diagnostics.failed",
        question_id = %question_id,
        execution_id = %execution_id,
        error = %error,
    );
}

pub fn emit_gate_evaluated(phase: &str, status: &str, unmet: usize, passed: bool) {
    info!(
        event = "gate.evaluated",
        phase = %phase,
        status = %status,
        unmet = unmet,
        passed = passed,
    );
}
