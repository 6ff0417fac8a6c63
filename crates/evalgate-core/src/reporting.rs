use std::fmt::Write as _;
use std::path::Path;

use anyhow::{Context, Result};
use evalgate_ledger::{ErrorKind, LedgerState, PipelineSummary};

use crate::evaluation::{EvaluationOutcome, PipelineOutcome};
use crate::gate::GateResult;

fn fmt_errors_by_kind(summary: &PipelineSummary) -> String {
    if summary.errors_by_kind.is_empty() {
        return "-".to_string();
    }
    summary
        .errors_by_kind
        .iter()
        .map(|(kind, n)| format!("{}={n}", kind.as_str()))
        .collect::<Vec<_>>()
        .join(" ")
}

fn fmt_delta(delta: Option<f64>) -> String {
    match delta {
        Some(d) => format!("{d:+.2}pp"),
        None => "new".to_string(),
    }
}

/// Plain-text per-pipeline table printed after `evaluate`.
pub fn render_summary_table(outcome: &EvaluationOutcome) -> String {
    let mut out = String::new();
    let it = &outcome.iteration;
    let _ = writeln!(out, "Iteration {} ({}) - {}", it.number, it.id, it.label);
    let _ = writeln!(
        out,
        "{:<14} {:>6} {:>7} {:>6} {:>9} {:>10} {:>11}  {}",
        "pipeline", "tested", "correct", "errors", "accuracy", "delta", "avg_ms", "errors_by_kind"
    );
    for p in &outcome.pipelines {
        let _ = writeln!(
            out,
            "{:<14} {:>6} {:>7} {:>6} {:>8.2}% {:>10} {:>11.2}  {}{}",
            p.pipeline.as_str(),
            p.current.tested,
            p.current.correct,
            p.current.errors,
            p.current.accuracy_pct,
            fmt_delta(p.delta_pp),
            p.current.avg_latency_ms,
            fmt_errors_by_kind(&p.current),
            flag(p),
        );
    }
    let _ = writeln!(
        out,
        "overall: {}/{} correct ({:.2}%)",
        it.overall.correct, it.overall.tested, it.overall.accuracy_pct
    );

    for report in &outcome.reports {
        if !report.skipped.is_empty() || report.abandoned > 0 {
            let _ = writeln!(
                out,
                "{}: {} skipped, {} abandoned{}",
                report.pipeline,
                report.skipped.len(),
                report.abandoned,
                report
                    .stop_reason
                    .map(|r| format!(" ({r:?})"))
                    .unwrap_or_default(),
            );
        }
    }
    out
}

fn flag(p: &PipelineOutcome) -> &'static str {
    match (p.regressed, p.error_rate_exceeded) {
        (true, true) => "  [REGRESSED, ERROR RATE]",
        (true, false) => "  [REGRESSED]",
        (false, true) => "  [ERROR RATE]",
        (false, false) => "",
    }
}

/// Markdown report of one evaluation.
pub fn render_evaluation_md(outcome: &EvaluationOutcome) -> String {
    let it = &outcome.iteration;
    let mut out = String::new();
    let _ = writeln!(out, "# Iteration {}: {}\n", it.number, it.label);
    let _ = writeln!(out, "- id: `{}`", it.id);
    let _ = writeln!(out, "- committed: {}", it.committed_at.to_rfc3339());
    if let Some(digest) = &it.corpus_digest {
        let _ = writeln!(out, "- corpus: `{digest}`");
    }
    let _ = writeln!(
        out,
        "- overall: {}/{} ({:.2}%)\n",
        it.overall.correct, it.overall.tested, it.overall.accuracy_pct
    );

    out.push_str("| pipeline | tested | correct | errors | accuracy | delta | avg latency |\n");
    out.push_str("|---|---|---|---|---|---|---|\n");
    for p in &outcome.pipelines {
        let _ = writeln!(
            out,
            "| {} | {} | {} | {} | {:.2}% | {} | {:.0} ms |",
            p.pipeline,
            p.current.tested,
            p.current.correct,
            p.current.errors,
            p.current.accuracy_pct,
            fmt_delta(p.delta_pp),
            p.current.avg_latency_ms
        );
    }

    let failures: Vec<_> = it.results.iter().filter(|r| !r.correct).collect();
    if !failures.is_empty() {
        out.push_str("\n## Failures\n\n");
        for r in failures {
            let cause = match r.attempt.error_kind {
                Some(kind) => kind.as_str().to_string(),
                None => format!("{} score {:.2}", r.match_method, r.score),
            };
            let _ = writeln!(out, "- `{}` ({}): {}", r.question_id(), r.pipeline(), cause);
            if let Some(step) = r.trace.iter().find(|s| s.error.is_some()) {
                let _ = writeln!(
                    out,
                    "  - failed at `{}`: {}",
                    step.step_name,
                    step.error.as_deref().unwrap_or_default()
                );
            }
        }
    }
    out
}

/// Write the markdown report for an evaluation.
pub fn write_evaluation_md(path: &Path, outcome: &EvaluationOutcome) -> Result<()> {
    let md = render_evaluation_md(outcome);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Plain-text gate verdicts printed by `gate-check`.
pub fn render_gate_results(results: &[GateResult], selected: Option<&str>) -> String {
    let mut out = String::new();
    for result in results {
        let marker = if Some(result.phase.as_str()) == selected {
            "*"
        } else {
            " "
        };
        let _ = writeln!(out, "{marker} {:<16} {}", result.phase, result.status);
        for verdict in result.pipeline_verdicts.values() {
            let _ = writeln!(
                out,
                "    {:<14} {} accuracy {:.2}% (min {:.2}%), tested {} (min {})",
                verdict.pipeline.as_str(),
                if verdict.passed { "PASS" } else { "FAIL" },
                verdict.accuracy_pct,
                verdict.min_accuracy,
                verdict.tested,
                verdict.min_questions
            );
        }
        for unmet in &result.unmet_conditions {
            let _ = writeln!(out, "    unmet [{}] {}", unmet.condition, unmet.detail);
        }
        for warning in &result.warnings {
            let _ = writeln!(out, "    warning {warning}");
        }
    }
    out
}

/// Plain-text ledger overview printed by `status`.
pub fn render_status(state: &LedgerState, last: usize) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{} iterations, {} questions tracked",
        state.iterations.len(),
        state.question_registry.len()
    );
    let skip = state.iterations.len().saturating_sub(last);
    for it in state.iterations.iter().skip(skip) {
        let _ = writeln!(
            out,
            "  #{:<4} {}  {:>6.2}% ({}/{})  {}",
            it.number,
            it.committed_at.format("%Y-%m-%d %H:%M"),
            it.overall.accuracy_pct,
            it.overall.correct,
            it.overall.tested,
            it.label
        );
    }
    for (kind, history) in &state.pipelines {
        let trend = history
            .trend
            .iter()
            .rev()
            .take(last)
            .rev()
            .map(|p| format!("{:.1}", p.accuracy_pct))
            .collect::<Vec<_>>()
            .join(" -> ");
        let timeouts = history
            .error_counters
            .get(&ErrorKind::Timeout)
            .copied()
            .unwrap_or(0);
        let _ = writeln!(
            out,
            "  {:<14} {}  (lifetime {}/{}, timeouts {})",
            kind.as_str(),
            trend,
            history.total_correct,
            history.total_tested,
            timeouts
        );
    }
    out
}
