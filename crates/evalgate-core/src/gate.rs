//! Phase gate evaluator.
//!
//! Evaluates the committed ledger against a declarative [`GateTable`] to
//! decide whether a rollout phase may advance. Gate status is always
//! recomputed from the ledger; it is never stored.
//!
//! Phases are ordered. A phase is only evaluated once every earlier phase
//! passes.

use std::collections::BTreeMap;
use std::fmt;

use evalgate_ledger::{LedgerState, PipelineKind, PipelineSummary};
use serde::{Deserialize, Serialize};

use crate::obs;

// ---------------------------------------------------------------------------
// Gate table
// ---------------------------------------------------------------------------

/// Thresholds one pipeline must meet for a phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineThreshold {
    /// Minimum accuracy, in percent.
    pub min_accuracy: f64,
    pub min_questions: u32,
    /// Maximum error rate, in percent. Only enforced under `--strict`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_error_pct: Option<f64>,
}

/// Consecutive-iteration stability requirement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StabilityRule {
    /// Number of most recent iterations that must exist per gated pipeline.
    pub window: usize,
    /// Largest accuracy drop (percentage points) tolerated between consecutive iterations.
    pub regression_tolerance_pp: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PhaseGate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub pipelines: BTreeMap<PipelineKind, PipelineThreshold>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stability: Option<StabilityRule>,
}

/// Ordered list of phases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GateTable {
    #[serde(default)]
    pub phases: Vec<PhaseGate>,
}

impl GateTable {
    pub fn phase(&self, name: &str) -> Option<&PhaseGate> {
        self.phases.iter().find(|p| p.name == name)
    }
}

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateStatus {
    NotStarted,
    InProgress,
    GateFailed,
    GatePassed,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GateStatus::NotStarted => "NOT_STARTED",
            GateStatus::InProgress => "IN_PROGRESS",
            GateStatus::GateFailed => "GATE_FAILED",
            GateStatus::GatePassed => "GATE_PASSED",
        }
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical tag of an unmet condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Condition {
    #[serde(rename = "accuracy_pct < min_accuracy")]
    AccuracyBelowMin,
    #[serde(rename = "tested < min_questions")]
    TestedBelowMin,
    #[serde(rename = "error_pct > max_error_pct")]
    ErrorRateAboveMax,
    #[serde(rename = "iterations < stability_window")]
    InsufficientHistory,
    #[serde(rename = "regression > regression_tolerance_pp")]
    RegressionExceeded,
    #[serde(rename = "previous phase not passed")]
    PreviousPhaseNotPassed,
}

impl Condition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::AccuracyBelowMin => "accuracy_pct < min_accuracy",
            Condition::TestedBelowMin => "tested < min_questions",
            Condition::ErrorRateAboveMax => "error_pct > max_error_pct",
            Condition::InsufficientHistory => "iterations < stability_window",
            Condition::RegressionExceeded => "regression > regression_tolerance_pp",
            Condition::PreviousPhaseNotPassed => "previous phase not passed",
        }
    }

    /// Volume and history conditions resolve by running more; the rest are quality failures.
    pub fn is_volume(&self) -> bool {
        matches!(
            self,
            Condition::TestedBelowMin | Condition::InsufficientHistory
        )
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnmetCondition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineKind>,
    pub condition: Condition,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineVerdict {
    pub pipeline: PipelineKind,
    /// Iteration the figures come from, `None` when the pipeline has no data.
    pub iteration: Option<u64>,
    pub tested: u32,
    pub accuracy_pct: f64,
    pub error_pct: f64,
    pub min_accuracy: f64,
    pub min_questions: u32,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    pub phase: String,
    pub status: GateStatus,
    pub pipeline_verdicts: BTreeMap<PipelineKind, PipelineVerdict>,
    pub overall_pass: bool,
    pub unmet_conditions: Vec<UnmetCondition>,
    pub warnings: Vec<String>,
}

impl GateResult {
    /// Whether `condition` is among the unmet conditions.
    pub fn has_unmet(&self, condition: Condition) -> bool {
        self.unmet_conditions.iter().any(|u| u.condition == condition)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GateOptions {
    /// Treat `max_error_pct` violations as unmet conditions instead of warnings.
    pub strict: bool,
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate one phase against the ledger, ignoring earlier phases.
pub fn evaluate(state: &LedgerState, phase: &PhaseGate, options: GateOptions) -> GateResult {
    let mut verdicts = BTreeMap::new();
    let mut unmet = Vec::new();
    let mut warnings = Vec::new();
    let mut any_data = false;

    for (kind, threshold) in &phase.pipelines {
        let latest = state.latest_summary(*kind);
        any_data |= latest.map(|(_, s)| s.tested > 0).unwrap_or(false);
        let (iteration, summary) = match latest {
            Some((it, s)) => (Some(it.number), s.clone()),
            None => (None, PipelineSummary::default()),
        };

        let mut passed = true;
        if summary.accuracy_pct < threshold.min_accuracy {
            passed = false;
            unmet.push(UnmetCondition {
                pipeline: Some(*kind),
                condition: Condition::AccuracyBelowMin,
                detail: format!(
                    "{kind}: accuracy {:.2}% is below {:.2}%",
                    summary.accuracy_pct, threshold.min_accuracy
                ),
            });
        }
        if summary.tested < threshold.min_questions {
            passed = false;
            unmet.push(UnmetCondition {
                pipeline: Some(*kind),
                condition: Condition::TestedBelowMin,
                detail: format!(
                    "{kind}: {} questions tested, {} required",
                    summary.tested, threshold.min_questions
                ),
            });
        }

        let error_pct = summary.error_pct();
        if let Some(max) = threshold.max_error_pct {
            if error_pct > max {
                let detail = format!("{kind}: error rate {error_pct:.2}% exceeds {max:.2}%");
                if options.strict {
                    passed = false;
                    unmet.push(UnmetCondition {
                        pipeline: Some(*kind),
                        condition: Condition::ErrorRateAboveMax,
                        detail,
                    });
                } else {
                    warnings.push(detail);
                }
            }
        }

        verdicts.insert(
            *kind,
            PipelineVerdict {
                pipeline: *kind,
                iteration,
                tested: summary.tested,
                accuracy_pct: summary.accuracy_pct,
                error_pct,
                min_accuracy: threshold.min_accuracy,
                min_questions: threshold.min_questions,
                passed,
            },
        );
    }

    if let Some(rule) = &phase.stability {
        for kind in phase.pipelines.keys() {
            unmet.extend(check_stability(state, *kind, rule));
        }
    }

    let overall_pass = unmet.is_empty();
    let status = if overall_pass {
        GateStatus::GatePassed
    } else if !any_data {
        GateStatus::NotStarted
    } else if unmet.iter().any(|u| u.condition.is_volume()) {
        GateStatus::InProgress
    } else {
        GateStatus::GateFailed
    };

    obs::emit_gate_evaluated(&phase.name, status.as_str(), unmet.len(), overall_pass);

    GateResult {
        phase: phase.name.clone(),
        status,
        pipeline_verdicts: verdicts,
        overall_pass,
        unmet_conditions: unmet,
        warnings,
    }
}

fn check_stability(
    state: &LedgerState,
    kind: PipelineKind,
    rule: &StabilityRule,
) -> Vec<UnmetCondition> {
    let history = state.summaries(kind);
    if history.len() < rule.window {
        return vec![UnmetCondition {
            pipeline: Some(kind),
            condition: Condition::InsufficientHistory,
            detail: format!(
                "{kind}: {} iterations recorded, stability window is {}",
                history.len(),
                rule.window
            ),
        }];
    }

    let recent = &history[history.len() - rule.window..];
    recent
        .windows(2)
        .filter_map(|pair| {
            let (prev_no, prev) = pair[0];
            let (next_no, next) = pair[1];
            let drop = prev.accuracy_pct - next.accuracy_pct;
            (drop > rule.regression_tolerance_pp).then(|| UnmetCondition {
                pipeline: Some(kind),
                condition: Condition::RegressionExceeded,
                detail: format!(
                    "{kind}: accuracy fell {drop:.2}pp from iteration {prev_no} to {next_no} (tolerance {:.2}pp)",
                    rule.regression_tolerance_pp
                ),
            })
        })
        .collect()
}

/// Evaluate every phase in order. A phase after a non-passing one is
/// reported `NOT_STARTED` without being evaluated.
pub fn evaluate_phases(
    state: &LedgerState,
    table: &GateTable,
    options: GateOptions,
) -> Vec<GateResult> {
    let mut results = Vec::with_capacity(table.phases.len());
    let mut blocked_by: Option<String> = None;

    for phase in &table.phases {
        let result = match &blocked_by {
            Some(previous) => GateResult {
                phase: phase.name.clone(),
                status: GateStatus::NotStarted,
                pipeline_verdicts: BTreeMap::new(),
                overall_pass: false,
                unmet_conditions: vec![UnmetCondition {
                    pipeline: None,
                    condition: Condition::PreviousPhaseNotPassed,
                    detail: format!("phase {previous} has not passed"),
                }],
                warnings: Vec::new(),
            },
            None => evaluate(state, phase, options),
        };
        if !result.overall_pass && blocked_by.is_none() {
            blocked_by = Some(phase.name.clone());
        }
        results.push(result);
    }
    results
}

/// The first phase that has not passed, or the last phase when all pass.
pub fn active_phase(results: &[GateResult]) -> Option<&GateResult> {
    results
        .iter()
        .find(|r| !r.overall_pass)
        .or_else(|| results.last())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use evalgate_ledger::{Iteration, OverallSummary};

    fn summary(tested: u32, correct: u32, errors: u32) -> PipelineSummary {
        PipelineSummary {
            tested,
            correct,
            errors,
            accuracy_pct: if tested == 0 {
                0.0
            } else {
                evalgate_ledger::schema::round2(f64::from(correct) * 100.0 / f64::from(tested))
            },
            avg_latency_ms: 100.0,
            errors_by_kind: BTreeMap::new(),
        }
    }

    fn push(state: &mut LedgerState, pipelines: Vec<(PipelineKind, PipelineSummary)>) {
        let number = state.next_iteration_number();
        state.iterations.push(Iteration {
            number,
            id: format!("it-{number}"),
            label: String::new(),
            committed_at: Utc::now(),
            corpus_digest: None,
            pipelines: pipelines.into_iter().collect(),
            overall: OverallSummary::default(),
            results: Vec::new(),
        });
        state.meta.last_iteration = number;
    }

    fn phase(pipelines: Vec<(PipelineKind, f64, u32)>) -> PhaseGate {
        PhaseGate {
            name: "phase-1".to_string(),
            description: None,
            pipelines: pipelines
                .into_iter()
                .map(|(k, acc, n)| {
                    (
                        k,
                        PipelineThreshold {
                            min_accuracy: acc,
                            min_questions: n,
                            max_error_pct: None,
                        },
                    )
                })
                .collect(),
            stability: None,
        }
    }

    #[test]
    fn test_empty_ledger_is_not_started() {
        let state = LedgerState::empty(Utc::now());
        let result = evaluate(
            &state,
            &phase(vec![(PipelineKind::Graph, 70.0, 10)]),
            GateOptions::default(),
        );
        assert_eq!(result.status, GateStatus::NotStarted);
        assert!(!result.overall_pass);
        assert!(result.has_unmet(Condition::TestedBelowMin));
    }

    #[test]
    fn test_quality_failure_with_volume_met() {
        let mut state = LedgerState::empty(Utc::now());
        push(&mut state, vec![(PipelineKind::Graph, summary(20, 10, 0))]);
        let result = evaluate(
            &state,
            &phase(vec![(PipelineKind::Graph, 70.0, 10)]),
            GateOptions::default(),
        );
        assert_eq!(result.status, GateStatus::GateFailed);
        assert!(result.has_unmet(Condition::AccuracyBelowMin));
        assert!(!result.has_unmet(Condition::TestedBelowMin));
    }

    #[test]
    fn test_latest_iteration_containing_pipeline_is_used() {
        let mut state = LedgerState::empty(Utc::now());
        push(&mut state, vec![(PipelineKind::Graph, summary(10, 9, 0))]);
        push(&mut state, vec![(PipelineKind::Standard, summary(10, 1, 0))]);
        let result = evaluate(
            &state,
            &phase(vec![(PipelineKind::Graph, 70.0, 10)]),
            GateOptions::default(),
        );
        assert!(result.overall_pass);
        assert_eq!(
            result.pipeline_verdicts[&PipelineKind::Graph].iteration,
            Some(1)
        );
    }

    #[test]
    fn test_condition_wire_names() {
        let json = serde_json::to_string(&Condition::TestedBelowMin).unwrap();
        assert_eq!(json, "\"tested < min_questions\"");
        let json = serde_json::to_string(&GateStatus::GatePassed).unwrap();
        assert_eq!(json, "\"GATE_PASSED\"");
    }

    #[test]
    fn test_active_phase_is_last_when_all_pass() {
        let mut state = LedgerState::empty(Utc::now());
        push(&mut state, vec![(PipelineKind::Graph, summary(10, 10, 0))]);
        let mut second = phase(vec![(PipelineKind::Graph, 50.0, 5)]);
        second.name = "phase-2".to_string();
        let table = GateTable {
            phases: vec![phase(vec![(PipelineKind::Graph, 70.0, 10)]), second],
        };
        let results = evaluate_phases(&state, &table, GateOptions::default());
        assert!(results.iter().all(|r| r.overall_pass));
        assert_eq!(active_phase(&results).unwrap().phase, "phase-2");
        assert!(active_phase(&[]).is_none());
    }
}
