//! evalgate - evaluation harness and phase gate for answering pipelines
//!
//! ## Commands
//!
//! - `evaluate`: run the corpus against one or all pipelines and commit an iteration
//! - `gate-check`: evaluate rollout phases against the committed history
//! - `status`: show recent iterations and per-pipeline trends

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use evalgate_core::gate::active_phase;
use evalgate_core::{
    corpus, evaluate_phases, reporting, telemetry, CancelHandle, DiagnosticsExtractor,
    EngineConfig, EvalError, EvaluationRequest, Evaluator, GateOptions, HttpPipelineClient,
    Question, Scorer, METRICS,
};
use evalgate_ledger::{LedgerState, OverallSummary, PipelineHistory, PipelineKind, StateStore};
use serde::Serialize;
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "evalgate.toml";

#[derive(Parser)]
#[command(name = "evalgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evaluation harness and phase gate for answering pipelines", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines, and JSON output for gate-check and status
    #[arg(long, global = true)]
    json: bool,

    /// Engine configuration file (default: evalgate.toml, optional)
    #[arg(long, global = true, env = "EVALGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Ledger artifact path (overrides `evaluate.state` in the config)
    #[arg(long, global = true, env = "EVALGATE_STATE")]
    state: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the corpus against pipelines, score and commit one iteration
    Evaluate(EvaluateArgs),

    /// Evaluate rollout phases against the committed history
    GateCheck {
        /// Treat error-rate ceilings as unmet conditions
        #[arg(long)]
        strict: bool,

        /// Phase to decide on (default: the active phase)
        #[arg(long)]
        phase: Option<String>,
    },

    /// Show recent iterations and per-pipeline trends
    Status {
        /// Number of iterations to show
        #[arg(short, long, default_value = "5")]
        last: usize,
    },
}

#[derive(Args)]
struct EvaluateArgs {
    /// Pipeline to evaluate: standard, graph, quantitative, orchestrator or all
    #[arg(short, long, default_value = "all")]
    pipeline: String,

    /// Questions per pipeline (default: all)
    #[arg(short, long)]
    questions: Option<usize>,

    /// Iteration label
    #[arg(short, long, default_value = "manual run")]
    label: String,

    /// Question corpus (overrides `evaluate.corpus`)
    #[arg(long)]
    corpus: Option<PathBuf>,

    /// Archive the current ledger and start a fresh history
    #[arg(long)]
    reset: bool,

    /// In-flight calls per pipeline
    #[arg(long)]
    concurrency: Option<usize>,

    /// Stop dispatching after this many seconds
    #[arg(long)]
    deadline_secs: Option<u64>,

    /// Write a markdown report here
    #[arg(long)]
    report: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    telemetry::init_tracing(cli.json, telemetry::level_for(cli.verbose));

    let config = load_config(cli.config.as_deref())?;
    let state_path = cli
        .state
        .clone()
        .unwrap_or_else(|| config.evaluate.state.clone());

    let outcome = match cli.command {
        Commands::Evaluate(args) => cmd_evaluate(&config, &state_path, args).await,
        Commands::GateCheck { strict, phase } => {
            cmd_gate_check(&config, &state_path, strict, phase.as_deref(), cli.json).await
        }
        Commands::Status { last } => cmd_status(&state_path, last, cli.json).await,
    };

    METRICS.flush();
    Ok(ExitCode::from(outcome?))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    let (path, allow_missing) = match path {
        Some(p) => (p.to_path_buf(), false),
        None => (PathBuf::from(DEFAULT_CONFIG), true),
    };
    EngineConfig::load(&path, allow_missing)
        .with_context(|| format!("Failed to load config {:?}", path))
}

async fn open_store(path: &Path) -> Result<StateStore> {
    StateStore::open_path(path)
        .await
        .with_context(|| format!("Failed to open ledger {:?}", path))
}

/// Pipelines named by `--pipeline`; `all` means every pipeline with questions.
fn select_pipelines(name: &str, questions: &[Question]) -> Result<Vec<PipelineKind>> {
    if name.eq_ignore_ascii_case("all") {
        let kinds: Vec<PipelineKind> = corpus::by_pipeline(questions).into_keys().collect();
        if kinds.is_empty() {
            bail!("Corpus contains no questions");
        }
        return Ok(kinds);
    }
    let kind: PipelineKind = name.parse()?;
    if !questions.iter().any(|q| q.target_pipeline == kind) {
        bail!("Corpus contains no questions for pipeline {kind}");
    }
    Ok(vec![kind])
}

// ---------------------------------------------------------------------------
// evaluate
// ---------------------------------------------------------------------------

async fn cmd_evaluate(config: &EngineConfig, state_path: &Path, args: EvaluateArgs) -> Result<u8> {
    let store = open_store(state_path).await?;

    let corpus_path = args
        .corpus
        .clone()
        .unwrap_or_else(|| config.evaluate.corpus.clone());
    let filter = if args.pipeline.eq_ignore_ascii_case("all") {
        None
    } else {
        Some(args.pipeline.parse::<PipelineKind>()?)
    };
    let mut questions = corpus::load(&corpus_path, filter)
        .with_context(|| format!("Failed to load corpus {:?}", corpus_path))?;
    if let Some(n) = args.questions {
        questions = corpus::take_per_pipeline(questions, n);
    }
    let digest = corpus::digest(&corpus_path).ok();
    let pipelines = select_pipelines(&args.pipeline, &questions)?;

    let client = Arc::new(HttpPipelineClient::new().context("Failed to build HTTP client")?);
    let scorer = Scorer::new(&config.scoring).context("Invalid scoring.error_patterns")?;
    let mut evaluator = Evaluator::new(client, config.retry_policy())
        .with_scorer(scorer)
        .with_thresholds(
            config.evaluate.regression_tolerance_pp,
            config.evaluate.max_error_pct,
        )
        .with_diagnostics(diagnostics(config)?);
    for kind in &pipelines {
        evaluator = evaluator.with_endpoint(config.endpoint(*kind)?);
    }

    let mut options = config.scheduler_options();
    if let Some(concurrency) = args.concurrency {
        options = options.with_concurrency(concurrency);
    }
    if let Some(secs) = args.deadline_secs {
        options = options.with_deadline(Some(Duration::from_secs(secs)));
    }

    // Archive only once every input above has been validated.
    if args.reset {
        match store.reset().await.context("Failed to reset ledger")? {
            Some(archive) => println!("Archived previous ledger to {archive}"),
            None => println!("No previous ledger to archive"),
        }
    }

    let cancel = CancelHandle::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight calls");
            on_interrupt.cancel();
        }
    });

    info!(
        questions = questions.len(),
        pipelines = pipelines.len(),
        corpus = %corpus_path.display(),
        "starting evaluation"
    );
    let request = EvaluationRequest {
        label: args.label.clone(),
        questions,
        pipelines,
        corpus_digest: digest,
        options,
    };
    let outcome = evaluator
        .evaluate(&store, request, &cancel)
        .await
        .context("Evaluation failed")?;

    print!("{}", reporting::render_summary_table(&outcome));
    if let Some(report) = &args.report {
        reporting::write_evaluation_md(report, &outcome)?;
        println!("Report written to {:?}", report);
    }

    Ok(if outcome.passed() { 0 } else { 1 })
}

fn diagnostics(config: &EngineConfig) -> Result<Option<DiagnosticsExtractor>> {
    let Some(base_url) = config.diagnostics.base_url.clone() else {
        return Ok(None);
    };
    let extractor = DiagnosticsExtractor::new(base_url)
        .context("Failed to build diagnostics client")?
        .with_api_key(config.diagnostics.api_key())
        .with_preview_chars(config.diagnostics.preview_chars)
        .with_timeout(Duration::from_secs(config.diagnostics.timeout_secs));
    Ok(Some(extractor))
}

// ---------------------------------------------------------------------------
// gate-check
// ---------------------------------------------------------------------------

async fn cmd_gate_check(
    config: &EngineConfig,
    state_path: &Path,
    strict: bool,
    phase: Option<&str>,
    json: bool,
) -> Result<u8> {
    let table = config.gate_table();
    if table.phases.is_empty() {
        bail!("No phases configured; add [[phases]] to the config");
    }
    if let Some(name) = phase {
        if table.phase(name).is_none() {
            return Err(EvalError::UnknownPhase(name.to_string()).into());
        }
    }

    let store = open_store(state_path).await?;
    let state = store.read().await;
    let results = evaluate_phases(&state, &table, GateOptions { strict });

    let selected = match phase {
        Some(name) => results.iter().find(|r| r.phase == name),
        None => active_phase(&results),
    };
    let Some(selected) = selected else {
        bail!("No phase to evaluate");
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        print!(
            "{}",
            reporting::render_gate_results(&results, Some(selected.phase.as_str()))
        );
        println!("Selected phase {}: {}", selected.phase, selected.status);
    }

    Ok(if selected.overall_pass { 0 } else { 2 })
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct IterationView {
    number: u64,
    id: String,
    label: String,
    committed_at: DateTime<Utc>,
    overall: OverallSummary,
}

#[derive(Debug, Serialize)]
struct StatusView<'a> {
    iterations: Vec<IterationView>,
    questions_tracked: usize,
    pipelines: &'a BTreeMap<PipelineKind, PipelineHistory>,
}

fn status_view(state: &LedgerState, last: usize) -> StatusView<'_> {
    let skip = state.iterations.len().saturating_sub(last);
    StatusView {
        iterations: state
            .iterations
            .iter()
            .skip(skip)
            .map(|it| IterationView {
                number: it.number,
                id: it.id.clone(),
                label: it.label.clone(),
                committed_at: it.committed_at,
                overall: it.overall.clone(),
            })
            .collect(),
        questions_tracked: state.question_registry.len(),
        pipelines: &state.pipelines,
    }
}

async fn cmd_status(state_path: &Path, last: usize, json: bool) -> Result<u8> {
    let store = open_store(state_path).await?;
    let state = store.read().await;
    if json {
        println!("{}", serde_json::to_string_pretty(&status_view(&state, last))?);
    } else {
        print!("{}", reporting::render_status(&state, last));
    }
    Ok(0)
}
