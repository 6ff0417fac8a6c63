//! Bounded, cancellable dispatch of questions to one pipeline.
//!
//! A [`Scheduler`] owns the retry policy and a pipeline lease. Each
//! [`Scheduler::run`] spawns a driver task that first takes the lease, so two
//! runs never have calls in flight at the same time even when they target
//! different pipelines. Within a run, a semaphore caps in-flight calls.
//!
//! Every dispatched question yields exactly one terminal [`ExecutionAttempt`]
//! on the run's stream, in completion order. Questions never dispatched
//! because of cancellation are listed in [`RunReport::skipped`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use evalgate_ledger::{ErrorKind, ExecutionAttempt, PipelineKind};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{warn, Instrument};

use crate::client::{into_attempt, AnswerService, Classified};
use crate::domain::{PipelineEndpoint, Question};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::RetryPolicy;

pub const ABANDONED_MESSAGE: &str = "abandoned after cancellation grace period";

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Owner side of a cancellation signal. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn token(&self) -> CancelToken {
        CancelToken {
            rx: self.tx.subscribe(),
        }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Observer side of a cancellation signal.
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        CancelHandle::new().token()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled. Never resolves if the handle is dropped first.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|c| *c).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Why a run stopped dispatching early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    DeadlineExceeded,
}

/// Internal stop signal combining the external token and the run deadline.
#[derive(Clone)]
struct StopSignal {
    rx: watch::Receiver<Option<StopReason>>,
}

impl StopSignal {
    fn is_stopped(&self) -> bool {
        self.rx.borrow().is_some()
    }

    async fn stopped(&mut self) {
        if self.rx.wait_for(Option::is_some).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// ---------------------------------------------------------------------------
// Options and report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerOptions {
    /// Requested in-flight calls; also capped by the endpoint's `max_concurrency`.
    pub concurrency: usize,
    /// Time in-flight calls get to finish after cancellation.
    pub grace_period: Duration,
    /// Stop dispatching once this much time has passed since the run started.
    pub deadline: Option<Duration>,
    /// Evaluation run the attempts belong to.
    pub iteration_id: String,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            grace_period: Duration::from_secs(5),
            deadline: None,
            iteration_id: uuid::Uuid::new_v4().to_string(),
        }
    }
}

impl SchedulerOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_iteration_id(mut self, iteration_id: impl Into<String>) -> Self {
        self.iteration_id = iteration_id.into();
        self
    }
}

/// Bookkeeping for one finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub pipeline: PipelineKind,
    pub iteration_id: String,
    pub dispatched: usize,
    pub completed: usize,
    /// Question ids never dispatched.
    pub skipped: Vec<String>,
    pub retries: u64,
    pub abandoned: u64,
    pub stop_reason: Option<StopReason>,
    pub duration_ms: u64,
}

impl RunReport {
    fn empty(pipeline: PipelineKind, iteration_id: &str) -> Self {
        Self {
            pipeline,
            iteration_id: iteration_id.to_string(),
            dispatched: 0,
            completed: 0,
            skipped: Vec::new(),
            retries: 0,
            abandoned: 0,
            stop_reason: None,
            duration_ms: 0,
        }
    }

    pub fn cancelled(&self) -> bool {
        self.stop_reason.is_some()
    }
}

/// Stream of terminal attempts for one run.
pub struct RunStream {
    rx: mpsc::UnboundedReceiver<ExecutionAttempt>,
    driver: JoinHandle<RunReport>,
    pipeline: PipelineKind,
    iteration_id: String,
}

impl RunStream {
    /// Next terminal attempt in completion order, `None` once the run is done.
    pub async fn next(&mut self) -> Option<ExecutionAttempt> {
        self.rx.recv().await
    }

    /// Drain remaining attempts and return the run report.
    pub async fn finish(mut self) -> RunReport {
        while self.rx.recv().await.is_some() {}
        self.report().await
    }

    /// Drain every attempt and return them with the run report.
    pub async fn collect(mut self) -> (Vec<ExecutionAttempt>, RunReport) {
        let mut attempts = Vec::new();
        while let Some(attempt) = self.rx.recv().await {
            attempts.push(attempt);
        }
        let report = self.report().await;
        (attempts, report)
    }

    async fn report(self) -> RunReport {
        match self.driver.await {
            Ok(report) => report,
            Err(e) => {
                warn!(pipeline = %self.pipeline, error = %e, "scheduler driver task failed");
                RunReport::empty(self.pipeline, &self.iteration_id)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

pub struct Scheduler {
    client: Arc<dyn AnswerService>,
    policy: RetryPolicy,
    lease: Arc<Mutex<()>>,
}

impl Scheduler {
    pub fn new(client: Arc<dyn AnswerService>, policy: RetryPolicy) -> Self {
        Self {
            client,
            policy,
            lease: Arc::new(Mutex::new(())),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dispatch `questions` to `endpoint`. Returns immediately; the run starts
    /// once the pipeline lease is free.
    pub fn run(
        &self,
        questions: Vec<Question>,
        endpoint: PipelineEndpoint,
        options: SchedulerOptions,
        cancel: CancelToken,
    ) -> RunStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let pipeline = endpoint.kind;
        let iteration_id = options.iteration_id.clone();
        let span = obs::pipeline_span(&iteration_id, pipeline);

        let driver = tokio::spawn(
            drive(
                Arc::clone(&self.client),
                self.policy.clone(),
                Arc::clone(&self.lease),
                questions,
                endpoint,
                options,
                cancel,
                tx,
            )
            .instrument(span),
        );

        RunStream {
            rx,
            driver,
            pipeline,
            iteration_id,
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    client: Arc<dyn AnswerService>,
    policy: RetryPolicy,
    lease: Arc<Mutex<()>>,
    questions: Vec<Question>,
    endpoint: PipelineEndpoint,
    options: SchedulerOptions,
    cancel: CancelToken,
    tx: mpsc::UnboundedSender<ExecutionAttempt>,
) -> RunReport {
    let _lease = lease.lock_owned().await;

    let started = Instant::now();
    let pipeline = endpoint.kind;
    let concurrency = options.concurrency.min(endpoint.max_concurrency).max(1);
    obs::emit_run_started(pipeline, questions.len(), concurrency);

    let (stop_tx, stop_rx) = watch::channel::<Option<StopReason>>(None);
    let watcher = tokio::spawn(watch_stop(cancel, options.deadline, stop_tx));
    let mut stop = StopSignal { rx: stop_rx };

    let endpoint = Arc::new(endpoint);
    let iteration_id: Arc<str> = Arc::from(options.iteration_id.as_str());
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let retries = Arc::new(AtomicU64::new(0));
    let abandoned = Arc::new(AtomicU64::new(0));

    let mut report = RunReport::empty(pipeline, &options.iteration_id);
    let mut tasks = Vec::new();

    for question in questions {
        if stop.is_stopped() {
            report.skipped.push(question.id);
            continue;
        }
        let permit = tokio::select! {
            biased;
            _ = stop.stopped() => None,
            permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            report.skipped.push(question.id);
            continue;
        };

        let worker = Worker {
            client: Arc::clone(&client),
            endpoint: Arc::clone(&endpoint),
            policy: policy.clone(),
            iteration_id: Arc::clone(&iteration_id),
            stop: stop.clone(),
            grace: options.grace_period,
            retries: Arc::clone(&retries),
            abandoned: Arc::clone(&abandoned),
        };
        let tx = tx.clone();
        let fallback = question.clone();
        report.dispatched += 1;

        let task = tokio::spawn(async move {
            let _permit = permit;
            let attempt = worker.run_question(&question).await;
            let _ = tx.send(attempt);
        });
        tasks.push((task, fallback));
    }

    let (handles, fallbacks): (Vec<_>, Vec<Question>) = tasks.into_iter().unzip();
    for (joined, question) in join_all(handles).await.into_iter().zip(fallbacks) {
        match joined {
            Ok(()) => report.completed += 1,
            Err(e) => {
                // The question still needs its terminal attempt.
                warn!(question_id = %question.id, error = %e, "worker task failed");
                let classified = Classified {
                    error_kind: Some(ErrorKind::Malformed),
                    error_message: Some(format!("worker task failed: {e}")),
                    ..Classified::default()
                };
                let attempt =
                    into_attempt(&question, pipeline, &iteration_id, 1, Utc::now(), 0, None, classified);
                let _ = tx.send(attempt);
                report.completed += 1;
            }
        }
    }

    report.stop_reason = *stop.rx.borrow();
    watcher.abort();

    report.retries = retries.load(Ordering::Relaxed);
    report.abandoned = abandoned.load(Ordering::Relaxed);
    report.duration_ms = started.elapsed().as_millis() as u64;
    obs::emit_run_finished(
        pipeline,
        report.completed,
        report.skipped.len(),
        report.duration_ms,
        report.cancelled(),
    );
    report
}

async fn watch_stop(
    mut cancel: CancelToken,
    deadline: Option<Duration>,
    stop_tx: watch::Sender<Option<StopReason>>,
) {
    let reason = match deadline {
        Some(limit) => tokio::select! {
            _ = cancel.cancelled() => StopReason::Cancelled,
            _ = tokio::time::sleep(limit) => StopReason::DeadlineExceeded,
        },
        None => {
            cancel.cancelled().await;
            StopReason::Cancelled
        }
    };
    warn!(reason = ?reason, "run stopping, no further dispatch");
    stop_tx.send_replace(Some(reason));
}

struct Worker {
    client: Arc<dyn AnswerService>,
    endpoint: Arc<PipelineEndpoint>,
    policy: RetryPolicy,
    iteration_id: Arc<str>,
    stop: StopSignal,
    grace: Duration,
    retries: Arc<AtomicU64>,
    abandoned: Arc<AtomicU64>,
}

impl Worker {
    async fn run_question(mut self, question: &Question) -> ExecutionAttempt {
        let pipeline = self.endpoint.kind;
        let mut attempt_no = 1;

        loop {
            let attempt = self.call_once(question, attempt_no).await;
            obs::emit_attempt_completed(
                pipeline,
                &question.id,
                attempt_no,
                attempt.latency_ms,
                attempt.error_kind,
            );

            let Some(kind) = attempt.error_kind else {
                return attempt;
            };
            if kind.is_transient() {
                METRICS.inc_transient_failures();
            }
            if !self.policy.should_retry(kind, attempt_no) || self.stop.is_stopped() {
                return attempt;
            }

            let delay = self.policy.delay_for_attempt(attempt_no - 1);
            obs::emit_attempt_retrying(
                pipeline,
                &question.id,
                attempt_no,
                kind,
                delay.as_millis() as u64,
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                // A pending backoff is abandoned; the failure stands.
                _ = self.stop.stopped() => return attempt,
            }

            METRICS.inc_retries();
            self.retries.fetch_add(1, Ordering::Relaxed);
            attempt_no += 1;
        }
    }

    async fn call_once(&mut self, question: &Question, attempt_no: u32) -> ExecutionAttempt {
        METRICS.inc_calls();
        let started_at = Utc::now();
        let start = Instant::now();

        let call = self
            .client
            .call(&self.endpoint, question, &self.iteration_id, attempt_no);
        tokio::pin!(call);

        tokio::select! {
            attempt = &mut call => attempt,
            _ = self.stop.stopped() => {
                match tokio::time::timeout(self.grace, &mut call).await {
                    Ok(attempt) => attempt,
                    Err(_) => {
                        METRICS.inc_abandoned();
                        self.abandoned.fetch_add(1, Ordering::Relaxed);
                        obs::emit_attempt_abandoned(self.endpoint.kind, &question.id, attempt_no);
                        let classified = Classified {
                            error_kind: Some(ErrorKind::Timeout),
                            error_message: Some(ABANDONED_MESSAGE.to_string()),
                            ..Classified::default()
                        };
                        into_attempt(
                            question,
                            self.endpoint.kind,
                            &self.iteration_id,
                            attempt_no,
                            started_at,
                            start.elapsed().as_millis() as u64,
                            None,
                            classified,
                        )
                    }
                }
            }
        }
    }
}
