//! Scheduler behaviour against a scripted answering service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use evalgate_core::client::{into_attempt, Classified};
use evalgate_core::scheduler::ABANDONED_MESSAGE;
use evalgate_core::{
    AnswerService, CancelHandle, CancelToken, ErrorKind, ExecutionAttempt, PipelineEndpoint,
    PipelineKind, Question, RetryPolicy, Scheduler, SchedulerOptions, StopReason,
};

#[derive(Clone, Copy)]
enum Step {
    Answer(&'static str),
    Fail(ErrorKind),
    Hang,
}

struct ScriptedService {
    delay: Duration,
    script: Mutex<HashMap<String, VecDeque<Step>>>,
    calls: Mutex<Vec<(String, u32)>>,
    in_flight: Mutex<Vec<PipelineKind>>,
    max_in_flight: AtomicUsize,
    mixed_pipelines: AtomicBool,
}

impl ScriptedService {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            script: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            in_flight: Mutex::new(Vec::new()),
            max_in_flight: AtomicUsize::new(0),
            mixed_pipelines: AtomicBool::new(false),
        }
    }

    fn script(self, question_id: &str, steps: Vec<Step>) -> Self {
        self.script
            .lock()
            .unwrap()
            .insert(question_id.to_string(), steps.into());
        self
    }

    fn calls_for(&self, question_id: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == question_id)
            .count()
    }

    fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn enter(&self, kind: PipelineKind) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if in_flight.iter().any(|k| *k != kind) {
            self.mixed_pipelines.store(true, Ordering::SeqCst);
        }
        in_flight.push(kind);
        self.max_in_flight.fetch_max(in_flight.len(), Ordering::SeqCst);
    }

    fn leave(&self, kind: PipelineKind) {
        let mut in_flight = self.in_flight.lock().unwrap();
        if let Some(pos) = in_flight.iter().position(|k| *k == kind) {
            in_flight.remove(pos);
        }
    }
}

#[async_trait]
impl AnswerService for ScriptedService {
    async fn call(
        &self,
        endpoint: &PipelineEndpoint,
        question: &Question,
        iteration_id: &str,
        attempt: u32,
    ) -> ExecutionAttempt {
        self.calls
            .lock()
            .unwrap()
            .push((question.id.clone(), attempt));
        let step = self
            .script
            .lock()
            .unwrap()
            .get_mut(&question.id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Answer("ok"));

        self.enter(endpoint.kind);
        let started_at = Utc::now();
        match step {
            Step::Hang => tokio::time::sleep(Duration::from_secs(3600)).await,
            _ => tokio::time::sleep(self.delay).await,
        }
        self.leave(endpoint.kind);

        let classified = match step {
            Step::Answer(text) => Classified {
                answer: Some(text.to_string()),
                ..Classified::default()
            },
            Step::Fail(kind) => Classified {
                error_kind: Some(kind),
                error_message: Some(kind.as_str().to_string()),
                ..Classified::default()
            },
            Step::Hang => Classified::default(),
        };
        into_attempt(
            question,
            endpoint.kind,
            iteration_id,
            attempt,
            started_at,
            self.delay.as_millis() as u64,
            Some(200),
            classified,
        )
    }
}

fn questions(kind: PipelineKind, n: usize) -> Vec<Question> {
    (1..=n)
        .map(|i| Question::new(format!("q{i}"), format!("question {i}"), "", kind))
        .collect()
}

fn endpoint(kind: PipelineKind) -> PipelineEndpoint {
    PipelineEndpoint::new(kind, "http://pipeline.invalid").with_max_concurrency(8)
}

fn policy() -> RetryPolicy {
    RetryPolicy::default()
        .with_base_delay(Duration::from_millis(10))
        .with_jitter(false)
}

fn options(concurrency: usize) -> SchedulerOptions {
    SchedulerOptions::default()
        .with_concurrency(concurrency)
        .with_iteration_id("iter-test")
}

#[tokio::test(start_paused = true)]
async fn every_question_yields_exactly_one_terminal_attempt() {
    let service = Arc::new(ScriptedService::new(Duration::from_millis(50)));
    let scheduler = Scheduler::new(service.clone(), policy());

    let stream = scheduler.run(
        questions(PipelineKind::Graph, 7),
        endpoint(PipelineKind::Graph),
        options(3),
        CancelToken::never(),
    );
    let (attempts, report) = stream.collect().await;

    assert_eq!(attempts.len(), 7);
    let ids: HashSet<_> = attempts.iter().map(|a| a.question_id.clone()).collect();
    assert_eq!(ids.len(), 7);
    assert!(attempts.iter().all(|a| a.iteration_id == "iter-test"));
    assert_eq!(report.dispatched, 7);
    assert_eq!(report.completed, 7);
    assert!(report.skipped.is_empty());
    assert_eq!(report.stop_reason, None);
    assert!(service.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test(start_paused = true)]
async fn endpoint_concurrency_caps_requested_concurrency() {
    let service = Arc::new(ScriptedService::new(Duration::from_millis(20)));
    let scheduler = Scheduler::new(service.clone(), policy());

    let stream = scheduler.run(
        questions(PipelineKind::Standard, 6),
        endpoint(PipelineKind::Standard).with_max_concurrency(1),
        options(4),
        CancelToken::never(),
    );
    let (attempts, _) = stream.collect().await;

    assert_eq!(attempts.len(), 6);
    assert_eq!(service.max_in_flight.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn deterministic_failures_are_not_retried() {
    let service = Arc::new(
        ScriptedService::new(Duration::from_millis(5))
            .script("q1", vec![Step::Fail(ErrorKind::Http4xx)])
            .script("q2", vec![Step::Fail(ErrorKind::Malformed)])
            .script("q3", vec![Step::Fail(ErrorKind::EmptyResponse)]),
    );
    let scheduler = Scheduler::new(service.clone(), policy());

    let (attempts, report) = scheduler
        .run(
            questions(PipelineKind::Graph, 3),
            endpoint(PipelineKind::Graph),
            options(2),
            CancelToken::never(),
        )
        .collect()
        .await;

    assert_eq!(service.total_calls(), 3);
    assert_eq!(report.retries, 0);
    assert!(attempts.iter().all(|a| a.attempt == 1 && a.error_kind.is_some()));
}

#[tokio::test(start_paused = true)]
async fn transient_failures_retry_until_max_attempts() {
    let service = Arc::new(
        ScriptedService::new(Duration::from_millis(5))
            .script(
                "q1",
                vec![
                    Step::Fail(ErrorKind::Http5xx),
                    Step::Fail(ErrorKind::Http5xx),
                    Step::Fail(ErrorKind::Http5xx),
                    Step::Answer("never reached"),
                ],
            )
            .script(
                "q2",
                vec![Step::Fail(ErrorKind::Timeout), Step::Answer("42")],
            ),
    );
    let scheduler = Scheduler::new(service.clone(), policy().with_max_attempts(3));

    let (attempts, report) = scheduler
        .run(
            questions(PipelineKind::Quantitative, 2),
            endpoint(PipelineKind::Quantitative),
            options(2),
            CancelToken::never(),
        )
        .collect()
        .await;

    assert_eq!(attempts.len(), 2);
    let q1 = attempts.iter().find(|a| a.question_id == "q1").unwrap();
    assert_eq!(q1.attempt, 3);
    assert_eq!(q1.error_kind, Some(ErrorKind::Http5xx));
    assert_eq!(service.calls_for("q1"), 3);

    let q2 = attempts.iter().find(|a| a.question_id == "q2").unwrap();
    assert_eq!(q2.attempt, 2);
    assert_eq!(q2.raw_response.as_deref(), Some("42"));
    assert_eq!(service.calls_for("q2"), 2);

    assert_eq!(report.retries, 3);
}

#[tokio::test(start_paused = true)]
async fn runs_on_one_scheduler_never_overlap() {
    let service = Arc::new(ScriptedService::new(Duration::from_millis(30)));
    let scheduler = Scheduler::new(service.clone(), policy());

    let graph = scheduler.run(
        questions(PipelineKind::Graph, 4),
        endpoint(PipelineKind::Graph),
        options(2),
        CancelToken::never(),
    );
    let standard = scheduler.run(
        questions(PipelineKind::Standard, 4),
        endpoint(PipelineKind::Standard),
        options(2),
        CancelToken::never(),
    );

    let ((graph_attempts, _), (standard_attempts, _)) =
        tokio::join!(graph.collect(), standard.collect());

    assert_eq!(graph_attempts.len(), 4);
    assert_eq!(standard_attempts.len(), 4);
    assert!(!service.mixed_pipelines.load(Ordering::SeqCst));
    assert!(service.max_in_flight.load(Ordering::SeqCst) <= 2);
}

#[tokio::test(start_paused = true)]
async fn cancellation_stops_dispatch_and_lists_skipped_questions() {
    let service = Arc::new(ScriptedService::new(Duration::from_millis(100)));
    let scheduler = Scheduler::new(service.clone(), policy());
    let cancel = CancelHandle::new();

    let stream = scheduler.run(
        questions(PipelineKind::Graph, 4),
        endpoint(PipelineKind::Graph),
        options(1),
        cancel.token(),
    );
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        trigger.cancel();
    });

    let (attempts, report) = stream.collect().await;

    // q1 finished before the signal, q2 was in flight and finished within grace.
    assert_eq!(attempts.len(), 2);
    assert!(attempts.iter().all(|a| a.error_kind.is_none()));
    assert_eq!(report.skipped, vec!["q3".to_string(), "q4".to_string()]);
    assert_eq!(report.stop_reason, Some(StopReason::Cancelled));
    assert!(report.cancelled());
    assert_eq!(service.total_calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn deadline_stops_dispatch() {
    let service = Arc::new(ScriptedService::new(Duration::from_millis(100)));
    let scheduler = Scheduler::new(service.clone(), policy());

    let (attempts, report) = scheduler
        .run(
            questions(PipelineKind::Standard, 4),
            endpoint(PipelineKind::Standard),
            options(1).with_deadline(Some(Duration::from_millis(150))),
            CancelToken::never(),
        )
        .collect()
        .await;

    assert_eq!(attempts.len(), 2);
    assert_eq!(report.skipped.len(), 2);
    assert_eq!(report.stop_reason, Some(StopReason::DeadlineExceeded));
}

#[tokio::test(start_paused = true)]
async fn calls_outliving_the_grace_period_are_abandoned_as_timeouts() {
    let service = Arc::new(
        ScriptedService::new(Duration::from_millis(5)).script("q1", vec![Step::Hang]),
    );
    let scheduler = Scheduler::new(service.clone(), policy());
    let cancel = CancelHandle::new();

    let stream = scheduler.run(
        questions(PipelineKind::Orchestrator, 1),
        endpoint(PipelineKind::Orchestrator),
        options(1).with_grace_period(Duration::from_secs(1)),
        cancel.token(),
    );
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        trigger.cancel();
    });

    let (attempts, report) = stream.collect().await;

    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].error_kind, Some(ErrorKind::Timeout));
    assert_eq!(attempts[0].error_message.as_deref(), Some(ABANDONED_MESSAGE));
    assert_eq!(report.abandoned, 1);
    assert_eq!(report.completed, 1);
    // Abandoned calls are never retried.
    assert_eq!(service.total_calls(), 1);
}
