//! Pipeline client.
//!
//! Sends one question to one pipeline and classifies the outcome. Failures
//! never escape as errors: every call becomes an [`ExecutionAttempt`] tagged
//! with exactly one outcome. Retries are the scheduler's job.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use evalgate_ledger::{ErrorKind, ExecutionAttempt, PipelineKind, Source};
use serde_json::{Map, Value};
use tracing::debug;

use crate::domain::{PipelineEndpoint, Question, ANSWER_FIELDS};

/// Header some pipelines use to expose their execution id.
pub const EXECUTION_ID_HEADER: &str = "x-execution-id";

const ERROR_BODY_PREVIEW: usize = 200;

/// Seam between the scheduler and the answering services.
#[async_trait]
pub trait AnswerService: Send + Sync {
    /// Issue a single call. Must not retry and must not fail.
    async fn call(
        &self,
        endpoint: &PipelineEndpoint,
        question: &Question,
        iteration_id: &str,
        attempt: u32,
    ) -> ExecutionAttempt;
}

/// Classified body of a finished HTTP exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classified {
    pub answer: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub execution_id: Option<String>,
    pub sources: Vec<Source>,
    pub confidence: Option<f64>,
}

impl Classified {
    fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error_kind: Some(kind),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Response classification
// ---------------------------------------------------------------------------

/// Classify a completed HTTP response.
pub fn classify_response(
    status: u16,
    header_execution_id: Option<String>,
    body: &[u8],
) -> Classified {
    let mut classified = match status {
        200..=299 => classify_body(body),
        400..=499 => Classified::failure(ErrorKind::Http4xx, http_message(status, body)),
        500..=599 => Classified::failure(ErrorKind::Http5xx, http_message(status, body)),
        _ => Classified::failure(ErrorKind::Malformed, http_message(status, body)),
    };
    if classified.execution_id.is_none() {
        classified.execution_id = header_execution_id;
    }
    classified
}

fn http_message(status: u16, body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let preview: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
    if preview.trim().is_empty() {
        format!("HTTP {status}")
    } else {
        format!("HTTP {status}: {}", preview.trim())
    }
}

fn classify_body(body: &[u8]) -> Classified {
    if body.iter().all(|b| b.is_ascii_whitespace()) {
        return Classified::failure(ErrorKind::EmptyResponse, "empty response body");
    }

    let value: Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return Classified::failure(ErrorKind::Malformed, format!("body is not JSON: {e}")),
    };

    match value {
        Value::Null => Classified::failure(ErrorKind::EmptyResponse, "null response body"),
        Value::String(s) => answer_or_empty(Some(s), Classified::default()),
        Value::Array(items) => match items.into_iter().next() {
            None => Classified::failure(ErrorKind::EmptyResponse, "empty response array"),
            Some(Value::Object(obj)) => classify_object(&obj),
            Some(Value::String(s)) => answer_or_empty(Some(s), Classified::default()),
            Some(_) => Classified::failure(ErrorKind::Malformed, "unexpected array element"),
        },
        Value::Object(obj) => classify_object(&obj),
        _ => Classified::failure(ErrorKind::Malformed, "unexpected JSON scalar"),
    }
}

fn classify_object(obj: &Map<String, Value>) -> Classified {
    let mut present = false;
    let mut answer = None;

    for field in ANSWER_FIELDS {
        match obj.get(*field) {
            Some(Value::String(s)) => {
                present = true;
                if !s.trim().is_empty() {
                    answer = Some(s.clone());
                    break;
                }
            }
            Some(Value::Number(n)) => {
                answer = Some(n.to_string());
                break;
            }
            Some(_) => present = true,
            None => {}
        }
    }

    let base = Classified {
        execution_id: ["execution_id", "executionId"]
            .iter()
            .find_map(|k| match obj.get(*k) {
                Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
                Some(Value::Number(n)) => Some(n.to_string()),
                _ => None,
            }),
        sources: extract_sources(obj),
        confidence: obj.get("confidence").and_then(Value::as_f64),
        ..Classified::default()
    };

    if answer.is_none() && !present {
        return Classified {
            error_kind: Some(ErrorKind::Malformed),
            error_message: Some(format!("no answer field (expected one of {})", ANSWER_FIELDS.join(", "))),
            ..base
        };
    }
    answer_or_empty(answer, base)
}

fn answer_or_empty(answer: Option<String>, base: Classified) -> Classified {
    match answer {
        Some(text) if !text.trim().is_empty() => Classified {
            answer: Some(text),
            ..base
        },
        _ => Classified {
            error_kind: Some(ErrorKind::EmptyResponse),
            error_message: Some("answer field is empty".to_string()),
            ..base
        },
    }
}

fn extract_sources(obj: &Map<String, Value>) -> Vec<Source> {
    let Some(items) = ["sources", "context", "documents"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
    else {
        return Vec::new();
    };

    items
        .iter()
        .filter_map(|item| match item {
            Value::Object(o) => Some(Source {
                title: o.get("title").and_then(Value::as_str).map(str::to_string),
                content: o
                    .get("content")
                    .or_else(|| o.get("text"))
                    .and_then(Value::as_str)
                    .map(str::to_string),
                score: o.get("score").and_then(Value::as_f64),
            }),
            Value::String(s) => Some(Source {
                content: Some(s.clone()),
                ..Source::default()
            }),
            _ => None,
        })
        .collect()
}

// ---------------------------------------------------------------------------
// HttpPipelineClient
// ---------------------------------------------------------------------------

/// Production [`AnswerService`] over HTTP.
#[derive(Debug, Clone)]
pub struct HttpPipelineClient {
    http: reqwest::Client,
}

impl HttpPipelineClient {
    pub fn new() -> reqwest::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("evalgate/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }

    async fn exchange(
        &self,
        endpoint: &PipelineEndpoint,
        question: &Question,
    ) -> Result<(u16, Option<String>, Vec<u8>), reqwest::Error> {
        let response = self
            .http
            .post(&endpoint.url)
            .json(&endpoint.request(&question.text))
            .send()
            .await?;
        let status = response.status().as_u16();
        let header_id = response
            .headers()
            .get(EXECUTION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?;
        Ok((status, header_id, body.to_vec()))
    }
}

fn transport_failure(err: &reqwest::Error) -> Classified {
    if err.is_timeout() {
        Classified::failure(ErrorKind::Timeout, format!("request timed out: {err}"))
    } else {
        Classified::failure(ErrorKind::Network, format!("transport error: {err}"))
    }
}

#[async_trait]
impl AnswerService for HttpPipelineClient {
    async fn call(
        &self,
        endpoint: &PipelineEndpoint,
        question: &Question,
        iteration_id: &str,
        attempt: u32,
    ) -> ExecutionAttempt {
        let started_at = Utc::now();
        let start = Instant::now();

        let (classified, http_status) =
            match tokio::time::timeout(endpoint.timeout, self.exchange(endpoint, question)).await {
                Ok(Ok((status, header_id, body))) => (
                    classify_response(status, header_id, &body),
                    Some(status),
                ),
                Ok(Err(err)) => (transport_failure(&err), None),
                Err(_) => (
                    Classified::failure(
                        ErrorKind::Timeout,
                        format!("no complete response within {}", fmt_duration(endpoint.timeout)),
                    ),
                    None,
                ),
            };

        let latency_ms = start.elapsed().as_millis() as u64;
        debug!(
            pipeline = %endpoint.kind,
            question_id = %question.id,
            attempt,
            latency_ms,
            status = ?http_status,
            error_kind = ?classified.error_kind,
            "pipeline call finished"
        );

        into_attempt(question, endpoint.kind, iteration_id, attempt, started_at, latency_ms, http_status, classified)
    }
}

fn fmt_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Assemble an attempt record from a classified outcome.
#[allow(clippy::too_many_arguments)]
pub fn into_attempt(
    question: &Question,
    pipeline: PipelineKind,
    iteration_id: &str,
    attempt: u32,
    started_at: chrono::DateTime<Utc>,
    latency_ms: u64,
    http_status: Option<u16>,
    classified: Classified,
) -> ExecutionAttempt {
    ExecutionAttempt {
        question_id: question.id.clone(),
        pipeline,
        iteration_id: iteration_id.to_string(),
        attempt,
        started_at,
        latency_ms,
        raw_response: classified.answer,
        error_kind: classified.error_kind,
        error_message: classified.error_message,
        http_status,
        execution_id: classified.execution_id,
        sources: classified.sources,
        confidence: classified.confidence,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classify(status: u16, body: &str) -> Classified {
        classify_response(status, None, body.as_bytes())
    }

    #[test]
    fn test_every_answer_field_is_recognised() {
        for field in ANSWER_FIELDS {
            let mut obj = Map::new();
            obj.insert(field.to_string(), Value::from("Paris"));
            let c = classify(200, &Value::Object(obj).to_string());
            assert_eq!(c.answer.as_deref(), Some("Paris"), "field {field}");
            assert!(c.error_kind.is_none(), "field {field}");
        }
    }

    #[test]
    fn test_answer_priority_order() {
        let body = serde_json::json!({
            "output": "6",
            "interpretation": "5",
            "final_response": "4",
            "result": "3",
            "answer": "2",
            "response": "1",
        });
        let mut obj = body.as_object().cloned().unwrap();
        for expected in ["1", "2", "3", "4", "5", "6"] {
            let c = classify(200, &Value::Object(obj.clone()).to_string());
            assert_eq!(c.answer.as_deref(), Some(expected));
            let winner = ANSWER_FIELDS[expected.parse::<usize>().unwrap() - 1];
            obj.remove(winner);
        }
        assert_eq!(
            classify(200, &Value::Object(obj).to_string()).error_kind,
            Some(ErrorKind::Malformed)
        );
    }

    #[test]
    fn test_response_outranks_answer() {
        let c = classify(200, r#"{"answer": "B", "response": "A"}"#);
        assert_eq!(c.answer.as_deref(), Some("A"));
        let c = classify(200, r#"{"final_response": "Paris"}"#);
        assert_eq!(c.answer.as_deref(), Some("Paris"));
        assert!(c.error_kind.is_none());
    }

    #[test]
    fn test_empty_field_falls_through_to_next() {
        let body = r#"{"response": "  ", "final_response": "fallback"}"#;
        let c = classify(200, body);
        assert_eq!(c.answer.as_deref(), Some("fallback"));
        assert!(c.error_kind.is_none());
    }

    #[test]
    fn test_numeric_result_is_an_answer() {
        let c = classify(200, r#"{"result": 6745000000}"#);
        assert_eq!(c.answer.as_deref(), Some("6745000000"));
    }

    #[test]
    fn test_status_classes() {
        assert_eq!(
            classify(503, "busy").error_kind,
            Some(ErrorKind::Http5xx)
        );
        let c = classify(404, "");
        assert_eq!(c.error_kind, Some(ErrorKind::Http4xx));
        assert_eq!(c.error_message.as_deref(), Some("HTTP 404"));
        assert_eq!(
            classify(302, "").error_kind,
            Some(ErrorKind::Malformed)
        );
    }

    #[test]
    fn test_empty_and_malformed_bodies() {
        for body in ["", "   ", "null", "[]", r#"{"answer": ""}"#, r#"{"answer": null}"#, "\"\""] {
            assert_eq!(
                classify(200, body).error_kind,
                Some(ErrorKind::EmptyResponse),
                "body {body:?}"
            );
        }
        for body in ["<html>oops</html>", "42", r#"{"unrelated": 1}"#, "[1]"] {
            assert_eq!(
                classify(200, body).error_kind,
                Some(ErrorKind::Malformed),
                "body {body:?}"
            );
        }
    }

    #[test]
    fn test_array_and_string_bodies() {
        let c = classify(200, r#"[{"answer": "first"}, {"answer": "second"}]"#);
        assert_eq!(c.answer.as_deref(), Some("first"));
        let c = classify(200, r#""plain""#);
        assert_eq!(c.answer.as_deref(), Some("plain"));
    }

    #[test]
    fn test_sources_confidence_and_execution_id() {
        let body = r#"{
            "answer": "x",
            "executionId": "exec-9",
            "confidence": 0.82,
            "documents": [{"title": "Doc", "text": "body", "score": 0.5}, "raw chunk"]
        }"#;
        let c = classify(200, body);
        assert_eq!(c.execution_id.as_deref(), Some("exec-9"));
        assert_eq!(c.confidence, Some(0.82));
        assert_eq!(c.sources.len(), 2);
        assert_eq!(c.sources[0].content.as_deref(), Some("body"));
        assert_eq!(c.sources[1].content.as_deref(), Some("raw chunk"));
    }

    #[test]
    fn test_header_execution_id_used_when_body_lacks_one() {
        let c = classify_response(
            500,
            Some("hdr-1".to_string()),
            b"boom",
        );
        assert_eq!(c.execution_id.as_deref(), Some("hdr-1"));
    }
}
