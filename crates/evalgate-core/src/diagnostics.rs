//! Execution trace extraction for failed results.
//!
//! Fetches `GET {base_url}/executions/{id}?includeData=true` from the
//! workflow introspection service and flattens it into [`StepTrace`]s.
//! Failures are reported to the caller, who logs and carries on.

use std::time::Duration;

use evalgate_ledger::StepTrace;
use serde_json::Value;

use crate::domain::DiagnosticsError;

pub const DEFAULT_PREVIEW_CHARS: usize = 200;
pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Debug, Clone)]
pub struct DiagnosticsExtractor {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    preview_chars: usize,
    timeout: Duration,
}

impl DiagnosticsExtractor {
    pub fn new(base_url: impl Into<String>) -> reqwest::Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            preview_chars: DEFAULT_PREVIEW_CHARS,
            timeout: Duration::from_secs(10),
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|k| !k.is_empty());
        self
    }

    pub fn with_preview_chars(mut self, preview_chars: usize) -> Self {
        self.preview_chars = preview_chars;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn execution_url(&self, execution_id: &str) -> String {
        format!("{}/executions/{}?includeData=true", self.base_url, execution_id)
    }

    /// Fetch and normalize the step trace of one execution.
    pub async fn extract(&self, execution_id: &str) -> Result<Vec<StepTrace>, DiagnosticsError> {
        let mut request = self
            .http
            .get(self.execution_url(execution_id))
            .timeout(self.timeout);
        if let Some(key) = &self.api_key {
            request = request.header(API_KEY_HEADER, key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(DiagnosticsError::Status(status.as_u16()));
        }
        let body: Value = response.json().await?;
        parse_trace(&body, self.preview_chars)
    }
}

/// Normalize a trace payload: a top-level array, or an object with a
/// `steps` or `data` array.
pub fn parse_trace(body: &Value, preview_chars: usize) -> Result<Vec<StepTrace>, DiagnosticsError> {
    let steps = match body {
        Value::Array(items) => items,
        Value::Object(obj) => ["steps", "data"]
            .iter()
            .find_map(|k| obj.get(*k).and_then(Value::as_array))
            .ok_or_else(|| DiagnosticsError::Payload("no `steps` or `data` array".to_string()))?,
        _ => {
            return Err(DiagnosticsError::Payload(
                "expected an array or object".to_string(),
            ))
        }
    };

    Ok(steps
        .iter()
        .filter_map(Value::as_object)
        .map(|step| StepTrace {
            step_name: first_str(step, &["node_name", "step_name", "name", "node"])
                .unwrap_or_else(|| "unknown".to_string()),
            status: first_str(step, &["status"]).unwrap_or_else(|| "unknown".to_string()),
            duration_ms: step
                .get("duration_ms")
                .or_else(|| step.get("executionTime"))
                .and_then(Value::as_f64)
                .map(|ms| ms.max(0.0) as u64)
                .unwrap_or(0),
            input_preview: preview(step.get("input"), preview_chars),
            output_preview: preview(step.get("output"), preview_chars),
            error: step.get("error").and_then(error_text),
        })
        .collect())
}

fn first_str(obj: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .map(str::to_string)
}

fn error_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| Some(value.to_string())),
        other => Some(other.to_string()),
    }
}

/// Render any JSON value and cut it to `max_chars` on a char boundary.
pub fn preview(value: Option<&Value>, max_chars: usize) -> String {
    let text = match value {
        None | Some(Value::Null) => return String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    truncate_chars(&text, max_chars)
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => text[..byte_idx].to_string(),
        None => text.to_string(),
    }
}
