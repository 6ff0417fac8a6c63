//! Pipeline endpoints and the shared response contract.

use std::time::Duration;

use evalgate_ledger::PipelineKind;
use serde::{Deserialize, Serialize};

/// Connection settings for one answering pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineEndpoint {
    pub kind: PipelineKind,
    pub url: String,
    /// Covers connect, headers and body.
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub tenant_id: String,
    pub top_k: u32,
    pub include_sources: bool,
}

impl PipelineEndpoint {
    pub fn new(kind: PipelineKind, url: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.into(),
            timeout: Duration::from_secs(30),
            max_concurrency: 2,
            tenant_id: "default".to_string(),
            top_k: 5,
            include_sources: true,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency.max(1);
        self
    }

    /// Request body for `question_text`.
    pub fn request(&self, question_text: &str) -> PipelineRequest {
        PipelineRequest {
            query: question_text.to_string(),
            tenant_id: self.tenant_id.clone(),
            top_k: self.top_k,
            include_sources: self.include_sources,
        }
    }
}

/// JSON body posted to every pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRequest {
    pub query: String,
    pub tenant_id: String,
    pub top_k: u32,
    pub include_sources: bool,
}

/// Response fields that may carry the answer, highest priority first. Every
/// pipeline kind shares this order; the first non-empty string wins.
pub const ANSWER_FIELDS: &[&str] = &[
    "response",
    "answer",
    "result",
    "final_response",
    "interpretation",
    "output",
];
