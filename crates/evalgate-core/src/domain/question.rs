use evalgate_ledger::PipelineKind;
use serde::{Deserialize, Serialize};

/// A benchmark question. Created once from a corpus file and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Question {
    /// Globally unique, stable across iterations.
    pub id: String,
    pub text: String,
    /// May be empty: any non-error answer is then acceptable.
    pub expected_answer: String,
    pub target_pipeline: PipelineKind,
    pub category: String,
}

impl Question {
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        expected_answer: impl Into<String>,
        target_pipeline: PipelineKind,
    ) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            expected_answer: expected_answer.into(),
            target_pipeline,
            category: "general".to_string(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn has_expected_answer(&self) -> bool {
        !self.expected_answer.trim().is_empty()
    }
}
