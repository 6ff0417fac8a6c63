//! Error taxonomy for evalgate.
//!
//! Pipeline call failures are not errors: they are recorded as tagged
//! attempts. The types here cover the fatal paths (bad corpus, bad config,
//! unwritable state) and the non-fatal diagnostics failures.

use std::path::PathBuf;

use evalgate_ledger::StoreError;

/// Errors produced while loading a question corpus.
#[derive(Debug, thiserror::Error)]
pub enum CorpusError {
    #[error("cannot read corpus {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse corpus {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },

    #[error("question #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("duplicate question id: {0}")]
    DuplicateId(String),

    #[error("question {id}: unknown pipeline `{pipeline}`")]
    UnknownPipeline { id: String, pipeline: String },
}

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("pipeline {0} has no url configured")]
    MissingPipelineUrl(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors produced while fetching an execution trace.
#[derive(Debug, thiserror::Error)]
pub enum DiagnosticsError {
    #[error("diagnostics request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("diagnostics endpoint returned HTTP {0}")]
    Status(u16),

    #[error("unexpected diagnostics payload: {0}")]
    Payload(String),
}

/// evalgate domain errors.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("corpus error: {0}")]
    Corpus(#[from] CorpusError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("diagnostics error: {0}")]
    Diagnostics(#[from] DiagnosticsError),

    #[error("state store error: {0}")]
    Store(#[from] StoreError),

    #[error("no endpoint configured for pipeline {0}")]
    NoEndpoint(String),

    #[error("no questions for the selected pipelines")]
    NoQuestions,

    #[error("unknown phase: {0}")]
    UnknownPhase(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for evalgate domain operations.
pub type Result<T> = std::result::Result<T, EvalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corpus_error_display() {
        let err = CorpusError::MissingField {
            index: 3,
            field: "target_pipeline",
        };
        assert!(err.to_string().contains("#3"));
        assert!(err.to_string().contains("target_pipeline"));

        let err = CorpusError::DuplicateId("q-7".to_string());
        assert!(err.to_string().contains("q-7"));
    }

    #[test]
    fn test_store_error_converts() {
        let err: EvalError = StoreError::Corrupt("gap".to_string()).into();
        assert!(err.to_string().starts_with("state store error"));
    }

    #[test]
    fn test_unknown_phase_display() {
        let err = EvalError::UnknownPhase("phase-9".to_string());
        assert_eq!(err.to_string(), "unknown phase: phase-9");
    }
}
