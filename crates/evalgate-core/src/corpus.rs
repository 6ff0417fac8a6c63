//! Question corpus loading.
//!
//! Corpora are JSON (a top-level array or `{"questions": [...]}`) or JSON
//! Lines. Field aliases accepted per question:
//!
//! | canonical          | alias      | required |
//! |--------------------|------------|----------|
//! | `id`               |            | yes      |
//! | `text`             | `question` | yes      |
//! | `target_pipeline`  | `pipeline` | yes      |
//! | `expected_answer`  | `expected` | no       |
//! | `category`         |            | no       |

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use evalgate_ledger::PipelineKind;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::domain::{CorpusError, Question};

/// Load every question in `path`, optionally keeping only one pipeline.
///
/// Order is file order, and filtering preserves it.
pub fn load(path: &Path, pipeline: Option<PipelineKind>) -> Result<Vec<Question>, CorpusError> {
    let content = std::fs::read_to_string(path).map_err(|source| CorpusError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let jsonl = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("jsonl"))
        .unwrap_or(false);

    let questions = parse(&content, jsonl).map_err(|e| match e {
        CorpusError::Parse { message, .. } => CorpusError::Parse {
            path: path.to_path_buf(),
            message,
        },
        other => other,
    })?;

    Ok(match pipeline {
        Some(kind) => questions
            .into_iter()
            .filter(|q| q.target_pipeline == kind)
            .collect(),
        None => questions,
    })
}

/// Parse corpus content. `jsonl` selects JSON Lines.
pub fn parse(content: &str, jsonl: bool) -> Result<Vec<Question>, CorpusError> {
    let records = if jsonl {
        content
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(n, line)| {
                serde_json::from_str::<Value>(line).map_err(|e| parse_error(format!("line {}: {e}", n + 1)))
            })
            .collect::<Result<Vec<_>, _>>()?
    } else {
        match serde_json::from_str::<Value>(content).map_err(|e| parse_error(e.to_string()))? {
            Value::Array(items) => items,
            Value::Object(mut obj) => match obj.remove("questions") {
                Some(Value::Array(items)) => items,
                _ => return Err(parse_error("expected an array or a `questions` array".into())),
            },
            _ => return Err(parse_error("expected an array or a `questions` array".into())),
        }
    };

    let mut seen = HashSet::new();
    let mut questions = Vec::with_capacity(records.len());
    for (index, record) in records.into_iter().enumerate() {
        let Value::Object(obj) = record else {
            return Err(parse_error(format!("question #{index} is not an object")));
        };
        let question = question_from(index, &obj)?;
        if !seen.insert(question.id.clone()) {
            return Err(CorpusError::DuplicateId(question.id));
        }
        questions.push(question);
    }
    Ok(questions)
}

fn parse_error(message: String) -> CorpusError {
    CorpusError::Parse {
        path: Default::default(),
        message,
    }
}

/// First present, non-null field among `names`, rendered as a string.
fn field(obj: &Map<String, Value>, names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| match obj.get(*name) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        Some(Value::Bool(b)) => Some(b.to_string()),
        _ => None,
    })
}

fn question_from(index: usize, obj: &Map<String, Value>) -> Result<Question, CorpusError> {
    let id = field(obj, &["id"])
        .filter(|s| !s.trim().is_empty())
        .ok_or(CorpusError::MissingField { index, field: "id" })?;
    let text = field(obj, &["text", "question"])
        .ok_or(CorpusError::MissingField { index, field: "text" })?;
    let pipeline_name = field(obj, &["target_pipeline", "pipeline"]).ok_or(
        CorpusError::MissingField {
            index,
            field: "target_pipeline",
        },
    )?;
    let target_pipeline =
        pipeline_name
            .parse::<PipelineKind>()
            .map_err(|_| CorpusError::UnknownPipeline {
                id: id.clone(),
                pipeline: pipeline_name.clone(),
            })?;

    Ok(Question {
        id,
        text,
        expected_answer: field(obj, &["expected_answer", "expected"]).unwrap_or_default(),
        target_pipeline,
        category: field(obj, &["category"]).unwrap_or_else(|| "general".to_string()),
    })
}

/// SHA-256 hex digest of the corpus file.
pub fn digest(path: &Path) -> Result<String, CorpusError> {
    let bytes = std::fs::read(path).map_err(|source| CorpusError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Keep the first `n` questions of each pipeline, preserving order.
pub fn take_per_pipeline(questions: Vec<Question>, n: usize) -> Vec<Question> {
    let mut taken: BTreeMap<PipelineKind, usize> = BTreeMap::new();
    questions
        .into_iter()
        .filter(|q| {
            let count = taken.entry(q.target_pipeline).or_insert(0);
            *count += 1;
            *count <= n
        })
        .collect()
}

/// Group questions by target pipeline, preserving order within each group.
pub fn by_pipeline(questions: &[Question]) -> BTreeMap<PipelineKind, Vec<Question>> {
    let mut grouped: BTreeMap<PipelineKind, Vec<Question>> = BTreeMap::new();
    for q in questions {
        grouped.entry(q.target_pipeline).or_default().push(q.clone());
    }
    grouped
}
