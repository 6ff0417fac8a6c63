//! Answer scoring.
//!
//! Answers are compared as bags of normalized tokens. Normalization is
//! lowercase, diacritic folding (NFD minus combining marks), numeric
//! canonicalization, punctuation to spaces, whitespace collapse.
//!
//! Decision rules, first match wins:
//!
//! 1. expected answer has no tokens: `NON_EMPTY`, correct iff the produced
//!    answer has tokens and is not an error echo
//! 2. every expected token is present (recall = 1): `RECALL_OVERRIDE`,
//!    score 1.0
//! 3. otherwise `F1_THRESHOLD`: correct iff F1 >= threshold, score = F1

use std::collections::HashMap;
use std::sync::OnceLock;

use evalgate_ledger::{ExecutionAttempt, MatchMethod, ScoredResult};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

use crate::domain::Question;

/// Default F1 needed for a non-override match.
pub const DEFAULT_F1_THRESHOLD: f64 = 0.5;

/// Patterns that mark a produced answer as an echoed error rather than content.
pub const DEFAULT_ERROR_PATTERNS: &[&str] = &[
    r#"^\s*\{\s*"error""#,
    r"^\s*(error|exception)\b",
    r"traceback \(most recent call last\)",
    r"internal server error",
    r"\btimed out\b",
    r"^\s*no response\b",
];

/// Typographic punctuation stripped in addition to ASCII punctuation.
const EXTRA_PUNCTUATION: &[char] = &[
    '\u{2018}', '\u{2019}', '\u{201C}', '\u{201D}', '\u{2013}', '\u{2014}', '\u{2026}', '\u{00AB}',
    '\u{00BB}', '\u{2039}', '\u{203A}', '\u{00B7}', '\u{2022}', '\u{00BF}', '\u{00A1}',
];

/// Scoring outcome for one produced/expected pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub correct: bool,
    pub score: f64,
    pub match_method: MatchMethod,
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
}

/// Tunables for [`Scorer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScorerConfig {
    pub f1_threshold: f64,
    pub error_patterns: Vec<String>,
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            f1_threshold: DEFAULT_F1_THRESHOLD,
            error_patterns: DEFAULT_ERROR_PATTERNS
                .iter()
                .map(|p| p.to_string())
                .collect(),
        }
    }
}

/// Pure, deterministic answer scorer.
#[derive(Debug, Clone)]
pub struct Scorer {
    f1_threshold: f64,
    error_echo: RegexSet,
}

impl Scorer {
    pub fn new(config: &ScorerConfig) -> Result<Self, regex::Error> {
        let patterns = config.error_patterns.iter().map(|p| format!("(?i){p}"));
        Ok(Self {
            f1_threshold: config.f1_threshold,
            error_echo: RegexSet::new(patterns)?,
        })
    }

    /// Scorer with the built-in threshold and error patterns.
    pub fn standard() -> Self {
        let config = ScorerConfig::default();
        Self::new(&config).unwrap_or_else(|_| Self {
            f1_threshold: config.f1_threshold,
            error_echo: RegexSet::empty(),
        })
    }

    pub fn is_error_echo(&self, produced: &str) -> bool {
        self.error_echo.is_match(produced)
    }

    pub fn score(&self, produced: &str, expected: &str) -> Verdict {
        let expected_tokens = tokenize(expected);
        let produced_tokens = tokenize(produced);

        if expected_tokens.is_empty() {
            let correct = !produced_tokens.is_empty() && !self.is_error_echo(produced);
            return Verdict {
                correct,
                score: if correct { 1.0 } else { 0.0 },
                match_method: MatchMethod::NonEmpty,
                precision: 0.0,
                recall: 0.0,
                f1: 0.0,
            };
        }

        let (precision, recall, f1) = overlap(&produced_tokens, &expected_tokens);

        if recall >= 1.0 {
            Verdict {
                correct: true,
                score: 1.0,
                match_method: MatchMethod::RecallOverride,
                precision,
                recall,
                f1,
            }
        } else {
            Verdict {
                correct: f1 >= self.f1_threshold,
                score: f1,
                match_method: MatchMethod::F1Threshold,
                precision,
                recall,
                f1,
            }
        }
    }

    /// Score a pipeline attempt. Errored attempts score as an empty answer.
    pub fn score_attempt(&self, attempt: ExecutionAttempt, question: &Question) -> ScoredResult {
        let produced = if attempt.is_success() {
            attempt.raw_response.as_deref().unwrap_or("")
        } else {
            ""
        };
        let verdict = self.score(produced, &question.expected_answer);
        ScoredResult {
            attempt,
            correct: verdict.correct,
            score: verdict.score,
            match_method: verdict.match_method,
            trace: Vec::new(),
        }
    }
}

impl Default for Scorer {
    fn default() -> Self {
        Self::standard()
    }
}

fn default_scorer() -> &'static Scorer {
    static DEFAULT: OnceLock<Scorer> = OnceLock::new();
    DEFAULT.get_or_init(Scorer::standard)
}

/// Score with the built-in configuration.
pub fn score(produced: &str, expected: &str) -> Verdict {
    default_scorer().score(produced, expected)
}

/// Score an attempt with the built-in configuration.
pub fn score_attempt(attempt: ExecutionAttempt, question: &Question) -> ScoredResult {
    default_scorer().score_attempt(attempt, question)
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize text for comparison.
pub fn normalize(text: &str) -> String {
    let folded: String = text
        .to_lowercase()
        .nfd()
        .filter(|c| !is_combining_mark(*c))
        .collect();
    let numeric = canonicalize_numbers(&folded);
    let spaced: String = numeric
        .chars()
        .map(|c| {
            if c.is_ascii_punctuation() || EXTRA_PUNCTUATION.contains(&c) {
                ' '
            } else {
                c
            }
        })
        .collect();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

/// Drop thousands separators and trailing zero decimals: `6,745,000.00` -> `6745000`.
fn canonicalize_numbers(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let digit_at = |i: usize| chars.get(i).is_some_and(|c| c.is_ascii_digit());
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        if !chars[i].is_ascii_digit() {
            out.push(chars[i]);
            i += 1;
            continue;
        }

        while i < chars.len() {
            if chars[i].is_ascii_digit() {
                out.push(chars[i]);
                i += 1;
            } else if chars[i] == ','
                && digit_at(i + 1)
                && digit_at(i + 2)
                && digit_at(i + 3)
                && !digit_at(i + 4)
            {
                i += 1;
            } else {
                break;
            }
        }

        if chars.get(i) == Some(&'.') && digit_at(i + 1) {
            let start = i + 1;
            let mut end = start;
            while digit_at(end) {
                end += 1;
            }
            let fraction: String = chars[start..end].iter().collect();
            let fraction = fraction.trim_end_matches('0');
            if !fraction.is_empty() {
                out.push('.');
                out.push_str(fraction);
            }
            i = end;
        }
    }
    out
}

/// Token-multiset precision, recall and F1.
fn overlap(produced: &[String], expected: &[String]) -> (f64, f64, f64) {
    if produced.is_empty() || expected.is_empty() {
        return (0.0, 0.0, 0.0);
    }
    let mut available: HashMap<&str, usize> = HashMap::new();
    for token in produced {
        *available.entry(token.as_str()).or_insert(0) += 1;
    }
    let mut common = 0usize;
    for token in expected {
        if let Some(count) = available.get_mut(token.as_str()) {
            if *count > 0 {
                *count -= 1;
                common += 1;
            }
        }
    }
    if common == 0 {
        return (0.0, 0.0, 0.0);
    }
    let precision = common as f64 / produced.len() as f64;
    let recall = common as f64 / expected.len() as f64;
    let f1 = 2.0 * precision * recall / (precision + recall);
    (precision, recall, f1)
}
