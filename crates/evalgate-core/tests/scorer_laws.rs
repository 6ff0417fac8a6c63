//! Scoring rules as seen by callers of the public scorer API.

use evalgate_core::scorer::{normalize, score, Scorer, ScorerConfig};
use evalgate_core::MatchMethod;

#[test]
fn scoring_is_deterministic() {
    let pairs = [
        ("Revenue was $6,745,000,000.00 in FY23.", "6745000000"),
        ("The capital of France is Paris", "paris"),
        ("alpha beta gamma", "alpha delta epsilon zeta"),
        ("", "anything"),
    ];
    for (produced, expected) in pairs {
        let first = score(produced, expected);
        for _ in 0..10 {
            assert_eq!(score(produced, expected), first);
        }
    }
}

#[test]
fn full_recall_overrides_low_precision() {
    let verdict = score(
        "After a long review the committee concluded that the answer is Paris, France",
        "Paris",
    );
    assert!(verdict.f1 < 0.5);
    assert_eq!(verdict.recall, 1.0);
    assert!(verdict.correct);
    assert_eq!(verdict.score, 1.0);
    assert_eq!(verdict.match_method, MatchMethod::RecallOverride);
}

#[test]
fn naming_the_expected_entity_in_a_sentence_is_correct() {
    let verdict = score("Isaac Newton discovered gravity.", "Newton");
    assert!((verdict.f1 - 0.4).abs() < 1e-9);
    assert!(verdict.correct);
    assert_eq!(verdict.match_method, MatchMethod::RecallOverride);
}

#[test]
fn partial_overlap_below_threshold_is_incorrect() {
    // Two of five tokens shared both ways: P = R = F1 = 0.4.
    let verdict = score("alpha beta gamma delta epsilon", "alpha beta zeta eta theta");
    assert_eq!(verdict.match_method, MatchMethod::F1Threshold);
    assert!((verdict.f1 - 0.4).abs() < 1e-9);
    assert!((verdict.score - 0.4).abs() < 1e-9);
    assert!(!verdict.correct);
}

#[test]
fn threshold_is_configurable() {
    let lenient = Scorer::new(&ScorerConfig {
        f1_threshold: 0.4,
        ..ScorerConfig::default()
    })
    .unwrap();
    let verdict = lenient.score("alpha beta gamma delta epsilon", "alpha beta zeta eta theta");
    assert!(verdict.correct);
}

#[test]
fn formatted_numbers_match_plain_digits() {
    let verdict = score("$6,745,000,000.00", "6745000000");
    assert!(verdict.correct);
    assert_eq!(verdict.match_method, MatchMethod::RecallOverride);
    assert_eq!(normalize("1,234.50"), "1234 5");
}

#[test]
fn diacritics_and_typographic_punctuation_are_ignored() {
    assert_eq!(normalize("Café “Crème” – Brûlée"), "cafe creme brulee");
    assert!(score("SÃO PAULO", "sao paulo").correct);
}

#[test]
fn empty_expected_accepts_any_real_answer() {
    let ok = score("Some grounded answer.", "");
    assert!(ok.correct);
    assert_eq!(ok.match_method, MatchMethod::NonEmpty);

    let blank = score("   ", "");
    assert!(!blank.correct);
    assert_eq!(blank.match_method, MatchMethod::NonEmpty);

    let echo = score("Error: upstream request timed out", "");
    assert!(!echo.correct);
}
