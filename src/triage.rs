//! Complexity triage. Classifies an issue from its labels and text.
//!
//! Pure and deterministic: no I/O, no clock, no randomness. The manager uses
//! the result to filter out work that is unsuitable for an autonomous worker
//! (`Epic`) and to order the remaining candidates.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

/// Bodies at least this long are `Large` regardless of wording.
pub const LARGE_BODY_CHARS: usize = 1000;

/// Bodies shorter than this are `Small` when nothing else applies.
pub const SMALL_BODY_CHARS: usize = 200;

/// Complexity class of an issue, ordered from least to most work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Complexity {
    Trivial,
    Small,
    Medium,
    Large,
    Epic,
}

impl Complexity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trivial => "TRIVIAL",
            Self::Small => "SMALL",
            Self::Medium => "MEDIUM",
            Self::Large => "LARGE",
            Self::Epic => "EPIC",
        }
    }

    /// Parse the suffix of a `complexity:<class>` label.
    fn from_label_suffix(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "trivial" => Some(Self::Trivial),
            "small" | "simple" => Some(Self::Small),
            "medium" => Some(Self::Medium),
            "large" | "complex" => Some(Self::Large),
            "epic" => Some(Self::Epic),
            _ => None,
        }
    }
}

impl std::fmt::Display for Complexity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

static TRIVIAL_WORDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(typo|typos|spelling|misspell(ed|ing)?|update readme|fix (a )?link|broken link)\b")
        .expect("static regex")
});

static REFACTOR_WORDING: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(refactor(ing)?|redesign|rewrite|re-architect|rearchitect|overhaul|migrate|migration)\b")
        .expect("static regex")
});

/// Classify an issue.
///
/// `Epic` wins outright when an `epic` label is present. Otherwise every
/// signal that fires contributes a class and the highest one is returned, so
/// conflicting signals never under-estimate. Body length only decides between
/// `Small` and `Medium` when no other signal fired.
pub fn classify(labels: &[String], title: &str, body: &str) -> Complexity {
    let labels: Vec<String> = labels.iter().map(|l| l.trim().to_lowercase()).collect();

    if labels.iter().any(|l| l == "epic") {
        return Complexity::Epic;
    }

    let body = body.trim();
    let mut signals: Vec<Complexity> = Vec::new();

    for label in &labels {
        if label == "good-first-issue" || label == "good first issue" || label == "trivial" {
            signals.push(Complexity::Trivial);
        }
        if let Some(class) = label
            .strip_prefix("complexity:")
            .and_then(Complexity::from_label_suffix)
        {
            signals.push(class);
        }
    }

    if is_short_fix_description(title, body) {
        signals.push(Complexity::Trivial);
    }

    if body.chars().count() >= LARGE_BODY_CHARS
        || REFACTOR_WORDING.is_match(title)
        || REFACTOR_WORDING.is_match(body)
    {
        signals.push(Complexity::Large);
    }

    if let Some(max) = signals.into_iter().max() {
        return max;
    }

    if body.chars().count() < SMALL_BODY_CHARS {
        Complexity::Small
    } else {
        Complexity::Medium
    }
}

/// A body of at most one short sentence describing a typo-style fix.
fn is_short_fix_description(title: &str, body: &str) -> bool {
    if body.chars().count() >= SMALL_BODY_CHARS || body.contains('\n') {
        return false;
    }
    let sentences = body
        .split(['.', '!', '?'])
        .filter(|s| !s.trim().is_empty())
        .count();
    sentences <= 1 && (TRIVIAL_WORDING.is_match(title) || TRIVIAL_WORDING.is_match(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn good_first_issue_with_empty_body_is_trivial() {
        assert_eq!(
            classify(&labels(&["good-first-issue"]), "Add a flag", ""),
            Complexity::Trivial
        );
    }

    #[test]
    fn epic_label_overrides_long_refactor_body() {
        let body = "We need to refactor the storage layer. ".repeat(60);
        assert_eq!(
            classify(&labels(&["epic", "good-first-issue"]), "Rewrite storage", &body),
            Complexity::Epic
        );
    }

    #[test]
    fn epic_label_is_case_insensitive() {
        assert_eq!(classify(&labels(&["Epic"]), "x", ""), Complexity::Epic);
    }

    #[test]
    fn typo_title_with_one_sentence_body_is_trivial() {
        assert_eq!(
            classify(&[], "Fix typo in README", "The word 'recieve' is misspelled."),
            Complexity::Trivial
        );
    }

    #[test]
    fn typo_wording_with_multi_sentence_body_is_not_trivial() {
        let class = classify(
            &[],
            "Fix typo",
            "There is a typo. Also the layout breaks. And the footer is gone.",
        );
        assert_eq!(class, Complexity::Small);
    }

    #[test]
    fn refactor_keyword_is_large() {
        assert_eq!(
            classify(&[], "Refactor the config loader", "short"),
            Complexity::Large
        );
    }

    #[test]
    fn long_body_is_large() {
        let body = "x".repeat(LARGE_BODY_CHARS + 1);
        assert_eq!(classify(&[], "Add export", &body), Complexity::Large);
    }

    #[test]
    fn body_at_the_large_threshold_is_large() {
        let body = "x".repeat(LARGE_BODY_CHARS);
        assert_eq!(classify(&[], "Add export", &body), Complexity::Large);
        let body = "x".repeat(LARGE_BODY_CHARS - 1);
        assert_eq!(classify(&[], "Add export", &body), Complexity::Medium);
    }

    #[test]
    fn length_splits_small_and_medium() {
        assert_eq!(classify(&[], "Add export", "short body"), Complexity::Small);
        let body = "y".repeat(SMALL_BODY_CHARS + 50);
        assert_eq!(classify(&[], "Add export", &body), Complexity::Medium);
    }

    #[test]
    fn conflicting_signals_resolve_upwards() {
        // trivial label, refactor wording -> the larger class wins
        assert_eq!(
            classify(&labels(&["good-first-issue"]), "Refactor parser", ""),
            Complexity::Large
        );
    }

    #[test]
    fn complexity_label_is_a_signal() {
        assert_eq!(
            classify(&labels(&["complexity:medium"]), "Add export", "tiny"),
            Complexity::Medium
        );
        assert_eq!(
            classify(&labels(&["complexity:epic"]), "Add export", "tiny"),
            Complexity::Epic
        );
    }

    #[test]
    fn classification_is_deterministic() {
        let l = labels(&["bug"]);
        let body = "Crash when saving an empty file.\nSteps: open, save.";
        let first = classify(&l, "Crash on save", body);
        for _ in 0..10 {
            assert_eq!(classify(&l, "Crash on save", body), first);
        }
    }

    #[test]
    fn classes_are_ordered() {
        assert!(Complexity::Trivial < Complexity::Small);
        assert!(Complexity::Large < Complexity::Epic);
    }

    #[test]
    fn serializes_in_upper_case() {
        let s = serde_json::to_string(&Complexity::Medium).unwrap();
        assert_eq!(s, "\"MEDIUM\"");
    }
}
