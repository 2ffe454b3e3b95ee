//! Intent classification and slot extraction
//!
//! Maps raw command text to a structured intent. The classifier is
//! deterministic and configuration-driven: weighted pattern matchers
//! score each intent, the winner is normalized against the intent's
//! maximum achievable weight, and slots are extracted by per-intent
//! extractors. It always produces an intent, falling back to `unknown`
//! below the dispatch threshold instead of failing.

pub mod classifier;
pub mod patterns;
pub mod slots;

pub use classifier::{IntentClassifier, IntentPatterns, Matcher};

/// Collapse whitespace runs, trim ends, and case-fold for matching.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
