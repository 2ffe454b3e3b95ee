//! Weighted pattern classifier

use regex::Regex;
use unicode_segmentation::UnicodeSegmentation;

use orchestrator_core::{Intent, IntentName};

use crate::{normalize, patterns, slots};

/// Minimum winning score for a non-`unknown` classification.
const DISPATCH_THRESHOLD: f32 = 0.5;

/// A single scoring rule for an intent.
pub enum Matcher {
    /// Exact token match
    Keyword { token: String, weight: f32 },
    /// Consecutive token sequence
    Phrase { tokens: Vec<String>, weight: f32 },
    /// Regex over the normalized text
    Pattern { regex: Regex, weight: f32 },
}

impl Matcher {
    pub fn keyword(token: &str, weight: f32) -> Self {
        Matcher::Keyword {
            token: token.to_string(),
            weight,
        }
    }

    pub fn phrase(phrase: &str, weight: f32) -> Self {
        Matcher::Phrase {
            tokens: phrase.split_whitespace().map(str::to_string).collect(),
            weight,
        }
    }

    /// Panics on an invalid pattern; the built-in set is compiled at
    /// startup and covered by tests.
    pub fn pattern(pattern: &str, weight: f32) -> Self {
        Matcher::Pattern {
            regex: Regex::new(pattern).expect("invalid matcher regex"),
            weight,
        }
    }

    fn weight(&self) -> f32 {
        match self {
            Matcher::Keyword { weight, .. }
            | Matcher::Phrase { weight, .. }
            | Matcher::Pattern { weight, .. } => *weight,
        }
    }

    fn matches(&self, text: &str, tokens: &[&str]) -> bool {
        match self {
            Matcher::Keyword { token, .. } => tokens.iter().any(|t| t == token),
            Matcher::Phrase {
                tokens: phrase, ..
            } => {
                !phrase.is_empty()
                    && tokens
                        .windows(phrase.len())
                        .any(|window| window.iter().zip(phrase).all(|(a, b)| a == b))
            }
            Matcher::Pattern { regex, .. } => regex.is_match(text),
        }
    }
}

/// The matcher set for one intent.
pub struct IntentPatterns {
    pub intent: IntentName,
    pub matchers: Vec<Matcher>,
}

impl IntentPatterns {
    pub fn new(intent: IntentName, matchers: Vec<Matcher>) -> Self {
        Self { intent, matchers }
    }

    /// Sum of matched weights over the sum of all weights.
    fn score(&self, text: &str, tokens: &[&str]) -> f32 {
        let total: f32 = self.matchers.iter().map(Matcher::weight).sum();
        if total <= 0.0 {
            return 0.0;
        }
        let matched: f32 = self
            .matchers
            .iter()
            .filter(|m| m.matches(text, tokens))
            .map(Matcher::weight)
            .sum();
        (matched / total).clamp(0.0, 1.0)
    }
}

/// Deterministic intent classifier.
pub struct IntentClassifier {
    patterns: Vec<IntentPatterns>,
}

impl IntentClassifier {
    /// Classifier with the built-in pattern set.
    pub fn new() -> Self {
        Self {
            patterns: patterns::default_patterns(),
        }
    }

    /// Classifier with a custom pattern set.
    pub fn with_patterns(patterns: Vec<IntentPatterns>) -> Self {
        Self { patterns }
    }

    /// Classify command text. Always produces an intent; scores below
    /// the dispatch threshold come back as `unknown`.
    pub fn parse(&self, text: &str) -> Intent {
        let normalized = normalize(text);
        let tokens: Vec<&str> = normalized.unicode_words().collect();

        let mut best: Option<(IntentName, f32)> = None;
        for entry in &self.patterns {
            let score = entry.score(&normalized, &tokens);
            // Strictly-greater keeps the first of a tie, which is the
            // enumeration order.
            if best.map(|(_, s)| score > s).unwrap_or(true) {
                best = Some((entry.intent, score));
            }
        }

        let (winner, score) = best.unwrap_or((IntentName::Unknown, 0.0));
        if winner == IntentName::Unknown || score < DISPATCH_THRESHOLD {
            tracing::debug!(text = %normalized, score, "command not understood");
            return Intent::unknown(text, score);
        }

        let mut intent = Intent::new(winner, score, text);
        let (parameters, errors) = slots::extract(winner, &normalized, &tokens);
        intent.parameters = parameters;
        for error in errors {
            intent.push_error(error);
        }
        intent
    }
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new()
    }
}
