//! Text normalisation, validation and content signatures.
//!
//! A [`Signature`] is a fingerprint small enough to persist next to a cached
//! score. It lets a later run notice that the text behind a stable identity
//! key changed, without ever storing the text itself.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AnnotatorConfig;

/// Share of degenerate tokens ("aaaa", "hahaha") above which text is spam.
const MAX_REPEAT_RATIO: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signature {
    pub length: usize,
    pub word_count: usize,
    pub is_short_form: bool,
}

impl Signature {
    pub fn from_text(text: &str, config: &AnnotatorConfig) -> Self {
        TextProfile::analyze(text, config).signature()
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum Rejection {
    #[error("text is empty")]
    Empty,
    #[error("text too short: {words} words (minimum {min})")]
    TooShort { words: usize, min: usize },
    #[error("high repetition detected: {:.0}%", .ratio * 100.0)]
    Repetitive { ratio: f64 },
}

#[derive(Debug, Clone)]
pub struct TextProfile {
    pub normalized: String,
    pub length: usize,
    pub word_count: usize,
    pub is_short_form: bool,
    pub rejection: Option<Rejection>,
}

impl TextProfile {
    pub fn analyze(text: &str, config: &AnnotatorConfig) -> Self {
        let normalized = normalize(text);
        let words: Vec<&str> = normalized.split_whitespace().collect();
        let length = normalized.chars().count();
        let word_count = words.len();

        let rejection = if words.is_empty() {
            Some(Rejection::Empty)
        } else if word_count < config.min_words {
            Some(Rejection::TooShort {
                words: word_count,
                min: config.min_words,
            })
        } else {
            let ratio = repeat_ratio(&words);
            (ratio > MAX_REPEAT_RATIO).then_some(Rejection::Repetitive { ratio })
        };

        Self {
            length,
            word_count,
            is_short_form: length < config.short_form_threshold,
            rejection,
            normalized,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.rejection.is_none()
    }

    pub fn signature(&self) -> Signature {
        Signature {
            length: self.length,
            word_count: self.word_count,
            is_short_form: self.is_short_form,
        }
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.normalized.split_whitespace()
    }
}

/// Folds typographic punctuation to ASCII, drops URLs and collapses whitespace.
fn normalize(text: &str) -> String {
    let folded: String = text
        .chars()
        .flat_map(|c| {
            let replacement: &[char] = match c {
                '\u{201C}' | '\u{201D}' => &['"'],
                '\u{2018}' | '\u{2019}' => &['\''],
                '\u{2013}' => &['-'],
                '\u{2014}' => &['-', '-'],
                '\u{2026}' => &['.', '.', '.'],
                _ => return vec![c],
            };
            replacement.to_vec()
        })
        .collect();

    folded
        .split_whitespace()
        .filter(|token| !is_url(token))
        .collect::<Vec<_>>()
        .join(" ")
}

fn is_url(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://") || lower.starts_with("www.")
}

fn repeat_ratio(words: &[&str]) -> f64 {
    let degenerate = words
        .iter()
        .filter(|word| {
            let lower = word.to_lowercase();
            let mut distinct: Vec<char> = lower.chars().collect();
            distinct.sort_unstable();
            distinct.dedup();
            lower.chars().count() > 2 && distinct.len() <= 2
        })
        .count();
    degenerate as f64 / words.len() as f64
}
