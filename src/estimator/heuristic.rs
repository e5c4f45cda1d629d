use std::collections::HashSet;

use anyhow::Result;
use async_trait::async_trait;

use crate::{config::AnnotatorConfig, text::TextProfile};

use super::{Estimate, Estimator};

const MIN_SCORE: f64 = 70.0;
const MAX_SCORE: f64 = 150.0;
const SINGLE_RULE_CONFIDENCE: f64 = 70.0;
const MIN_CONFIDENCE: f64 = 50.0;

/// Small stylometric rule ensemble so the crate runs end to end without a
/// trained model. Not meant to be accurate.
pub struct HeuristicEstimator {
    config: AnnotatorConfig,
    weight_vocabulary: f64,
    weight_sentence: f64,
    weight_word_length: f64,
}

impl HeuristicEstimator {
    pub fn new(config: AnnotatorConfig) -> Self {
        Self {
            config,
            weight_vocabulary: 0.4,
            weight_sentence: 0.3,
            weight_word_length: 0.3,
        }
    }

    fn score(&self, profile: &TextProfile) -> (f64, f64) {
        let words: Vec<&str> = profile.words().collect();

        let mut rules = vec![(vocabulary_score(&words), self.weight_vocabulary)];
        if let Some(score) = sentence_score(&profile.normalized) {
            rules.push((score, self.weight_sentence));
        }
        if let Some(score) = word_length_score(&words) {
            rules.push((score, self.weight_word_length));
        }

        let total_weight: f64 = rules.iter().map(|(_, weight)| weight).sum();
        let value = rules
            .iter()
            .map(|(score, weight)| score * weight / total_weight)
            .sum::<f64>();

        let confidence = if rules.len() > 1 {
            let mean = rules.iter().map(|(score, _)| score).sum::<f64>() / rules.len() as f64;
            let variance = rules
                .iter()
                .map(|(score, _)| (score - mean).powi(2))
                .sum::<f64>()
                / rules.len() as f64;
            (100.0 - variance.sqrt() * 2.0).max(MIN_CONFIDENCE)
        } else {
            SINGLE_RULE_CONFIDENCE
        };

        (value, confidence)
    }
}

#[async_trait]
impl Estimator for HeuristicEstimator {
    async fn estimate(&self, text: &str) -> Result<Estimate> {
        let profile = TextProfile::analyze(text, &self.config);
        let signature_inputs = profile.signature();

        if !profile.is_valid() {
            return Ok(Estimate {
                is_valid: false,
                value: None,
                confidence: None,
                signature_inputs,
            });
        }

        let (value, confidence) = self.score(&profile);
        Ok(Estimate {
            is_valid: true,
            value: Some(value.round()),
            confidence: Some(confidence.round()),
            signature_inputs,
        })
    }
}

fn clamp_score(score: f64) -> f64 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}

/// Type-token ratio: richer vocabulary scores higher.
fn vocabulary_score(words: &[&str]) -> f64 {
    let distinct: HashSet<String> = words.iter().map(|word| word.to_lowercase()).collect();
    let ttr = distinct.len() as f64 / words.len().max(1) as f64;
    clamp_score(100.0 + (ttr - 0.5) * 60.0)
}

/// Rewards mid-length sentences; `None` when there is no sentence structure.
fn sentence_score(text: &str) -> Option<f64> {
    let sentences: Vec<usize> = text
        .split(&['.', '!', '?'][..])
        .map(|sentence| sentence.split_whitespace().count())
        .filter(|count| *count > 0)
        .collect();
    if sentences.len() < 2 {
        return None;
    }

    let avg = sentences.iter().sum::<usize>() as f64 / sentences.len() as f64;
    let adjustment = if (12.0..=20.0).contains(&avg) {
        (avg - 10.0) * 2.0
    } else {
        0.0
    };
    Some(clamp_score(100.0 + adjustment))
}

fn word_length_score(words: &[&str]) -> Option<f64> {
    let lengths: Vec<usize> = words
        .iter()
        .map(|word| word.chars().filter(|c| c.is_alphabetic()).count())
        .filter(|len| *len > 0)
        .collect();
    if lengths.is_empty() {
        return None;
    }

    let mean = lengths.iter().sum::<usize>() as f64 / lengths.len() as f64;
    Some(clamp_score(100.0 + (mean - 4.5) * 8.0))
}
