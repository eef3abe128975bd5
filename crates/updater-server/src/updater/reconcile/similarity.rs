//! Name similarity scoring for course-unit matching
//!
//! The scorer is a trait so the heuristic can be swapped without touching
//! the ranking or the pipeline. Scores are in `0.0..=1.0`, higher is closer.

use crate::models::LocalizedText;

pub trait NameSimilarity: Send + Sync {
    fn score(&self, a: &str, b: &str) -> f64;
}

/// `1 - levenshtein / max_len` over lowercased, whitespace-collapsed names.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizedLevenshtein;

impl NameSimilarity for NormalizedLevenshtein {
    fn score(&self, a: &str, b: &str) -> f64 {
        strsim::normalized_levenshtein(&normalize(a), &normalize(b))
    }
}

/// Best score over the languages both texts carry; 0 when they share none.
pub fn localized_similarity(scorer: &dyn NameSimilarity, a: &LocalizedText, b: &LocalizedText) -> f64 {
    a.translations()
        .filter_map(|(lang, text)| b.get(lang).map(|other| scorer.score(text, other)))
        .fold(0.0, f64::max)
}

fn normalize(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}
