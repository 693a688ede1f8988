//! Sentiment scoring for post titles, bodies and comments
//!
//! Wraps the VADER lexicon scorer. Scores are a small mapping of named
//! dimensions (`neg`, `neu`, `pos`, `compound`). An empty mapping means the
//! scorer failed and sentiment is unavailable for that text.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use tracing::error;
use vader_sentiment::SentimentIntensityAnalyzer;

/// Named sentiment dimensions for one piece of text
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SentimentScores(BTreeMap<String, f64>);

impl SentimentScores {
    pub fn new(scores: BTreeMap<String, f64>) -> Self {
        Self(scores)
    }

    /// Overall polarity in [-1, 1], if the scorer produced one
    pub fn compound(&self) -> Option<f64> {
        self.get("compound")
    }

    pub fn get(&self, dimension: &str) -> Option<f64> {
        self.0.get(dimension).copied()
    }

    /// True when the scorer failed for this text
    pub fn is_unavailable(&self) -> bool {
        self.0.is_empty()
    }

    pub fn dimensions(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// JSON object form used by the snapshot tables
    pub fn to_json(&self) -> String {
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    /// Parse the stored JSON form; malformed input reads as unavailable
    pub fn from_json(raw: &str) -> Self {
        serde_json::from_str(raw).unwrap_or_default()
    }
}

impl FromIterator<(String, f64)> for SentimentScores {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Text → sentiment scores
pub trait SentimentAnalyzer: Send + Sync {
    fn analyze(&self, text: &str) -> SentimentScores;
}

/// VADER-backed analyzer
#[derive(Debug, Default, Clone, Copy)]
pub struct VaderAnalyzer;

impl VaderAnalyzer {
    pub fn new() -> Self {
        Self
    }
}

impl SentimentAnalyzer for VaderAnalyzer {
    fn analyze(&self, text: &str) -> SentimentScores {
        // Lexicon is loaded once by the crate
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let analyzer = SentimentIntensityAnalyzer::new();
            analyzer
                .polarity_scores(text)
                .into_iter()
                .map(|(dimension, value)| (dimension.to_string(), value))
                .collect::<SentimentScores>()
        }));

        match result {
            Ok(scores) => scores,
            Err(_) => {
                error!("Sentiment scorer panicked on text of {} bytes", text.len());
                SentimentScores::default()
            }
        }
    }
}
