//! Qualification — average score and pass/fail against the threshold.
//!
//! Pure functions, recomputable from the submission record at any time.
//! A below-threshold average short-circuits the pipeline; the one-way
//! branch to alerting happens in the engine.

use serde::{Deserialize, Serialize};

use crate::error::QualifyError;
use crate::submission::SubmissionRecord;

/// Keywords that suggest negative sentiment despite high ratings.
const NEGATIVE_KEYWORDS: &[&str] = &[
    "terrible",
    "horrible",
    "awful",
    "worst",
    "never again",
    "disappointed",
    "waste of time",
    "waste of money",
    "regret",
    "unprofessional",
    "scam",
    "fraud",
    "do not recommend",
    "stay away",
    "avoid",
    "disaster",
];

/// Derived qualification decision. Never persisted independently of the
/// submission it was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualificationResult {
    /// Mean of the non-null question scores. Kept at full precision — the
    /// threshold comparison must see the exact mean.
    pub average: f64,
    /// `average >= threshold` (boundary inclusive).
    pub qualified: bool,
}

/// Compute the average of non-null scores and the threshold decision.
pub fn evaluate(
    record: &SubmissionRecord,
    threshold: f64,
) -> Result<QualificationResult, QualifyError> {
    let valid: Vec<f64> = record.valid_scores().collect();
    if valid.is_empty() {
        return Err(QualifyError::NoScoresProvided);
    }

    let average = valid.iter().sum::<f64>() / valid.len() as f64;

    let result = QualificationResult {
        average,
        qualified: average >= threshold,
    };

    tracing::info!(
        key = %record.key,
        average = result.average,
        threshold,
        qualified = result.qualified,
        "Qualification evaluated"
    );

    Ok(result)
}

/// Keyword scan for negative sentiment in the free-text feedback.
///
/// Flags the case where a client rates highly but writes negative
/// comments. Returns the first matching keyword.
pub fn negative_sentiment(feedback: &str) -> Option<&'static str> {
    if feedback.is_empty() {
        return None;
    }

    let text = feedback.to_lowercase();
    NEGATIVE_KEYWORDS.iter().find(|kw| text.contains(**kw)).copied()
}
