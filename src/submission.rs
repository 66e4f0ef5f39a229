//! Submission intake — validates and canonicalizes raw form payloads.
//!
//! Identity fields (`sheet_id`, `row_number`, `email`) are strict: missing
//! or malformed values reject the payload. Score fields are deliberately
//! lenient: form UIs cannot enforce ranges, so an unparsable or
//! out-of-range score becomes `None` rather than a rejection.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::IntakeError;

/// Number of scored questions on the satisfaction form.
pub const QUESTION_COUNT: usize = 10;

/// Valid score range (inclusive).
const SCORE_MIN: f64 = 1.0;
const SCORE_MAX: f64 = 10.0;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex is valid")
});

/// Natural key of a submission: one spreadsheet row is one submission.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubmissionKey {
    pub sheet_id: String,
    pub row_number: u32,
}

impl SubmissionKey {
    pub fn new(sheet_id: impl Into<String>, row_number: u32) -> Self {
        Self {
            sheet_id: sheet_id.into(),
            row_number,
        }
    }
}

impl std::fmt::Display for SubmissionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:row{}", self.sheet_id, self.row_number)
    }
}

/// Raw webhook payload as forwarded by the form trigger.
///
/// Field types are loose on purpose — the trigger script sends whatever the
/// spreadsheet holds, so numbers may arrive as strings and vice versa.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawSubmission {
    #[serde(default)]
    pub sheet_id: Option<String>,
    #[serde(default)]
    pub row_number: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub linkedin_profile: Option<String>,

    #[serde(default)]
    pub q1: Option<serde_json::Value>,
    #[serde(default)]
    pub q2: Option<serde_json::Value>,
    #[serde(default)]
    pub q3: Option<serde_json::Value>,
    #[serde(default)]
    pub q4: Option<serde_json::Value>,
    #[serde(default)]
    pub q5: Option<serde_json::Value>,
    #[serde(default)]
    pub q6: Option<serde_json::Value>,
    #[serde(default)]
    pub q7: Option<serde_json::Value>,
    #[serde(default)]
    pub q8: Option<serde_json::Value>,
    #[serde(default)]
    pub q9: Option<serde_json::Value>,
    #[serde(default)]
    pub q10: Option<serde_json::Value>,

    /// Consent to use the feedback as a public testimonial ("Yes"/"No").
    #[serde(default)]
    pub testimonial_consent: Option<serde_json::Value>,
    /// Free-text feedback.
    #[serde(default)]
    pub feedback: Option<String>,
}

/// A validated, canonicalized form submission. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRecord {
    pub key: SubmissionKey,
    pub received_at: DateTime<Utc>,
    pub email: String,
    pub linkedin_profile: Option<String>,
    /// Question scores in form order; `None` where absent or unparsable.
    pub scores: Vec<Option<f64>>,
    pub testimonial_consent: bool,
    pub feedback: Option<String>,
}

impl SubmissionRecord {
    /// Non-null scores, in form order.
    pub fn valid_scores(&self) -> impl Iterator<Item = f64> + '_ {
        self.scores.iter().filter_map(|s| *s)
    }
}

/// Validate and canonicalize a raw payload into a [`SubmissionRecord`].
pub fn normalize(raw: &RawSubmission) -> Result<SubmissionRecord, IntakeError> {
    let sheet_id = raw
        .sheet_id
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IntakeError::InvalidPayload("missing sheet_id".into()))?;

    let row_number = raw
        .row_number
        .as_ref()
        .and_then(parse_row_number)
        .ok_or_else(|| IntakeError::InvalidPayload("missing or invalid row_number".into()))?;

    let email = raw
        .email
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| IntakeError::InvalidPayload("missing email".into()))?;

    if !EMAIL_RE.is_match(email) {
        return Err(IntakeError::InvalidPayload(format!(
            "invalid email address: {email}"
        )));
    }

    let received_at = raw
        .timestamp
        .as_deref()
        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);

    let scores = vec![
        parse_score(raw.q1.as_ref()),
        parse_score(raw.q2.as_ref()),
        parse_score(raw.q3.as_ref()),
        parse_score(raw.q4.as_ref()),
        parse_score(raw.q5.as_ref()),
        parse_score(raw.q6.as_ref()),
        parse_score(raw.q7.as_ref()),
        parse_score(raw.q8.as_ref()),
        parse_score(raw.q9.as_ref()),
        parse_score(raw.q10.as_ref()),
    ];

    Ok(SubmissionRecord {
        key: SubmissionKey::new(sheet_id, row_number),
        received_at,
        email: email.to_string(),
        linkedin_profile: raw
            .linkedin_profile
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
        scores,
        testimonial_consent: parse_consent(raw.testimonial_consent.as_ref()),
        feedback: raw
            .feedback
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from),
    })
}

/// Parse a row number from a JSON number or a numeric string.
fn parse_row_number(value: &serde_json::Value) -> Option<u32> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Parse-or-null score handling: number or numeric string, clamped to
/// `None` when outside [1, 10].
fn parse_score(value: Option<&serde_json::Value>) -> Option<f64> {
    let parsed = match value? {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }?;

    (SCORE_MIN..=SCORE_MAX).contains(&parsed).then_some(parsed)
}

/// Consent arrives as "Yes"/"No" from the form, or a bare bool from newer
/// trigger scripts. Anything else means no consent.
fn parse_consent(value: Option<&serde_json::Value>) -> bool {
    match value {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::String(s)) => s.trim().eq_ignore_ascii_case("yes"),
        _ => false,
    }
}
