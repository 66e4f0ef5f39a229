//! AI draft generation — builds review text from a submission and client
//! context.
//!
//! The engine only relies on "produces text": the underlying model is
//! non-deterministic, and the same inputs at the same regeneration index
//! are treated as producing an equivalent draft. Transient model failures
//! are retried a bounded number of times with exponential backoff;
//! persistent failure surfaces as `DraftError::GenerationFailed` without
//! advancing request status.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::GeminiConfig;
use crate::crm::ClientProfile;
use crate::error::DraftError;
use crate::qualify::QualificationResult;
use crate::submission::SubmissionRecord;

/// Bounded retry attempts per draft.
const MAX_ATTEMPTS: u32 = 3;

/// Acceptable draft length window, in words. Out-of-window drafts are
/// retried; the final attempt is accepted as-is.
const MIN_WORDS: usize = 15;
const MAX_WORDS: usize = 100;

/// Sampling temperature and output cap for review drafts.
const DRAFT_TEMPERATURE: f32 = 0.7;
const DRAFT_MAX_TOKENS: u32 = 500;

/// Labels for the scored questions, in form order.
const QUESTION_LABELS: [&str; 10] = [
    "Initial kickoff & goal understanding",
    "Communication & responsiveness",
    "Project planning & management",
    "Design, branding & UX",
    "Technical quality & performance",
    "Testing & launch smoothness",
    "Training, handover & support",
    "Value for money",
    "Likelihood to recommend",
    "Overall satisfaction",
];

/// A text-generation model the draft adapter can call.
#[async_trait]
pub trait DraftModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// One completion call: prompt in, raw text out.
    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, DraftError>;
}

/// Gemini `generateContent` REST adapter.
pub struct GeminiModel {
    http: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiModel {
    pub fn new(config: GeminiConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl DraftModel for GeminiModel {
    fn model_name(&self) -> &str {
        &self.config.model
    }

    async fn generate(
        &self,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<String, DraftError> {
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.config.model
        );

        let body = serde_json::json!({
            "contents": [{ "parts": [{ "text": prompt }] }],
            "generationConfig": {
                "temperature": temperature,
                "maxOutputTokens": max_tokens,
            },
        });

        let response = self
            .http
            .post(&url)
            .header("x-goog-api-key", self.config.api_key.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DraftError::RequestFailed {
                model: self.config.model.clone(),
                reason: format!("transport error: {e}"),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(DraftError::RequestFailed {
                model: self.config.model.clone(),
                reason: format!("HTTP {status}: {detail}"),
            });
        }

        let parsed: GenerateContentResponse =
            response.json().await.map_err(|e| DraftError::InvalidResponse {
                model: self.config.model.clone(),
                reason: format!("malformed JSON: {e}"),
            })?;

        let text: String = parsed
            .candidates
            .first()
            .map(|c| {
                c.content
                    .parts
                    .iter()
                    .map(|p| p.text.as_str())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        if text.trim().is_empty() {
            return Err(DraftError::InvalidResponse {
                model: self.config.model.clone(),
                reason: "empty candidate text".to_string(),
            });
        }

        Ok(text)
    }
}

/// Stand-in when no model is configured: every call fails, which the
/// pipeline degrades into a logged, retryable state.
pub struct UnconfiguredModel;

#[async_trait]
impl DraftModel for UnconfiguredModel {
    fn model_name(&self) -> &str {
        "unconfigured"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, DraftError> {
        Err(DraftError::NotConfigured)
    }
}

/// Draft generator — prompt construction, bounded retry with backoff, and
/// output cleanup around a [`DraftModel`].
pub struct DraftGenerator {
    model: Arc<dyn DraftModel>,
    business_name: String,
}

impl DraftGenerator {
    pub fn new(model: Arc<dyn DraftModel>, business_name: impl Into<String>) -> Self {
        Self {
            model,
            business_name: business_name.into(),
        }
    }

    /// Generate a review draft for a qualified submission.
    ///
    /// `regen_index` is 0 for the first draft and increments on each
    /// client-requested regeneration, steering the model toward a fresh
    /// variation.
    pub async fn generate_draft(
        &self,
        record: &SubmissionRecord,
        client: Option<&ClientProfile>,
        qualification: &QualificationResult,
        regen_index: u32,
    ) -> Result<String, DraftError> {
        let prompt = build_review_prompt(
            &self.business_name,
            record,
            client,
            qualification,
            regen_index,
        );

        let mut last_error = String::new();

        for attempt in 1..=MAX_ATTEMPTS {
            info!(
                model = self.model.model_name(),
                attempt,
                max = MAX_ATTEMPTS,
                regen_index,
                "Requesting review draft"
            );

            match self
                .model
                .generate(&prompt, DRAFT_TEMPERATURE, DRAFT_MAX_TOKENS)
                .await
            {
                Ok(raw) => {
                    let draft = clean_draft(&raw);
                    let words = draft.split_whitespace().count();

                    if (MIN_WORDS..=MAX_WORDS).contains(&words) || attempt == MAX_ATTEMPTS {
                        if !(MIN_WORDS..=MAX_WORDS).contains(&words) {
                            warn!(words, "Final attempt — accepting draft outside word window");
                        }
                        info!(words, "Review draft generated");
                        return Ok(draft);
                    }

                    warn!(words, attempt, "Draft outside word window, retrying");
                    last_error = format!("draft length {words} words outside window");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "Draft model call failed");
                    last_error = e.to_string();
                    if attempt < MAX_ATTEMPTS {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                    }
                }
            }
        }

        Err(DraftError::GenerationFailed {
            attempts: MAX_ATTEMPTS,
            reason: last_error,
        })
    }
}

/// Exponential backoff with a little jitter so concurrent requests don't
/// retry in lockstep.
fn backoff_delay(attempt: u32) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    Duration::from_secs(2u64.saturating_pow(attempt)) + Duration::from_millis(jitter_ms)
}

/// Build the review-generation prompt from submission and client context.
fn build_review_prompt(
    business_name: &str,
    record: &SubmissionRecord,
    client: Option<&ClientProfile>,
    qualification: &QualificationResult,
    regen_index: u32,
) -> String {
    let mut prompt = String::with_capacity(1024);

    prompt.push_str(
        "You are a professional copywriter helping B2B clients write authentic \
         Google Business Profile reviews. Write a 20-80 word first-person review that \
         sounds natural, mentions concrete aspects of the experience, and avoids \
         keyword stuffing. Do not include star ratings in the text and do not start \
         the review with \"I\".\n\n",
    );

    prompt.push_str(&format!(
        "Write a review for **{business_name}** from the perspective of:\n"
    ));

    match client {
        Some(c) => {
            prompt.push_str(&format!("- Client: {}\n", c.name));
            if !c.company.is_empty() {
                prompt.push_str(&format!("- Company: {}\n", c.company));
            }
            if !c.services.is_empty() {
                prompt.push_str(&format!("- Services used: {}\n", c.services));
            }
        }
        None => prompt.push_str("- Client: a business client\n"),
    }

    prompt.push_str(&format!(
        "- Overall satisfaction: {:.1}/10\n\nRating breakdown (each out of 10):\n",
        qualification.average
    ));

    for (label, score) in QUESTION_LABELS.iter().zip(record.scores.iter()) {
        match score {
            Some(s) => prompt.push_str(&format!("- {label}: {s}/10\n")),
            None => prompt.push_str(&format!("- {label}: N/A\n")),
        }
    }

    if let Some(feedback) = record.feedback.as_deref().filter(|f| !f.is_empty()) {
        prompt.push_str(&format!(
            "\nThe client also shared this feedback:\n\"{feedback}\"\n\
             Incorporate its sentiment and any specific details.\n"
        ));
    }

    if regen_index > 0 {
        prompt.push_str(&format!(
            "\nThis is variation {} — write a noticeably different draft from \
             previous attempts, with a different opening and emphasis.\n",
            regen_index + 1
        ));
    }

    prompt.push_str(
        "\nHighlight the strongest-rated areas and focus on concrete experiences \
         rather than vague praise.",
    );

    prompt
}

/// Strip wrapping quotes and whitespace the model sometimes adds.
fn clean_draft(raw: &str) -> String {
    let mut draft = raw.trim();

    for quote in ['"', '\''] {
        if draft.len() >= 2 && draft.starts_with(quote) && draft.ends_with(quote) {
            draft = draft[1..draft.len() - 1].trim();
        }
    }

    draft.to_string()
}
