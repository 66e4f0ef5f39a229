//! The review request — the tracked unit of work from qualified submission
//! to terminal client outcome.
//!
//! Status transitions are monotonic and terminal states are sticky: once a
//! request is copied, declined, expired, or regeneration-capped, no further
//! action mutates it. The engine is the sole writer of these fields; the
//! spreadsheet mirror is a projection, never consulted for guards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crm::ClientProfile;
use crate::delivery::DeliveryMethod;
use crate::error::ActionError;
use crate::qualify::QualificationResult;
use crate::submission::{SubmissionKey, SubmissionRecord};
use crate::token::ConsentToken;

/// Lifecycle status of a review request.
///
/// `Unresolved` is the degraded pre-delivery state for submissions whose
/// email has no CRM match: a draft exists but there is no destination.
/// There is intentionally no stored "regenerated" status — a successful
/// regeneration returns the request to `Sent` with a fresh draft and token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestStatus {
    /// Qualified, awaiting (or retrying) delivery.
    Qualified,
    /// Qualified but the client could not be resolved in the CRM.
    Unresolved,
    /// Draft delivered; awaiting a client action.
    Sent,
    /// Client copied the review to post it.
    Copied,
    /// Client opted out.
    Declined,
    /// Token deadline passed without action.
    Expired,
    /// Client tried to regenerate beyond the cap.
    RegenLimitReached,
}

impl RequestStatus {
    /// Terminal states accept no further actions.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Copied | Self::Declined | Self::Expired | Self::RegenLimitReached
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Qualified => "QUALIFIED",
            Self::Unresolved => "UNRESOLVED",
            Self::Sent => "SENT",
            Self::Copied => "COPIED",
            Self::Declined => "DECLINED",
            Self::Expired => "EXPIRED",
            Self::RegenLimitReached => "REGEN_LIMIT_REACHED",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RequestStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUALIFIED" => Ok(Self::Qualified),
            "UNRESOLVED" => Ok(Self::Unresolved),
            "SENT" => Ok(Self::Sent),
            "COPIED" => Ok(Self::Copied),
            "DECLINED" => Ok(Self::Declined),
            "EXPIRED" => Ok(Self::Expired),
            "REGEN_LIMIT_REACHED" => Ok(Self::RegenLimitReached),
            _ => Err(format!("Unknown request status: {s}")),
        }
    }
}

/// One append-only error log entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub message: String,
}

/// The central entity: one qualified submission being driven to a terminal
/// outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewRequest {
    pub record: SubmissionRecord,
    pub qualification: QualificationResult,
    /// CRM snapshot taken at creation; never re-queried for this request.
    pub client: Option<ClientProfile>,
    pub draft_text: String,
    /// Channel used for the most recent successful delivery cycle.
    pub delivery_method: DeliveryMethod,
    pub status: RequestStatus,
    /// Current consent token. Superseded tokens are gone — at most one
    /// active token exists per request.
    pub token: Option<ConsentToken>,
    pub regeneration_count: u32,
    pub max_regenerations: u32,
    pub error_log: Vec<ErrorLogEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
    pub copied_at: Option<DateTime<Utc>>,
}

impl ReviewRequest {
    /// Create a request for a submission that passed qualification.
    /// Starts `Qualified`, or `Unresolved` when the CRM had no match.
    pub fn new(
        record: SubmissionRecord,
        qualification: QualificationResult,
        client: Option<ClientProfile>,
        max_regenerations: u32,
    ) -> Self {
        let now = Utc::now();
        let status = if client.is_some() {
            RequestStatus::Qualified
        } else {
            RequestStatus::Unresolved
        };

        Self {
            record,
            qualification,
            client,
            draft_text: String::new(),
            delivery_method: DeliveryMethod::None,
            status,
            token: None,
            regeneration_count: 0,
            max_regenerations,
            error_log: Vec::new(),
            created_at: now,
            updated_at: now,
            sent_at: None,
            copied_at: None,
        }
    }

    pub fn key(&self) -> &SubmissionKey {
        &self.record.key
    }

    /// Append to the error log without changing status.
    pub fn log_error(&mut self, stage: &str, message: impl Into<String>) {
        self.error_log.push(ErrorLogEntry {
            at: Utc::now(),
            stage: stage.to_string(),
            message: message.into(),
        });
        self.touch();
    }

    /// Delivery succeeded: record the channel and enter `Sent`.
    pub fn mark_sent(&mut self, method: DeliveryMethod) {
        self.delivery_method = method;
        self.status = RequestStatus::Sent;
        self.sent_at = Some(Utc::now());
        self.touch();
    }

    /// Client copied the review (terminal).
    pub fn mark_copied(&mut self) {
        self.status = RequestStatus::Copied;
        self.copied_at = Some(Utc::now());
        self.touch();
    }

    /// Client opted out (terminal).
    pub fn mark_declined(&mut self) {
        self.status = RequestStatus::Declined;
        self.touch();
    }

    /// Token deadline passed without action (terminal).
    pub fn mark_expired(&mut self) {
        self.status = RequestStatus::Expired;
        self.touch();
    }

    /// Regeneration attempted at the cap (terminal).
    pub fn mark_regen_limit(&mut self) {
        self.status = RequestStatus::RegenLimitReached;
        self.touch();
    }

    /// A successful regeneration: new draft, fresh token (superseding the
    /// old one), incremented counter, back to `Sent`.
    pub fn apply_regeneration(&mut self, draft: String, token: ConsentToken) {
        self.draft_text = draft;
        self.token = Some(token);
        self.regeneration_count += 1;
        self.status = RequestStatus::Sent;
        self.touch();
    }

    /// Whether a further regeneration is allowed.
    pub fn can_regenerate(&self) -> bool {
        self.regeneration_count < self.max_regenerations
    }

    /// Guard for token-authenticated client actions.
    ///
    /// Ordering matters: terminal stickiness wins over token problems so a
    /// replayed click on a finalized request reports
    /// `RequestAlreadyFinalized`, and an action arriving before delivery
    /// (status not yet `Sent`) is rejected without mutation.
    pub fn guard_action(&self, presented: &str) -> Result<(), ActionError> {
        if self.status.is_terminal() {
            return Err(ActionError::RequestAlreadyFinalized {
                status: self.status.to_string(),
            });
        }

        let token = self.token.as_ref().ok_or(ActionError::TokenNotFound)?;
        if !token.matches(presented) {
            return Err(ActionError::InvalidToken);
        }
        if token.is_expired() {
            return Err(ActionError::TokenExpired);
        }

        if self.status != RequestStatus::Sent {
            return Err(ActionError::InvalidToken);
        }

        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
