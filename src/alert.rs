//! Internal alerting — notifies the team about submissions that need a
//! human follow-up instead of a public review.
//!
//! Fire-and-forget: the engine logs a failed alert and moves on; alerting
//! can never fail the intake pipeline.

use async_trait::async_trait;

use crate::config::SmtpConfig;
use crate::crm::ClientProfile;
use crate::delivery::email::smtp_send;
use crate::error::AlertError;
use crate::submission::SubmissionRecord;

/// Why a submission was routed to alerting instead of review generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertReason {
    /// Average below the qualification threshold.
    LowRating,
    /// No scores at all on the submission.
    NoScores,
    /// Qualified average but testimonial consent declined.
    ConsentDeclined,
    /// Qualified average but negative keywords in the free text.
    NegativeSentiment,
    /// Qualified but no CRM match — delivery has no destination.
    ClientUnresolved,
}

impl std::fmt::Display for AlertReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LowRating => "low rating",
            Self::NoScores => "no scores provided",
            Self::ConsentDeclined => "consent declined",
            Self::NegativeSentiment => "negative sentiment flagged",
            Self::ClientUnresolved => "client not found in CRM",
        };
        write!(f, "{s}")
    }
}

/// Alerting collaborator contract.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify_low_rating(
        &self,
        record: &SubmissionRecord,
        client: Option<&ClientProfile>,
        average: Option<f64>,
        reason: AlertReason,
    ) -> Result<(), AlertError>;
}

/// Alerts delivered as internal emails over SMTP.
pub struct EmailAlertSink {
    config: SmtpConfig,
    recipients: Vec<String>,
}

impl EmailAlertSink {
    pub fn new(config: SmtpConfig, recipients: Vec<String>) -> Self {
        Self { config, recipients }
    }

    /// Parse a comma-separated recipient list (the `ALERT_EMAILS` format).
    pub fn parse_recipients(raw: &str) -> Vec<String> {
        raw.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    fn render(
        record: &SubmissionRecord,
        client: Option<&ClientProfile>,
        average: Option<f64>,
        reason: AlertReason,
    ) -> (String, String) {
        let name = client.map(|c| c.name.as_str()).unwrap_or("(unknown client)");
        let company = client.map(|c| c.company.as_str()).unwrap_or("");
        let average = average
            .map(|a| format!("{a:.2}/10"))
            .unwrap_or_else(|| "n/a".to_string());

        let subject = format!("[Review Relay] Follow-up needed: {reason}");
        let body = format!(
            "A feedback submission needs manual follow-up.\n\n\
             Reason: {reason}\n\
             Client: {name} {company}\n\
             Email: {}\n\
             Submission: {}\n\
             Average rating: {average}\n\n\
             Feedback:\n{}\n",
            record.email,
            record.key,
            record.feedback.as_deref().unwrap_or("(none)"),
        );

        (subject, body)
    }
}

#[async_trait]
impl AlertSink for EmailAlertSink {
    async fn notify_low_rating(
        &self,
        record: &SubmissionRecord,
        client: Option<&ClientProfile>,
        average: Option<f64>,
        reason: AlertReason,
    ) -> Result<(), AlertError> {
        if self.recipients.is_empty() {
            return Err(AlertError::SendFailed("no alert recipients configured".into()));
        }

        let (subject, body) = Self::render(record, client, average, reason);

        let sends = self.recipients.iter().map(|recipient| {
            let config = self.config.clone();
            let to = recipient.clone();
            let subject = subject.clone();
            let body = body.clone();
            tokio::task::spawn_blocking(move || smtp_send(&config, &to, &subject, &body))
        });

        for result in futures::future::join_all(sends).await {
            result
                .map_err(|e| AlertError::SendFailed(format!("send task panicked: {e}")))?
                .map_err(|e| AlertError::SendFailed(e.to_string()))?;
        }

        tracing::info!(
            key = %record.key,
            reason = %reason,
            recipients = self.recipients.len(),
            "Internal alert sent"
        );
        Ok(())
    }
}

/// Alerting disabled — logs and succeeds.
pub struct NullAlerts;

#[async_trait]
impl AlertSink for NullAlerts {
    async fn notify_low_rating(
        &self,
        record: &SubmissionRecord,
        _client: Option<&ClientProfile>,
        average: Option<f64>,
        reason: AlertReason,
    ) -> Result<(), AlertError> {
        tracing::warn!(
            key = %record.key,
            reason = %reason,
            average = average.unwrap_or(0.0),
            "Alerting not configured — follow-up logged only"
        );
        Ok(())
    }
}
