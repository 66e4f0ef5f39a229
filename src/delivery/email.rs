//! Email channel — SMTP fallback via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;

use crate::config::SmtpConfig;
use crate::crm::ClientProfile;
use crate::error::DeliveryError;

use super::{DeliveryChannel, DeliveryMethod, DeliveryPayload};

/// SMTP email channel.
pub struct EmailChannel {
    config: SmtpConfig,
}

impl EmailChannel {
    pub fn new(config: SmtpConfig) -> Self {
        Self { config }
    }

    fn subject(&self, payload: &DeliveryPayload<'_>) -> String {
        if payload.reminder {
            "Reminder: your review is ready to post".to_string()
        } else {
            "Your review draft is ready".to_string()
        }
    }

    fn body(&self, payload: &DeliveryPayload<'_>) -> String {
        if payload.reminder {
            return format!(
                "Hi {},\n\n\
                 Just a friendly reminder — your review is ready to post.\n\
                 It only takes 30 seconds:\n\n{}\n\n\
                 Thank you for your partnership,\n{}\n",
                payload.client.name, payload.landing_url, self.config.from_name
            );
        }

        format!(
            "Hi {},\n\n\
             Thank you for your feedback on our recent project! Based on your \
             responses, we've drafted a review for you:\n\n\
             \"{}\"\n\n\
             Copy and post it in a few seconds:\n{}\n\n\
             Prefer a different wording? Open the link above and tap \"New draft\".\n\
             Not interested? Tap \"No thanks\" on the same page and we won't ask again.\n\n\
             Thank you for your partnership,\n{}\n",
            payload.client.name, payload.draft_text, payload.landing_url, self.config.from_name
        )
    }
}

/// Build the SMTP transport and send one message. Blocking; run it on the
/// blocking pool.
pub(crate) fn smtp_send(
    config: &SmtpConfig,
    to: &str,
    subject: &str,
    body: &str,
) -> Result<(), DeliveryError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.host)
        .map_err(|e| DeliveryError::SendFailed {
            channel: "email".into(),
            reason: format!("SMTP relay error: {e}"),
        })?
        .port(config.port)
        .credentials(creds)
        .build();

    let from = format!("{} <{}>", config.from_name, config.from_address);
    let email = Message::builder()
        .from(from.parse().map_err(|e| DeliveryError::SendFailed {
            channel: "email".into(),
            reason: format!("Invalid from address: {e}"),
        })?)
        .to(to.parse().map_err(|e| DeliveryError::SendFailed {
            channel: "email".into(),
            reason: format!("Invalid to address: {e}"),
        })?)
        .subject(subject)
        .body(body.to_string())
        .map_err(|e| DeliveryError::SendFailed {
            channel: "email".into(),
            reason: format!("Failed to build email: {e}"),
        })?;

    transport.send(&email).map_err(|e| DeliveryError::SendFailed {
        channel: "email".into(),
        reason: format!("SMTP send failed: {e}"),
    })?;

    Ok(())
}

#[async_trait]
impl DeliveryChannel for EmailChannel {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Email
    }

    fn can_reach(&self, client: &ClientProfile) -> bool {
        !client.business_email.is_empty()
    }

    async fn attempt(
        &self,
        payload: &DeliveryPayload<'_>,
    ) -> Result<Option<String>, DeliveryError> {
        let to = payload.client.business_email.clone();
        if to.is_empty() {
            return Err(DeliveryError::NoDestination {
                channel: "email".into(),
            });
        }

        let config = self.config.clone();
        let subject = self.subject(payload);
        let body = self.body(payload);

        tokio::task::spawn_blocking(move || smtp_send(&config, &to, &subject, &body))
            .await
            .map_err(|e| DeliveryError::SendFailed {
                channel: "email".into(),
                reason: format!("send task panicked: {e}"),
            })??;

        tracing::info!(to = %payload.client.business_email, "Consent email sent");
        Ok(None)
    }
}
