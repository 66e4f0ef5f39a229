//! WhatsApp channel — interactive messages via the Meta Cloud API.

use async_trait::async_trait;
use secrecy::ExposeSecret;
use serde_json::json;

use crate::config::WhatsAppConfig;
use crate::crm::ClientProfile;
use crate::error::DeliveryError;

use super::{DeliveryChannel, DeliveryMethod, DeliveryPayload};

/// WhatsApp message bodies are capped around 1024 chars; leave headroom.
const DRAFT_TRUNCATE_AT: usize = 800;

/// WhatsApp Cloud API channel.
pub struct WhatsAppChannel {
    http: reqwest::Client,
    config: WhatsAppConfig,
}

impl WhatsAppChannel {
    pub fn new(config: WhatsAppConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    /// Interactive message: draft in the body, quick-reply buttons for
    /// decline/regenerate, landing link in the text for copy-and-post.
    fn consent_payload(&self, to: &str, payload: &DeliveryPayload<'_>) -> serde_json::Value {
        let draft = truncate(payload.draft_text, DRAFT_TRUNCATE_AT);
        let body = if payload.reminder {
            format!(
                "Hi {}, just a friendly reminder — your review is ready to post. \
                 It only takes 30 seconds:\n\n{}",
                payload.client.name, payload.landing_url
            )
        } else {
            format!(
                "Hi {},\n\nThank you for your feedback! We've drafted a review for you:\n\n\
                 \"{}\"\n\nCopy and post it here: {}",
                payload.client.name, draft, payload.landing_url
            )
        };

        json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": to,
            "type": "interactive",
            "interactive": {
                "type": "button",
                "header": { "type": "text", "text": "Your review draft is ready" },
                "body": { "text": body },
                "action": {
                    "buttons": [
                        {
                            "type": "reply",
                            "reply": {
                                "id": format!("decline_{}", payload.token),
                                "title": "No thanks",
                            },
                        },
                        {
                            "type": "reply",
                            "reply": {
                                "id": format!("regenerate_{}", payload.token),
                                "title": "New draft",
                            },
                        },
                    ],
                },
            },
        })
    }
}

#[async_trait]
impl DeliveryChannel for WhatsAppChannel {
    fn method(&self) -> DeliveryMethod {
        DeliveryMethod::Whatsapp
    }

    fn can_reach(&self, client: &ClientProfile) -> bool {
        client.whatsapp.as_deref().is_some_and(|n| !n.is_empty())
    }

    async fn attempt(
        &self,
        payload: &DeliveryPayload<'_>,
    ) -> Result<Option<String>, DeliveryError> {
        let number = payload
            .client
            .whatsapp
            .as_deref()
            .ok_or_else(|| DeliveryError::NoDestination {
                channel: "whatsapp".into(),
            })?;

        // Graph API wants the number without the leading '+'.
        let to = number.trim_start_matches('+');
        let body = self.consent_payload(to, payload);

        let response = self
            .http
            .post(self.config.messages_url())
            .bearer_auth(self.config.access_token.expose_secret())
            .json(&body)
            .send()
            .await
            .map_err(|e| DeliveryError::SendFailed {
                channel: "whatsapp".into(),
                reason: format!("transport error: {e}"),
            })?;

        let status = response.status();
        let result: serde_json::Value = response.json().await.unwrap_or_default();

        if !status.is_success() || result.get("error").is_some() {
            let reason = result
                .pointer("/error/message")
                .and_then(|v| v.as_str())
                .map(String::from)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(DeliveryError::SendFailed {
                channel: "whatsapp".into(),
                reason,
            });
        }

        let message_id = result
            .pointer("/messages/0/id")
            .and_then(|v| v.as_str())
            .map(String::from);

        Ok(message_id)
    }
}

fn truncate(text: &str, max_len: usize) -> String {
    if text.chars().count() <= max_len {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_len.saturating_sub(3)).collect();
    format!("{cut}...")
}

/// Echo the Meta webhook verification challenge when the mode and verify
/// token match.
pub fn verify_webhook<'a>(
    config: &WhatsAppConfig,
    mode: &str,
    token: &str,
    challenge: &'a str,
) -> Option<&'a str> {
    if mode == "subscribe" && !config.verify_token.is_empty() && token == config.verify_token {
        return Some(challenge);
    }
    None
}
