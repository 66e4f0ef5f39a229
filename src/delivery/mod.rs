//! Delivery — gets the draft and its consent link to the client.
//!
//! WhatsApp and email are two variants of one [`DeliveryChannel`]
//! capability, tried in a fixed priority order with fallback. The
//! dispatcher never fails the pipeline: if every channel is unreachable or
//! errors, the outcome carries the per-channel failures and the request
//! stays retryable.

pub mod email;
pub mod whatsapp;

pub use email::EmailChannel;
pub use whatsapp::WhatsAppChannel;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::crm::ClientProfile;
use crate::error::DeliveryError;

/// The medium a draft was (or would be) delivered over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Whatsapp,
    Email,
    None,
}

impl std::fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Whatsapp => write!(f, "WHATSAPP"),
            Self::Email => write!(f, "EMAIL"),
            Self::None => write!(f, "NONE"),
        }
    }
}

impl std::str::FromStr for DeliveryMethod {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "WHATSAPP" => Ok(Self::Whatsapp),
            "EMAIL" => Ok(Self::Email),
            "NONE" => Ok(Self::None),
            _ => Err(format!("Unknown delivery method: {s}")),
        }
    }
}

/// What a channel needs to deliver: the draft and the consent link.
#[derive(Debug, Clone)]
pub struct DeliveryPayload<'a> {
    pub client: &'a ClientProfile,
    pub draft_text: &'a str,
    pub landing_url: &'a str,
    pub token: &'a str,
    /// True for reminder re-sends after the initial notification.
    pub reminder: bool,
}

/// One delivery medium.
#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    fn method(&self) -> DeliveryMethod;

    /// Whether this channel has a destination for the given client.
    fn can_reach(&self, client: &ClientProfile) -> bool;

    /// Attempt delivery. Returns a channel-native message id when one
    /// exists.
    async fn attempt(&self, payload: &DeliveryPayload<'_>)
        -> Result<Option<String>, DeliveryError>;
}

/// Result of one dispatch cycle.
#[derive(Debug)]
pub struct DispatchOutcome {
    /// The channel that succeeded, if any.
    pub delivered: Option<(DeliveryMethod, Option<String>)>,
    /// Channels that failed or were skipped, with the reason.
    pub failures: Vec<(DeliveryMethod, String)>,
}

impl DispatchOutcome {
    pub fn method(&self) -> DeliveryMethod {
        self.delivered
            .as_ref()
            .map(|(m, _)| *m)
            .unwrap_or(DeliveryMethod::None)
    }
}

/// Tries channels in priority order, falling back on any failure.
pub struct Dispatcher {
    channels: Vec<Arc<dyn DeliveryChannel>>,
}

impl Dispatcher {
    /// Build a dispatcher from channels in priority order (first wins).
    pub fn new(channels: Vec<Arc<dyn DeliveryChannel>>) -> Self {
        Self { channels }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Run one delivery cycle: first reachable channel that succeeds wins.
    pub async fn dispatch(&self, payload: &DeliveryPayload<'_>) -> DispatchOutcome {
        let mut failures = Vec::new();

        for channel in &self.channels {
            let method = channel.method();

            if !channel.can_reach(payload.client) {
                failures.push((method, "no destination on file".to_string()));
                continue;
            }

            info!(channel = %method, "Attempting delivery");
            match channel.attempt(payload).await {
                Ok(message_id) => {
                    info!(
                        channel = %method,
                        message_id = message_id.as_deref().unwrap_or("-"),
                        "Delivery succeeded"
                    );
                    return DispatchOutcome {
                        delivered: Some((method, message_id)),
                        failures,
                    };
                }
                Err(e) => {
                    warn!(channel = %method, error = %e, "Delivery failed, trying next channel");
                    failures.push((method, e.to_string()));
                }
            }
        }

        DispatchOutcome {
            delivered: None,
            failures,
        }
    }
}
