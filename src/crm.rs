//! CRM client resolution — maps a submitter email to identity and contact
//! channels.
//!
//! The engine matches case-insensitively and attaches a snapshot to the
//! request; the CRM is never re-queried for an in-flight request.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::CrmError;

/// Client identity and contact channels from the CRM store.
///
/// A read-only snapshot: once attached to a request it is never refreshed,
/// so an in-flight request keeps its original destination even if the CRM
/// record changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientProfile {
    pub name: String,
    #[serde(default)]
    pub company: String,
    #[serde(default)]
    pub services: String,
    /// WhatsApp number, canonicalized to E.164 at resolution time.
    #[serde(default)]
    pub whatsapp: Option<String>,
    #[serde(default)]
    pub business_email: String,
}

/// External CRM lookup contract.
#[async_trait]
pub trait CrmLookup: Send + Sync {
    /// Look up a client by submitter email. `Ok(None)` means no CRM match.
    async fn lookup_client(&self, email: &str) -> Result<Option<ClientProfile>, CrmError>;
}

/// CRM lookup over an HTTP endpoint (e.g. an Apps Script web app fronting
/// the CRM sheet). `GET {endpoint}?email=...` returns a profile JSON or
/// 404.
pub struct HttpCrm {
    http: reqwest::Client,
    endpoint: String,
}

impl HttpCrm {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl CrmLookup for HttpCrm {
    async fn lookup_client(&self, email: &str) -> Result<Option<ClientProfile>, CrmError> {
        let normalized = email.trim().to_lowercase();

        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("email", normalized.as_str())])
            .send()
            .await
            .map_err(|e| CrmError::LookupFailed(format!("request error: {e}")))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        if !response.status().is_success() {
            return Err(CrmError::LookupFailed(format!(
                "CRM endpoint returned {}",
                response.status()
            )));
        }

        let profile: ClientProfile = response
            .json()
            .await
            .map_err(|e| CrmError::LookupFailed(format!("invalid profile payload: {e}")))?;

        tracing::info!(email = %normalized, name = %profile.name, "Client found in CRM");
        Ok(Some(profile))
    }
}

/// CRM disabled — every lookup misses, so requests take the degraded
/// unresolved path.
pub struct NullCrm;

#[async_trait]
impl CrmLookup for NullCrm {
    async fn lookup_client(&self, email: &str) -> Result<Option<ClientProfile>, CrmError> {
        tracing::warn!(email, "CRM not configured — client unresolved");
        Ok(None)
    }
}

/// Canonicalize a phone number to E.164 using the configured default
/// country code for bare local numbers. Returns `None` when no digits
/// survive.
pub fn canonicalize_phone(raw: &str, default_country_code: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let has_plus = trimmed.starts_with('+');
    let digits: String = trimmed.chars().filter(char::is_ascii_digit).collect();
    if digits.is_empty() {
        return None;
    }

    if has_plus {
        return Some(format!("+{digits}"));
    }

    let cc_digits: String = default_country_code
        .chars()
        .filter(char::is_ascii_digit)
        .collect();

    // Numbers already carrying the country code are left as-is.
    if !cc_digits.is_empty() && digits.starts_with(&cc_digits) && digits.len() > 10 {
        return Some(format!("+{digits}"));
    }

    Some(format!("+{cc_digits}{digits}"))
}
