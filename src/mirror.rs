//! Spreadsheet mirror — the human-visible projection of request state.
//!
//! The engine writes here after each committed transition; it never reads
//! back. Transition guards are evaluated against the engine-owned store
//! only, so manual edits to the sheet can't corrupt the state machine.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;

use crate::engine::request::ReviewRequest;
use crate::error::MirrorError;

/// Write-only spreadsheet projection plus an audit trail.
#[async_trait]
pub trait SheetMirror: Send + Sync {
    /// Project the current request state onto its sheet row.
    async fn project(&self, request: &ReviewRequest) -> Result<(), MirrorError>;

    /// Append an audit event for human visibility.
    async fn audit(&self, event: &str, subject: &str, detail: &str) -> Result<(), MirrorError>;
}

/// Serialize the row update the sheet receives for a request.
fn row_projection(request: &ReviewRequest) -> serde_json::Value {
    json!({
        "sheet_id": request.key().sheet_id,
        "row_number": request.key().row_number,
        "status": request.status.to_string(),
        "avg_rating": request.qualification.average,
        "qualified": if request.qualification.qualified { "YES" } else { "NO" },
        "client_name": request.client.as_ref().map(|c| c.name.clone()),
        "company": request.client.as_ref().map(|c| c.company.clone()),
        "whatsapp": request.client.as_ref().and_then(|c| c.whatsapp.clone()),
        "business_email": request.client.as_ref().map(|c| c.business_email.clone()),
        "draft_text": request.draft_text,
        "token": request.token.as_ref().map(|t| t.value.clone()),
        "delivery_method": request.delivery_method.to_string(),
        "regen_count": request.regeneration_count,
        "sent_at": request.sent_at.map(|t| t.to_rfc3339()),
        "copied_at": request.copied_at.map(|t| t.to_rfc3339()),
        "last_error": request.error_log.last().map(|e| e.message.clone()),
    })
}

/// Mirror over an HTTP endpoint (e.g. an Apps Script web app that applies
/// row updates and appends audit rows).
pub struct HttpMirror {
    http: reqwest::Client,
    endpoint: String,
    secret: Option<SecretString>,
}

impl HttpMirror {
    pub fn new(endpoint: impl Into<String>, secret: Option<SecretString>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into(),
            secret,
        }
    }

    async fn post(&self, body: serde_json::Value) -> Result<(), MirrorError> {
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(secret) = &self.secret {
            request = request.header("X-Webhook-Secret", secret.expose_secret());
        }

        let response = request
            .send()
            .await
            .map_err(|e| MirrorError::WriteFailed(format!("transport error: {e}")))?;

        if !response.status().is_success() {
            return Err(MirrorError::WriteFailed(format!(
                "mirror endpoint returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}

#[async_trait]
impl SheetMirror for HttpMirror {
    async fn project(&self, request: &ReviewRequest) -> Result<(), MirrorError> {
        self.post(json!({
            "kind": "row_update",
            "row": row_projection(request),
        }))
        .await
    }

    async fn audit(&self, event: &str, subject: &str, detail: &str) -> Result<(), MirrorError> {
        self.post(json!({
            "kind": "audit",
            "event": event,
            "subject": subject,
            "detail": detail,
        }))
        .await
    }
}

/// Mirror disabled — projections land in the log instead of a sheet.
pub struct TracingMirror;

#[async_trait]
impl SheetMirror for TracingMirror {
    async fn project(&self, request: &ReviewRequest) -> Result<(), MirrorError> {
        tracing::debug!(
            key = %request.key(),
            status = %request.status,
            delivery = %request.delivery_method,
            regen_count = request.regeneration_count,
            "Mirror projection"
        );
        Ok(())
    }

    async fn audit(&self, event: &str, subject: &str, detail: &str) -> Result<(), MirrorError> {
        tracing::debug!(event, subject, detail, "Mirror audit");
        Ok(())
    }
}
