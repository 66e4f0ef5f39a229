//! REST endpoints: form webhook intake, WhatsApp callback webhook, and the
//! token-authenticated landing page actions.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::warn;

use crate::config::WhatsAppConfig;
use crate::delivery::whatsapp::verify_webhook;
use crate::engine::{IntakeOutcome, ReviewEngine};
use crate::error::{ActionError, Error};
use crate::submission::RawSubmission;

/// Shared state for all routes.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<ReviewEngine>,
    pub whatsapp: Option<WhatsAppConfig>,
}

/// Build the API router.
pub fn api_routes(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhook/form", post(form_webhook))
        .route(
            "/api/webhook/whatsapp",
            get(whatsapp_verify).post(whatsapp_callback),
        )
        .route("/api/review/{token}", get(get_review))
        .route("/api/review/{token}/copied", post(review_copied))
        .route("/api/review/{token}/declined", post(review_declined))
        .route("/api/review/{token}/regenerate", post(review_regenerate))
        .route("/api/reviews/send-reminders", post(send_reminders))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── System ──────────────────────────────────────────────────────────

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    let config = state.engine.config();
    Json(json!({
        "status": "healthy",
        "service": "review-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "whatsapp": if state.whatsapp.is_some() { "configured" } else { "missing" },
            "gbp_url": if config.gbp_review_url.is_empty() { "missing" } else { "configured" },
            "webhook_secret": if config.webhook_secret.is_some() { "configured" } else { "NOT SET" },
        },
    }))
}

// ── Form intake ─────────────────────────────────────────────────────

/// Check the shared-secret header. An unset secret leaves intake open.
fn check_secret(state: &ApiState, headers: &HeaderMap) -> bool {
    let Some(expected) = state.engine.config().webhook_secret.as_ref() else {
        return true;
    };
    headers
        .get("x-webhook-secret")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|presented| presented == expected.expose_secret())
}

async fn form_webhook(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(raw): Json<RawSubmission>,
) -> impl IntoResponse {
    if !check_secret(&state, &headers) {
        warn!("Webhook auth failed");
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "message": "Invalid webhook secret"})),
        );
    }

    match state.engine.handle_submission(&raw).await {
        Ok(outcome) => {
            let (message, data) = describe_outcome(&outcome);
            (
                StatusCode::OK,
                Json(json!({"success": true, "message": message, "data": data})),
            )
        }
        Err(Error::Intake(e)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "message": e.to_string()})),
        ),
        Err(e) => {
            warn!(error = %e, "Form webhook processing failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "message": e.to_string()})),
            )
        }
    }
}

fn describe_outcome(outcome: &IntakeOutcome) -> (String, serde_json::Value) {
    match outcome {
        IntakeOutcome::Duplicate { status } => (
            "Duplicate submission — previous request is still tracked".to_string(),
            json!({"duplicate": true, "status": status.to_string()}),
        ),
        IntakeOutcome::Disqualified { reason, average } => (
            "Submission did not qualify — internal alert sent".to_string(),
            json!({"qualified": false, "reason": reason, "avg_rating": average}),
        ),
        IntakeOutcome::Sent { method, average } => (
            format!("Qualified submission processed — notification sent via {method}"),
            json!({"qualified": true, "avg_rating": average, "delivery_method": method.to_string()}),
        ),
        IntakeOutcome::Undelivered { status, average } => (
            "Qualified but not delivered — see error log".to_string(),
            json!({"qualified": true, "avg_rating": average, "status": status.to_string()}),
        ),
    }
}

// ── WhatsApp callbacks ──────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VerifyParams {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// Meta webhook subscription verification — echo the challenge.
async fn whatsapp_verify(
    State(state): State<ApiState>,
    Query(params): Query<VerifyParams>,
) -> impl IntoResponse {
    let (Some(config), Some(mode), Some(token), Some(challenge)) = (
        state.whatsapp.as_ref(),
        params.mode.as_deref(),
        params.verify_token.as_deref(),
        params.challenge.as_deref(),
    ) else {
        return (StatusCode::BAD_REQUEST, String::new());
    };

    match verify_webhook(config, mode, token, challenge) {
        Some(challenge) => (StatusCode::OK, challenge.to_string()),
        None => (StatusCode::FORBIDDEN, String::new()),
    }
}

/// Button replies from WhatsApp arrive as `action_token` payloads. They
/// route into the same engine actions as the landing page, so replays and
/// out-of-order callbacks hit the same guards. Always answers 200 to keep
/// Meta from retry-flooding.
async fn whatsapp_callback(
    State(state): State<ApiState>,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let Some(button_id) = body
        .pointer("/entry/0/changes/0/value/messages/0/interactive/button_reply/id")
        .and_then(|v| v.as_str())
    else {
        // Status updates and free-text messages are acknowledged as-is.
        return Json(json!({"success": true, "message": "No actionable message"}));
    };

    let Some((action, token)) = button_id.split_once('_') else {
        return Json(json!({"success": false, "message": "Malformed button payload"}));
    };

    let result = match action {
        "copy" => state.engine.mark_copied(token).await.map(|_| "copied"),
        "decline" => state.engine.decline(token).await.map(|_| "declined"),
        "regenerate" => state.engine.regenerate(token).await.map(|_| "regenerated"),
        other => {
            warn!(action = other, "Unknown WhatsApp action");
            return Json(json!({"success": false, "message": "Unknown action"}));
        }
    };

    match result {
        Ok(did) => Json(json!({"success": true, "message": did})),
        Err(e) => {
            warn!(error = %e, "WhatsApp action rejected");
            Json(json!({"success": false, "message": e.to_string()}))
        }
    }
}

// ── Landing page ────────────────────────────────────────────────────

async fn get_review(State(state): State<ApiState>, Path(token): Path<String>) -> impl IntoResponse {
    match state.engine.review_view(&token).await {
        Ok(view) => (StatusCode::OK, Json(serde_json::to_value(view).unwrap_or_default())),
        Err(e) => action_error(e),
    }
}

async fn review_copied(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.engine.mark_copied(&token).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": "Copy event recorded"})),
        ),
        Err(e) => action_error(e),
    }
}

async fn review_declined(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.engine.decline(&token).await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({"success": true, "message": "Decline recorded"})),
        ),
        Err(e) => action_error(e),
    }
}

async fn review_regenerate(
    State(state): State<ApiState>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match state.engine.regenerate(&token).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(serde_json::to_value(outcome).unwrap_or_default()),
        ),
        Err(e) => action_error(e),
    }
}

/// Map engine errors onto client-facing statuses. Unknown and foreign
/// tokens both read as "not found" so token guessing learns nothing.
fn action_error(error: Error) -> (StatusCode, Json<serde_json::Value>) {
    let (status, message) = match &error {
        Error::Action(ActionError::TokenNotFound) | Error::Action(ActionError::InvalidToken) => (
            StatusCode::NOT_FOUND,
            "Review not found or link is invalid".to_string(),
        ),
        Error::Action(ActionError::TokenExpired) => (
            StatusCode::GONE,
            "This review link has expired. Please contact us for a new one.".to_string(),
        ),
        Error::Action(ActionError::RequestAlreadyFinalized { status }) => (
            StatusCode::CONFLICT,
            format!("This review was already finalized ({status})"),
        ),
        Error::Action(ActionError::RegenLimitReached { max }) => (
            StatusCode::CONFLICT,
            format!("Regeneration limit of {max} reached"),
        ),
        Error::Action(ActionError::RegenerationFailed(_)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to generate a new draft. Please try again later.".to_string(),
        ),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal error".to_string(),
        ),
    };

    (status, Json(json!({"success": false, "message": message})))
}

// ── Reminder sweep ──────────────────────────────────────────────────

async fn send_reminders(State(state): State<ApiState>, headers: HeaderMap) -> impl IntoResponse {
    if !check_secret(&state, &headers) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "message": "Invalid webhook secret"})),
        );
    }

    match state.engine.send_reminders().await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({
                "success": true,
                "reminded": report.reminded,
                "expired": report.expired,
                "failed": report.failed,
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"success": false, "message": e.to_string()})),
        ),
    }
}
