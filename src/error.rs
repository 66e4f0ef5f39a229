//! Error types for Review Relay.

use crate::submission::SubmissionKey;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Intake error: {0}")]
    Intake(#[from] IntakeError),

    #[error("Qualification error: {0}")]
    Qualify(#[from] QualifyError),

    #[error("CRM error: {0}")]
    Crm(#[from] CrmError),

    #[error("Draft error: {0}")]
    Draft(#[from] DraftError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Action error: {0}")]
    Action(#[from] ActionError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Intake validation errors — malformed webhook payloads.
///
/// Identity fields (sheet id, row number, email) are strict; score fields
/// are parse-or-null and never produce one of these.
#[derive(Debug, thiserror::Error)]
pub enum IntakeError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Qualification errors. `NoScoresProvided` is a business outcome
/// (unqualified), not a pipeline fault.
#[derive(Debug, thiserror::Error)]
pub enum QualifyError {
    #[error("No scores provided")]
    NoScoresProvided,
}

/// CRM lookup errors.
#[derive(Debug, thiserror::Error)]
pub enum CrmError {
    #[error("Client not found for {email}")]
    ClientNotFound { email: String },

    #[error("CRM lookup failed: {0}")]
    LookupFailed(String),
}

/// Draft generation errors.
#[derive(Debug, thiserror::Error)]
pub enum DraftError {
    #[error("Draft generation failed after {attempts} attempts: {reason}")]
    GenerationFailed { attempts: u32, reason: String },

    #[error("Draft model {model} request failed: {reason}")]
    RequestFailed { model: String, reason: String },

    #[error("Invalid response from {model}: {reason}")]
    InvalidResponse { model: String, reason: String },

    #[error("Draft model not configured")]
    NotConfigured,
}

/// Delivery channel errors.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("Channel {channel} is not configured")]
    NotConfigured { channel: String },

    #[error("No reachable destination for {channel}")]
    NoDestination { channel: String },

    #[error("Send failed on {channel}: {reason}")]
    SendFailed { channel: String, reason: String },
}

/// Alerting errors. Alerts are fire-and-forget; these are logged, never
/// propagated into the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("Alert dispatch failed: {0}")]
    SendFailed(String),
}

/// Mirror projection errors. The mirror is a write-only view; failures are
/// logged and the committed transition stands.
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Mirror write failed: {0}")]
    WriteFailed(String),
}

/// Client-action errors — rejected token-authenticated actions.
#[derive(Debug, thiserror::Error)]
pub enum ActionError {
    #[error("Token not found")]
    TokenNotFound,

    #[error("Invalid token for this request")]
    InvalidToken,

    #[error("Token expired")]
    TokenExpired,

    #[error("Request already finalized in status {status}")]
    RequestAlreadyFinalized { status: String },

    #[error("Regeneration limit reached ({max} regenerations used)")]
    RegenLimitReached { max: u32 },

    #[error("Draft regeneration failed: {0}")]
    RegenerationFailed(String),
}

/// Persistence errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Request {key} already exists")]
    AlreadyExists { key: SubmissionKey },

    #[error("Concurrent update conflict on {key}: expected status {expected}")]
    Conflict { key: SubmissionKey, expected: String },

    #[error("Request {key} not found")]
    NotFound { key: SubmissionKey },

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;
