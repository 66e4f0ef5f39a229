//! Consent tokens — single-use action credentials bound to one request.
//!
//! A token authorizes landing-page actions on exactly one request, only
//! while unexpired and only while it is the request's current token.
//! Issuing a new token supersedes the previous one immediately. Expiry is
//! evaluated lazily, whenever a token is presented.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ActionError;

/// An opaque, unguessable consent token with its validity window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsentToken {
    pub value: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl ConsentToken {
    /// Check expiry against the current time.
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Constant-shape comparison against a presented token string.
    pub fn matches(&self, presented: &str) -> bool {
        self.value == presented
    }
}

/// Issues and validates consent tokens for the engine.
#[derive(Debug, Clone)]
pub struct TokenManager {
    expiry_days: i64,
}

impl TokenManager {
    pub fn new(expiry_days: i64) -> Self {
        Self { expiry_days }
    }

    /// Issue a fresh token. The caller replaces the request's current
    /// token with this one, which invalidates the old token — lookups by
    /// the superseded value fail with `TokenNotFound` from then on.
    pub fn issue(&self) -> ConsentToken {
        let now = Utc::now();
        ConsentToken {
            value: generate_value(),
            issued_at: now,
            expires_at: now + Duration::days(self.expiry_days),
        }
    }

    /// Validate a presented token against a request's current token.
    ///
    /// The `TokenExpired` branch is the caller's cue to drive the request
    /// to `Expired` as a side effect.
    pub fn validate(
        &self,
        presented: &str,
        current: Option<&ConsentToken>,
    ) -> Result<(), ActionError> {
        let token = current.ok_or(ActionError::TokenNotFound)?;

        if !token.matches(presented) {
            return Err(ActionError::InvalidToken);
        }

        if token.is_expired() {
            return Err(ActionError::TokenExpired);
        }

        Ok(())
    }
}

fn generate_value() -> String {
    Uuid::new_v4().simple().to_string()
}
