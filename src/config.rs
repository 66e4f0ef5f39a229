//! Configuration types.
//!
//! Everything the engine needs is passed in explicitly at construction —
//! there is no implicit global settings object. `from_env()` constructors
//! exist for the binary; tests build these structs directly.

use secrecy::SecretString;

use crate::error::ConfigError;

/// Core engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum average score for a submission to qualify (inclusive).
    pub rating_threshold: f64,
    /// Consent token lifetime in days.
    pub token_expiry_days: i64,
    /// Maximum client-requested draft regenerations per request.
    pub max_regenerations: u32,
    /// Country code prepended to bare local WhatsApp numbers.
    pub default_country_code: String,
    /// Base URL of the landing page frontend (token is appended).
    pub frontend_url: String,
    /// Public Google Business Profile review URL shown on the landing page.
    pub gbp_review_url: String,
    /// Display name of the business being reviewed.
    pub business_name: String,
    /// Shared secret expected in the `X-Webhook-Secret` header.
    /// `None` leaves intake open (logged as a warning at startup).
    pub webhook_secret: Option<SecretString>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rating_threshold: 8.0,
            token_expiry_days: 14,
            max_regenerations: 3,
            default_country_code: "+91".to_string(),
            frontend_url: "http://localhost:8080".to_string(),
            gbp_review_url: String::new(),
            business_name: "Our Business".to_string(),
            webhook_secret: None,
        }
    }
}

impl EngineConfig {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rating_threshold = parse_env("RATING_THRESHOLD", defaults.rating_threshold)?;
        let token_expiry_days = parse_env("CONSENT_TOKEN_EXPIRY_DAYS", defaults.token_expiry_days)?;
        let max_regenerations = parse_env("MAX_REGENERATIONS", defaults.max_regenerations)?;

        Ok(Self {
            rating_threshold,
            token_expiry_days,
            max_regenerations,
            default_country_code: std::env::var("DEFAULT_COUNTRY_CODE")
                .unwrap_or(defaults.default_country_code),
            frontend_url: std::env::var("FRONTEND_URL").unwrap_or(defaults.frontend_url),
            gbp_review_url: std::env::var("GBP_REVIEW_URL").unwrap_or_default(),
            business_name: std::env::var("BUSINESS_NAME").unwrap_or(defaults.business_name),
            webhook_secret: std::env::var("WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.is_empty())
                .map(SecretString::from),
        })
    }

    /// Landing page URL for a consent token.
    pub fn landing_url(&self, token: &str) -> String {
        format!("{}/review/{}", self.frontend_url.trim_end_matches('/'), token)
    }
}

/// WhatsApp Cloud API configuration.
/// `from_env()` returns `None` when `WHATSAPP_ACCESS_TOKEN` is unset
/// (channel disabled).
#[derive(Debug, Clone)]
pub struct WhatsAppConfig {
    pub access_token: SecretString,
    pub phone_number_id: String,
    pub api_version: String,
    pub verify_token: String,
}

impl WhatsAppConfig {
    pub fn from_env() -> Option<Self> {
        let access_token = std::env::var("WHATSAPP_ACCESS_TOKEN")
            .ok()
            .filter(|s| !s.is_empty())?;

        Some(Self {
            access_token: SecretString::from(access_token),
            phone_number_id: std::env::var("WHATSAPP_PHONE_NUMBER_ID").unwrap_or_default(),
            api_version: std::env::var("WHATSAPP_API_VERSION")
                .unwrap_or_else(|_| "v18.0".to_string()),
            verify_token: std::env::var("WHATSAPP_VERIFY_TOKEN").unwrap_or_default(),
        })
    }

    /// Messages endpoint on the Graph API.
    pub fn messages_url(&self) -> String {
        format!(
            "https://graph.facebook.com/{}/{}/messages",
            self.api_version, self.phone_number_id
        )
    }
}

/// SMTP configuration for the email channel and internal alerts.
/// `from_env()` returns `None` when `SMTP_USERNAME` is unset.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub from_name: String,
}

impl SmtpConfig {
    pub fn from_env() -> Option<Self> {
        let username = std::env::var("SMTP_USERNAME")
            .ok()
            .filter(|s| !s.is_empty())?;

        let port: u16 = std::env::var("SMTP_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(587);

        Some(Self {
            host: std::env::var("SMTP_HOST").unwrap_or_else(|_| "smtp.gmail.com".to_string()),
            port,
            password: SecretString::from(std::env::var("SMTP_PASSWORD").unwrap_or_default()),
            from_address: std::env::var("SMTP_FROM_EMAIL").unwrap_or_else(|_| username.clone()),
            from_name: std::env::var("SMTP_FROM_NAME")
                .unwrap_or_else(|_| "Review Relay".to_string()),
            username,
        })
    }
}

/// Gemini draft model configuration.
/// `from_env()` returns `None` when `GEMINI_API_KEY` is unset.
#[derive(Debug, Clone)]
pub struct GeminiConfig {
    pub api_key: SecretString,
    pub model: String,
}

impl GeminiConfig {
    pub fn from_env() -> Option<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|s| !s.is_empty())?;

        Some(Self {
            api_key: SecretString::from(api_key),
            model: std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-2.0-flash".to_string()),
        })
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{e}"),
        }),
        Err(_) => Ok(default),
    }
}
