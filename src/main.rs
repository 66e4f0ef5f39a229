use std::sync::Arc;

use review_relay::alert::{AlertSink, EmailAlertSink, NullAlerts};
use review_relay::config::{EngineConfig, GeminiConfig, SmtpConfig, WhatsAppConfig};
use review_relay::crm::{CrmLookup, HttpCrm, NullCrm};
use review_relay::delivery::{DeliveryChannel, Dispatcher, EmailChannel, WhatsAppChannel};
use review_relay::draft::{DraftGenerator, DraftModel, GeminiModel, UnconfiguredModel};
use review_relay::engine::{EngineDeps, ReviewEngine};
use review_relay::http::{ApiState, api_routes};
use review_relay::mirror::{HttpMirror, SheetMirror, TracingMirror};
use review_relay::store::{LibSqlStore, MemoryStore, RequestStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    // Initialize tracing; with REVIEW_RELAY_LOG_DIR set, also write a
    // daily-rotated log file.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _appender_guard = match std::env::var("REVIEW_RELAY_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "review-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let config = EngineConfig::from_env()?;
    let whatsapp_config = WhatsAppConfig::from_env();
    let smtp_config = SmtpConfig::from_env();
    let gemini_config = GeminiConfig::from_env();

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8000);

    eprintln!("Review Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Rating threshold: {}", config.rating_threshold);
    eprintln!("   Token expiry: {} days", config.token_expiry_days);
    eprintln!("   Max regenerations: {}", config.max_regenerations);
    eprintln!(
        "   Gemini: {}",
        if gemini_config.is_some() { "configured" } else { "missing" }
    );
    eprintln!(
        "   WhatsApp: {}",
        if whatsapp_config.is_some() { "configured" } else { "missing" }
    );
    eprintln!(
        "   SMTP: {}",
        if smtp_config.is_some() { "configured" } else { "missing" }
    );
    if config.webhook_secret.is_none() {
        eprintln!("   Webhook secret: NOT SET (intake is open)");
    }

    // ── Store ───────────────────────────────────────────────────────
    let store: Arc<dyn RequestStore> = match std::env::var("REVIEW_RELAY_DB_PATH") {
        Ok(path) => {
            eprintln!("   Database: {path}");
            Arc::new(LibSqlStore::new_local(std::path::Path::new(&path)).await?)
        }
        Err(_) => {
            eprintln!("   Database: in-memory (set REVIEW_RELAY_DB_PATH to persist)");
            Arc::new(MemoryStore::new())
        }
    };
    store.run_migrations().await?;

    // ── Collaborators ───────────────────────────────────────────────
    let crm: Arc<dyn CrmLookup> = match std::env::var("CRM_LOOKUP_URL") {
        Ok(url) => Arc::new(HttpCrm::new(url)),
        Err(_) => Arc::new(NullCrm),
    };

    let model: Arc<dyn DraftModel> = match gemini_config {
        Some(gemini) => Arc::new(GeminiModel::new(gemini)),
        None => Arc::new(UnconfiguredModel),
    };
    let drafts = Arc::new(DraftGenerator::new(model, config.business_name.clone()));

    let mut channels: Vec<Arc<dyn DeliveryChannel>> = Vec::new();
    if let Some(wa) = whatsapp_config.clone() {
        channels.push(Arc::new(WhatsAppChannel::new(wa)));
    }
    if let Some(smtp) = smtp_config.clone() {
        channels.push(Arc::new(EmailChannel::new(smtp)));
    }
    if channels.is_empty() {
        eprintln!("   WARNING: no delivery channels configured — requests will stay QUALIFIED");
    }
    let dispatcher = Arc::new(Dispatcher::new(channels));

    let alerts: Arc<dyn AlertSink> = match (&smtp_config, std::env::var("ALERT_EMAILS").ok()) {
        (Some(smtp), Some(raw)) if !raw.trim().is_empty() => Arc::new(EmailAlertSink::new(
            smtp.clone(),
            EmailAlertSink::parse_recipients(&raw),
        )),
        _ => Arc::new(NullAlerts),
    };

    let mirror: Arc<dyn SheetMirror> = match std::env::var("SHEET_MIRROR_URL") {
        Ok(url) => Arc::new(HttpMirror::new(
            url,
            std::env::var("SHEET_MIRROR_SECRET")
                .ok()
                .map(secrecy::SecretString::from),
        )),
        Err(_) => Arc::new(TracingMirror),
    };

    // ── Engine + server ─────────────────────────────────────────────
    let engine = Arc::new(ReviewEngine::new(
        config,
        EngineDeps {
            store,
            crm,
            drafts,
            dispatcher,
            alerts,
            mirror,
        },
    ));

    let app = api_routes(ApiState {
        engine,
        whatsapp: whatsapp_config,
    });

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    tracing::info!(port, "Review Relay listening");
    eprintln!("   Listening on 0.0.0.0:{port}\n");
    axum::serve(listener, app).await?;

    Ok(())
}
