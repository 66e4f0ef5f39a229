//! Orchestration — drives a submission through qualification, draft
//! generation, token issuance, delivery, and the terminal client actions.
//!
//! **Core invariant: request-scoped single writer.** All mutations for one
//! request id run under a per-key async lock, and every persisted write is
//! compare-and-set against the status that was read under that lock. A
//! replayed webhook, a duplicate click, and an overlapping regenerate all
//! serialize against the same consistent state.
//!
//! External calls (CRM, draft model, delivery, store) are the only suspend
//! points; the transition logic itself is synchronous.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::alert::{AlertReason, AlertSink};
use crate::config::EngineConfig;
use crate::crm::{CrmLookup, canonicalize_phone};
use crate::delivery::{DeliveryMethod, DeliveryPayload, Dispatcher};
use crate::draft::DraftGenerator;
use crate::error::{ActionError, Error, QualifyError, StoreError};
use crate::mirror::SheetMirror;
use crate::qualify;
use crate::store::RequestStore;
use crate::submission::{RawSubmission, SubmissionKey, normalize};
use crate::token::TokenManager;

use super::request::{RequestStatus, ReviewRequest};

/// Days after delivery before a reminder nudge is sent.
const REMINDER_AFTER_DAYS: i64 = 3;

/// External collaborators the engine drives.
pub struct EngineDeps {
    pub store: Arc<dyn RequestStore>,
    pub crm: Arc<dyn CrmLookup>,
    pub drafts: Arc<DraftGenerator>,
    pub dispatcher: Arc<Dispatcher>,
    pub alerts: Arc<dyn AlertSink>,
    pub mirror: Arc<dyn SheetMirror>,
}

/// Result of processing one inbound form webhook.
#[derive(Debug, Clone, PartialEq)]
pub enum IntakeOutcome {
    /// The natural key already exists and has a recorded outcome — no-op.
    Duplicate { status: RequestStatus },
    /// Submission did not qualify; alerting was notified. No request
    /// exists.
    Disqualified {
        reason: &'static str,
        average: Option<f64>,
    },
    /// Draft delivered; awaiting client action.
    Sent {
        method: DeliveryMethod,
        average: f64,
    },
    /// Request exists but nothing was delivered — `Qualified` (retryable)
    /// or `Unresolved` (no destination). Details are in the error log.
    Undelivered {
        status: RequestStatus,
        average: f64,
    },
}

/// Landing page view for a consent token.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReviewView {
    pub client_name: String,
    pub business_name: String,
    pub draft_text: String,
    /// 1-5 stars derived from the 1-10 average.
    pub rating: u8,
    pub gbp_review_url: String,
    pub status: String,
    pub regeneration_count: u32,
    pub max_regenerations: u32,
}

/// Result of a successful client-requested regeneration.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RegenerateOutcome {
    pub draft_text: String,
    pub token: String,
    pub regeneration_count: u32,
    pub max_regenerations: u32,
}

/// Summary of one reminder sweep.
#[derive(Debug, Default, Clone, serde::Serialize)]
pub struct ReminderReport {
    pub reminded: usize,
    pub expired: usize,
    pub failed: usize,
}

/// The workflow engine. One instance coordinates all in-flight requests;
/// different request ids proceed fully in parallel.
pub struct ReviewEngine {
    config: EngineConfig,
    deps: EngineDeps,
    tokens: TokenManager,
    locks: Mutex<HashMap<SubmissionKey, Arc<Mutex<()>>>>,
}

impl ReviewEngine {
    pub fn new(config: EngineConfig, deps: EngineDeps) -> Self {
        let tokens = TokenManager::new(config.token_expiry_days);
        Self {
            config,
            deps,
            tokens,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Per-request mutual exclusion: all transitions for one key are
    /// evaluated under this lock so no event sees a stale snapshot.
    async fn request_lock(&self, key: &SubmissionKey) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    // ── Intake ──────────────────────────────────────────────────────

    /// Process one inbound form webhook payload.
    ///
    /// Idempotent on the natural key: a replay for a request that already
    /// has a recorded delivery (or terminal outcome) is a no-op; a replay
    /// for a request still stuck in `Qualified` retries the delivery
    /// cycle.
    pub async fn handle_submission(&self, raw: &RawSubmission) -> Result<IntakeOutcome, Error> {
        let record = normalize(raw)?;
        let key = record.key.clone();

        info!(key = %key, email = %record.email, "Processing form submission");

        let lock = self.request_lock(&key).await;
        let _guard = lock.lock().await;

        // Replay detection by natural key.
        if let Some(mut existing) = self.deps.store.get(&key).await? {
            if existing.status == RequestStatus::Qualified {
                info!(key = %key, "Replay for undelivered request — retrying delivery");
                let outcome = self.run_delivery_cycle(&mut existing).await?;
                return Ok(outcome);
            }
            info!(key = %key, status = %existing.status, "Duplicate submission — no-op");
            return Ok(IntakeOutcome::Duplicate {
                status: existing.status,
            });
        }

        self.audit("FORM_SUBMIT", &key, &format!("submission from {}", record.email))
            .await;

        // Qualification gate — a one-way branch.
        let qualification = match qualify::evaluate(&record, self.config.rating_threshold) {
            Ok(result) => result,
            Err(QualifyError::NoScoresProvided) => {
                self.alert(&record, None, None, AlertReason::NoScores).await;
                self.audit("ALERT_SENT", &key, "no scores provided").await;
                return Ok(IntakeOutcome::Disqualified {
                    reason: "no_scores",
                    average: None,
                });
            }
        };

        if !qualification.qualified {
            self.alert(&record, None, Some(qualification.average), AlertReason::LowRating)
                .await;
            self.audit(
                "ALERT_SENT",
                &key,
                &format!("low rating: {:.2}", qualification.average),
            )
            .await;
            return Ok(IntakeOutcome::Disqualified {
                reason: "low_rating",
                average: Some(qualification.average),
            });
        }

        if !record.testimonial_consent {
            self.alert(
                &record,
                None,
                Some(qualification.average),
                AlertReason::ConsentDeclined,
            )
            .await;
            self.audit("ALERT_SENT", &key, "testimonial consent declined").await;
            return Ok(IntakeOutcome::Disqualified {
                reason: "consent_declined",
                average: Some(qualification.average),
            });
        }

        if let Some(keyword) = record
            .feedback
            .as_deref()
            .and_then(qualify::negative_sentiment)
        {
            warn!(key = %key, keyword, "Negative sentiment despite qualifying average");
            self.alert(
                &record,
                None,
                Some(qualification.average),
                AlertReason::NegativeSentiment,
            )
            .await;
            self.audit("ALERT_SENT", &key, &format!("negative sentiment: {keyword}"))
                .await;
            return Ok(IntakeOutcome::Disqualified {
                reason: "negative_sentiment",
                average: Some(qualification.average),
            });
        }

        // Resolve the client once; the snapshot sticks for the request's
        // lifetime.
        let client = match self.deps.crm.lookup_client(&record.email).await {
            Ok(Some(mut profile)) => {
                profile.whatsapp = profile
                    .whatsapp
                    .as_deref()
                    .and_then(|n| canonicalize_phone(n, &self.config.default_country_code));
                Some(profile)
            }
            Ok(None) => {
                warn!(key = %key, email = %record.email, "Client not found in CRM");
                None
            }
            Err(e) => {
                error!(key = %key, error = %e, "CRM lookup failed");
                None
            }
        };
        let unresolved = client.is_none();

        let mut request = ReviewRequest::new(
            record,
            qualification,
            client,
            self.config.max_regenerations,
        );

        if unresolved {
            let not_found = crate::error::CrmError::ClientNotFound {
                email: request.record.email.clone(),
            };
            request.log_error("crm", not_found.to_string());
            self.alert(
                &request.record,
                None,
                Some(qualification.average),
                AlertReason::ClientUnresolved,
            )
            .await;
        }

        // Another worker may have inserted between our get and now; the
        // unique key makes the race harmless.
        match self.deps.store.insert(&request).await {
            Ok(()) => {}
            Err(StoreError::AlreadyExists { .. }) => {
                let status = self
                    .deps
                    .store
                    .get(&key)
                    .await?
                    .map(|r| r.status)
                    .unwrap_or(RequestStatus::Qualified);
                return Ok(IntakeOutcome::Duplicate { status });
            }
            Err(e) => return Err(e.into()),
        }

        self.audit(
            "QUALIFIED",
            &key,
            &format!("avg {:.2}, consent yes", qualification.average),
        )
        .await;

        self.run_delivery_cycle(&mut request).await
    }

    /// One delivery cycle for a request that exists in the store: draft if
    /// missing, token if missing, then dispatch with fallback. Never
    /// fails the pipeline — failures land in the error log and the request
    /// stays retryable.
    async fn run_delivery_cycle(
        &self,
        request: &mut ReviewRequest,
    ) -> Result<IntakeOutcome, Error> {
        let expected = request.status;
        let average = request.qualification.average;

        if request.draft_text.is_empty() {
            let generated = self
                .deps
                .drafts
                .generate_draft(
                    &request.record,
                    request.client.as_ref(),
                    &request.qualification,
                    request.regeneration_count,
                )
                .await;

            match generated {
                Ok(draft) => {
                    self.audit(
                        "AI_DRAFT_GENERATED",
                        request.key(),
                        &format!("{} chars", draft.len()),
                    )
                    .await;
                    request.draft_text = draft;
                }
                Err(e) => {
                    error!(key = %request.key(), error = %e, "Draft generation failed");
                    request.log_error("draft", e.to_string());
                    self.persist(request, expected).await?;
                    return Ok(IntakeOutcome::Undelivered {
                        status: request.status,
                        average,
                    });
                }
            }
        }

        let token = match &request.token {
            Some(token) => token.clone(),
            None => {
                let token = self.tokens.issue();
                request.token = Some(token.clone());
                token
            }
        };

        let Some(client) = request.client.clone() else {
            request.log_error("delivery", "no destination: client unresolved");
            self.persist(request, expected).await?;
            return Ok(IntakeOutcome::Undelivered {
                status: request.status,
                average,
            });
        };
        let landing_url = self.config.landing_url(&token.value);
        let outcome = {
            let payload = DeliveryPayload {
                client: &client,
                draft_text: &request.draft_text,
                landing_url: &landing_url,
                token: &token.value,
                reminder: false,
            };
            self.deps.dispatcher.dispatch(&payload).await
        };
        for (method, reason) in &outcome.failures {
            request.log_error("delivery", format!("{method}: {reason}"));
        }

        match outcome.delivered {
            Some((method, _message_id)) => {
                request.mark_sent(method);
                self.persist(request, expected).await?;
                self.audit(
                    "NOTIFICATION_SENT",
                    request.key(),
                    &format!("method {method}"),
                )
                .await;
                Ok(IntakeOutcome::Sent { method, average })
            }
            None => {
                warn!(key = %request.key(), "All delivery channels failed — request stays retryable");
                self.persist(request, expected).await?;
                Ok(IntakeOutcome::Undelivered {
                    status: request.status,
                    average,
                })
            }
        }
    }

    // ── Landing actions ─────────────────────────────────────────────

    /// Landing page data for a consent token. Read-only apart from the
    /// lazy expiry transition.
    pub async fn review_view(&self, presented: &str) -> Result<ReviewView, Error> {
        let (mut request, lock) = self.load_by_token(presented).await?;
        let _guard = lock.lock().await;
        self.refresh(&mut request).await?;

        let token = request
            .token
            .clone()
            .filter(|t| t.matches(presented))
            .ok_or(ActionError::TokenNotFound)?;

        // Terminal requests still render — the page shows the outcome.
        if !request.status.is_terminal() && token.is_expired() {
            self.expire(&mut request).await?;
            return Err(ActionError::TokenExpired.into());
        }

        Ok(self.view_of(&request))
    }

    /// Client copied the review — terminal.
    pub async fn mark_copied(&self, presented: &str) -> Result<(), Error> {
        self.finalize(presented, RequestStatus::Copied, "REVIEW_COPIED")
            .await
    }

    /// Client opted out — terminal.
    pub async fn decline(&self, presented: &str) -> Result<(), Error> {
        self.finalize(presented, RequestStatus::Declined, "REVIEW_DECLINED")
            .await
    }

    /// Client asked for a different draft.
    ///
    /// Below the cap: new draft, fresh token (superseding the old one),
    /// re-delivery, back to `Sent`. At the cap: the request transitions to
    /// the terminal `RegenLimitReached` and the action is rejected.
    pub async fn regenerate(&self, presented: &str) -> Result<RegenerateOutcome, Error> {
        let (mut request, lock) = self.load_by_token(presented).await?;
        let _guard = lock.lock().await;
        self.refresh(&mut request).await?;

        let expected = request.status;
        if let Err(e) = request.guard_action(presented) {
            if matches!(e, ActionError::TokenExpired) {
                self.expire(&mut request).await?;
            }
            return Err(e.into());
        }

        if !request.can_regenerate() {
            let max = request.max_regenerations;
            request.mark_regen_limit();
            self.persist(&request, expected).await?;
            self.audit(
                "REGEN_LIMIT_REACHED",
                request.key(),
                &format!("cap of {max} reached"),
            )
            .await;
            return Err(ActionError::RegenLimitReached { max }.into());
        }

        let regen_index = request.regeneration_count + 1;
        let draft = self
            .deps
            .drafts
            .generate_draft(
                &request.record,
                request.client.as_ref(),
                &request.qualification,
                regen_index,
            )
            .await;

        let draft = match draft {
            Ok(draft) => draft,
            Err(e) => {
                // Status unchanged; the old draft and token remain live.
                request.log_error("regenerate", e.to_string());
                self.persist(&request, expected).await?;
                return Err(ActionError::RegenerationFailed(e.to_string()).into());
            }
        };

        let token = self.tokens.issue();
        request.apply_regeneration(draft, token.clone());

        // Re-deliver with the fresh link; the channel choice is
        // independent of the previous cycle. A failed re-delivery is
        // logged but does not roll back the regeneration — the caller
        // receives the new draft and token directly.
        if let Some(client) = request.client.clone() {
            let landing_url = self.config.landing_url(&token.value);
            let outcome = {
                let payload = DeliveryPayload {
                    client: &client,
                    draft_text: &request.draft_text,
                    landing_url: &landing_url,
                    token: &token.value,
                    reminder: false,
                };
                self.deps.dispatcher.dispatch(&payload).await
            };
            for (method, reason) in &outcome.failures {
                request.log_error("delivery", format!("{method}: {reason}"));
            }
            if let Some((method, _)) = outcome.delivered {
                request.delivery_method = method;
            }
        }

        self.persist(&request, expected).await?;
        self.audit(
            "REGENERATED",
            request.key(),
            &format!(
                "{} of {}",
                request.regeneration_count, request.max_regenerations
            ),
        )
        .await;

        Ok(RegenerateOutcome {
            draft_text: request.draft_text.clone(),
            token: token.value,
            regeneration_count: request.regeneration_count,
            max_regenerations: request.max_regenerations,
        })
    }

    // ── Reminder sweep ──────────────────────────────────────────────

    /// Re-notify `Sent` requests that have been waiting too long. Driven
    /// by an external scheduler; requests past token expiry are counted
    /// but left for the lazy expiry check to finalize.
    pub async fn send_reminders(&self) -> Result<ReminderReport, Error> {
        let mut report = ReminderReport::default();
        let sent = self.deps.store.list_by_status(RequestStatus::Sent).await?;

        for stale in sent {
            let key = stale.record.key.clone();
            let lock = self.request_lock(&key).await;
            let _guard = lock.lock().await;

            let Some(request) = self.deps.store.get(&key).await? else {
                continue;
            };
            if request.status != RequestStatus::Sent {
                continue;
            }

            let Some(token) = request.token.clone() else {
                continue;
            };
            if token.is_expired() {
                report.expired += 1;
                continue;
            }

            let age_days = request
                .sent_at
                .map(|t| (Utc::now() - t).num_days())
                .unwrap_or(0);
            if age_days < REMINDER_AFTER_DAYS {
                continue;
            }

            let Some(client) = request.client.clone() else {
                continue;
            };
            let landing_url = self.config.landing_url(&token.value);
            let payload = DeliveryPayload {
                client: &client,
                draft_text: &request.draft_text,
                landing_url: &landing_url,
                token: &token.value,
                reminder: true,
            };

            let outcome = self.deps.dispatcher.dispatch(&payload).await;
            if outcome.delivered.is_some() {
                report.reminded += 1;
                self.audit("REMINDER_SENT", &key, &format!("{} days old", age_days))
                    .await;
            } else {
                report.failed += 1;
            }
        }

        info!(
            reminded = report.reminded,
            expired = report.expired,
            failed = report.failed,
            "Reminder sweep complete"
        );
        Ok(report)
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Resolve a token to its request and per-key lock. The request must
    /// be re-read under the lock before evaluating guards.
    async fn load_by_token(
        &self,
        presented: &str,
    ) -> Result<(ReviewRequest, Arc<Mutex<()>>), Error> {
        let request = self
            .deps
            .store
            .find_by_token(presented)
            .await?
            .ok_or(ActionError::TokenNotFound)?;
        let lock = self.request_lock(&request.record.key).await;
        Ok((request, lock))
    }

    /// Re-read the request under its lock so guards never see a stale
    /// snapshot.
    async fn refresh(&self, request: &mut ReviewRequest) -> Result<(), Error> {
        let fresh = self
            .deps
            .store
            .get(&request.record.key)
            .await?
            .ok_or(ActionError::TokenNotFound)?;
        *request = fresh;
        Ok(())
    }

    /// Shared copy/decline path.
    async fn finalize(
        &self,
        presented: &str,
        target: RequestStatus,
        audit_event: &str,
    ) -> Result<(), Error> {
        let (mut request, lock) = self.load_by_token(presented).await?;
        let _guard = lock.lock().await;
        self.refresh(&mut request).await?;

        let expected = request.status;
        if let Err(e) = request.guard_action(presented) {
            if matches!(e, ActionError::TokenExpired) {
                self.expire(&mut request).await?;
            }
            return Err(e.into());
        }

        match target {
            RequestStatus::Copied => request.mark_copied(),
            RequestStatus::Declined => request.mark_declined(),
            _ => unreachable!("finalize only targets Copied/Declined"),
        }

        self.persist(&request, expected).await?;
        self.audit(audit_event, request.key(), &format!("now {}", request.status))
            .await;
        Ok(())
    }

    /// Lazy expiry: a presented-but-expired token drives `Sent` to
    /// `Expired`.
    async fn expire(&self, request: &mut ReviewRequest) -> Result<(), Error> {
        if request.status != RequestStatus::Sent {
            return Ok(());
        }
        let expected = request.status;
        request.mark_expired();
        self.persist(request, expected).await?;
        self.audit("TOKEN_EXPIRED", request.key(), "expired on access")
            .await;
        Ok(())
    }

    /// Commit a mutated request (CAS) and project it to the mirror.
    async fn persist(
        &self,
        request: &ReviewRequest,
        expected: RequestStatus,
    ) -> Result<(), Error> {
        self.deps.store.update(request, expected).await?;
        if let Err(e) = self.deps.mirror.project(request).await {
            warn!(key = %request.key(), error = %e, "Mirror projection failed");
        }
        Ok(())
    }

    async fn audit(&self, event: &str, key: &SubmissionKey, detail: &str) {
        if let Err(e) = self
            .deps
            .mirror
            .audit(event, &format!("row_{}", key.row_number), detail)
            .await
        {
            warn!(key = %key, error = %e, "Mirror audit failed");
        }
    }

    async fn alert(
        &self,
        record: &crate::submission::SubmissionRecord,
        client: Option<&crate::crm::ClientProfile>,
        average: Option<f64>,
        reason: AlertReason,
    ) {
        if let Err(e) = self
            .deps
            .alerts
            .notify_low_rating(record, client, average, reason)
            .await
        {
            warn!(key = %record.key, error = %e, "Alert dispatch failed");
        }
    }

    fn view_of(&self, request: &ReviewRequest) -> ReviewView {
        let stars = (request.qualification.average / 2.0).round() as i64;
        ReviewView {
            client_name: request
                .client
                .as_ref()
                .map(|c| c.name.clone())
                .unwrap_or_else(|| "Valued Client".to_string()),
            business_name: self.config.business_name.clone(),
            draft_text: request.draft_text.clone(),
            rating: stars.clamp(1, 5) as u8,
            gbp_review_url: self.config.gbp_review_url.clone(),
            status: request.status.to_string(),
            regeneration_count: request.regeneration_count,
            max_regenerations: request.max_regenerations,
        }
    }
}
