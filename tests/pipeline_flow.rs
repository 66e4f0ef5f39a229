//! End-to-end engine behavior with mock collaborators: qualification,
//! delivery fallback, idempotent intake, token lifecycle, regeneration
//! bounds, terminal stickiness, and per-request serialization.

mod common;

use std::sync::atomic::Ordering;

use common::*;
use review_relay::alert::AlertReason;
use review_relay::config::EngineConfig;
use review_relay::delivery::DeliveryMethod;
use review_relay::engine::{IntakeOutcome, RequestStatus};
use review_relay::error::{ActionError, Error};
use review_relay::store::RequestStore;
use review_relay::submission::{RawSubmission, SubmissionKey};

fn key(row: u32) -> SubmissionKey {
    SubmissionKey::new("sheet-1", row)
}

async fn current_token(harness: &Harness, row: u32) -> String {
    harness
        .store
        .get(&key(row))
        .await
        .unwrap()
        .unwrap()
        .token
        .unwrap()
        .value
}

// ── Intake ──────────────────────────────────────────────────────────

#[tokio::test]
async fn qualified_submission_reaches_sent_via_whatsapp() {
    let harness = harness();

    let outcome = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        IntakeOutcome::Sent {
            method: DeliveryMethod::Whatsapp,
            average: 8.625,
        }
    );

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Sent);
    assert_eq!(request.delivery_method, DeliveryMethod::Whatsapp);
    assert!(request.sent_at.is_some());
    assert!(request.error_log.is_empty());

    // Token issued with the configured 14-day expiry.
    let token = request.token.expect("token issued");
    assert_eq!((token.expires_at - token.issued_at).num_days(), 14);

    // Exactly one message went out, carrying the token link.
    assert_eq!(harness.whatsapp.sent_count().await, 1);
    assert_eq!(harness.email.sent_count().await, 0);
    let sent = harness.whatsapp.sent.lock().await[0].clone();
    assert!(sent.landing_url.ends_with(&token.value));
    assert!(!sent.reminder);
}

#[tokio::test]
async fn low_rating_short_circuits_to_alerting() {
    let harness = harness();
    let payload: RawSubmission = serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "row_number": 3,
        "email": "alice@client.co",
        "q1": 5, "q2": 6, "q3": 4,
        "testimonial_consent": "Yes",
    }))
    .unwrap();

    let outcome = harness.engine.handle_submission(&payload).await.unwrap();
    assert_eq!(
        outcome,
        IntakeOutcome::Disqualified {
            reason: "low_rating",
            average: Some(5.0),
        }
    );

    // No request created, no draft generated, no delivery attempted.
    assert!(harness.store.get(&key(3)).await.unwrap().is_none());
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.whatsapp.sent_count().await, 0);
    assert_eq!(
        *harness.alerts.reasons.lock().await,
        vec![AlertReason::LowRating]
    );
}

#[tokio::test]
async fn no_scores_is_unqualified_not_a_crash() {
    let harness = harness();
    let payload: RawSubmission = serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "row_number": 4,
        "email": "alice@client.co",
        "testimonial_consent": "Yes",
    }))
    .unwrap();

    let outcome = harness.engine.handle_submission(&payload).await.unwrap();
    assert_eq!(
        outcome,
        IntakeOutcome::Disqualified {
            reason: "no_scores",
            average: None,
        }
    );
    assert_eq!(
        *harness.alerts.reasons.lock().await,
        vec![AlertReason::NoScores]
    );
}

#[tokio::test]
async fn threshold_boundary_is_inclusive() {
    let harness = harness();
    let payload: RawSubmission = serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "row_number": 5,
        "email": "alice@client.co",
        "q1": 8, "q2": 8,
        "testimonial_consent": "Yes",
    }))
    .unwrap();

    let outcome = harness.engine.handle_submission(&payload).await.unwrap();
    assert!(matches!(outcome, IntakeOutcome::Sent { average, .. } if average == 8.0));
}

#[tokio::test]
async fn consent_declined_goes_to_alerting_despite_high_average() {
    let harness = harness();
    let payload: RawSubmission = serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "row_number": 6,
        "email": "alice@client.co",
        "q1": 10, "q2": 9,
        "testimonial_consent": "No",
    }))
    .unwrap();

    let outcome = harness.engine.handle_submission(&payload).await.unwrap();
    assert!(matches!(
        outcome,
        IntakeOutcome::Disqualified { reason: "consent_declined", .. }
    ));
    assert_eq!(
        *harness.alerts.reasons.lock().await,
        vec![AlertReason::ConsentDeclined]
    );
}

#[tokio::test]
async fn negative_sentiment_flags_high_average() {
    let harness = harness();
    let payload: RawSubmission = serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "row_number": 7,
        "email": "alice@client.co",
        "q1": 9, "q2": 9,
        "testimonial_consent": "Yes",
        "feedback": "Honestly I regret the last phase of this.",
    }))
    .unwrap();

    let outcome = harness.engine.handle_submission(&payload).await.unwrap();
    assert!(matches!(
        outcome,
        IntakeOutcome::Disqualified { reason: "negative_sentiment", .. }
    ));
}

#[tokio::test]
async fn invalid_payload_is_rejected_without_side_effects() {
    let harness = harness();
    let payload: RawSubmission = serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "email": "alice@client.co",
    }))
    .unwrap();

    let result = harness.engine.handle_submission(&payload).await;
    assert!(matches!(result, Err(Error::Intake(_))));
    assert!(harness.alerts.reasons.lock().await.is_empty());
}

// ── Delivery fallback ───────────────────────────────────────────────

#[tokio::test]
async fn whatsapp_failure_falls_back_to_email() {
    let harness = harness_with(
        EngineConfig::default(),
        RecordingChannel::scripted(DeliveryMethod::Whatsapp, vec![false]),
        RecordingChannel::succeeding(DeliveryMethod::Email),
        ScriptedModel::working(),
        MockCrm::with_client("alice@client.co", alice()),
    );

    let outcome = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IntakeOutcome::Sent { method: DeliveryMethod::Email, .. }
    ));

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Sent);
    assert_eq!(request.delivery_method, DeliveryMethod::Email);
    // Exactly one error-log entry for the failed WhatsApp attempt.
    assert_eq!(request.error_log.len(), 1);
    assert!(request.error_log[0].message.contains("WHATSAPP"));
    assert_eq!(harness.email.sent_count().await, 1);
}

#[tokio::test]
async fn all_channels_failing_leaves_request_retryable() {
    let harness = harness_with(
        EngineConfig::default(),
        RecordingChannel::scripted(DeliveryMethod::Whatsapp, vec![false, true]),
        RecordingChannel::scripted(DeliveryMethod::Email, vec![false]),
        ScriptedModel::working(),
        MockCrm::with_client("alice@client.co", alice()),
    );

    let outcome = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IntakeOutcome::Undelivered { status: RequestStatus::Qualified, .. }
    ));

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Qualified);
    assert_eq!(request.error_log.len(), 2);

    // A webhook replay retries the delivery cycle and now succeeds,
    // without generating a second draft.
    let drafts_before = harness.model.calls.load(Ordering::SeqCst);
    let retry = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert!(matches!(
        retry,
        IntakeOutcome::Sent { method: DeliveryMethod::Whatsapp, .. }
    ));
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), drafts_before);
}

#[tokio::test]
async fn unresolved_client_parks_request_without_delivery() {
    let harness = harness_with(
        EngineConfig::default(),
        RecordingChannel::succeeding(DeliveryMethod::Whatsapp),
        RecordingChannel::succeeding(DeliveryMethod::Email),
        ScriptedModel::working(),
        MockCrm::empty(),
    );

    let outcome = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IntakeOutcome::Undelivered { status: RequestStatus::Unresolved, .. }
    ));

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Unresolved);
    // The draft was still generated on the degraded path.
    assert!(!request.draft_text.is_empty());
    assert_eq!(harness.whatsapp.sent_count().await, 0);
    assert_eq!(harness.email.sent_count().await, 0);
    assert_eq!(
        *harness.alerts.reasons.lock().await,
        vec![AlertReason::ClientUnresolved]
    );
}

#[tokio::test(start_paused = true)]
async fn draft_failure_logs_and_stays_qualified() {
    let harness = harness_with(
        EngineConfig::default(),
        RecordingChannel::succeeding(DeliveryMethod::Whatsapp),
        RecordingChannel::succeeding(DeliveryMethod::Email),
        ScriptedModel::broken(),
        MockCrm::with_client("alice@client.co", alice()),
    );

    let outcome = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert!(matches!(
        outcome,
        IntakeOutcome::Undelivered { status: RequestStatus::Qualified, .. }
    ));

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Qualified);
    assert_eq!(request.error_log.len(), 1);
    assert_eq!(request.error_log[0].stage, "draft");
    assert_eq!(harness.whatsapp.sent_count().await, 0);
}

// ── Idempotent intake ───────────────────────────────────────────────

#[tokio::test]
async fn replayed_webhook_is_a_noop_after_delivery() {
    let harness = harness();

    let first = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert!(matches!(first, IntakeOutcome::Sent { .. }));

    let second = harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    assert_eq!(
        second,
        IntakeOutcome::Duplicate {
            status: RequestStatus::Sent,
        }
    );

    // Exactly one request, one draft, one delivery.
    assert_eq!(harness.model.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.whatsapp.sent_count().await, 1);
}

#[tokio::test]
async fn concurrent_identical_webhooks_create_one_request() {
    let harness = harness();

    let payload_a = qualifying_payload(2);
    let payload_b = qualifying_payload(2);
    let (a, b) = tokio::join!(
        harness.engine.handle_submission(&payload_a),
        harness.engine.handle_submission(&payload_b),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let sent = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IntakeOutcome::Sent { .. }))
        .count();
    let duplicates = [&a, &b]
        .iter()
        .filter(|o| matches!(o, IntakeOutcome::Duplicate { .. }))
        .count();
    assert_eq!((sent, duplicates), (1, 1));
    assert_eq!(harness.whatsapp.sent_count().await, 1);
}

// ── Client actions ──────────────────────────────────────────────────

#[tokio::test]
async fn review_view_renders_landing_data() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;

    let view = harness.engine.review_view(&token).await.unwrap();
    assert_eq!(view.client_name, "Alice Kumar");
    assert_eq!(view.business_name, "bdcode");
    assert_eq!(view.status, "SENT");
    // 8.625 / 2 rounds to 4 stars.
    assert_eq!(view.rating, 4);
    assert_eq!(view.gbp_review_url, "https://g.page/r/bdcode/review");
    assert_eq!(view.regeneration_count, 0);
    assert_eq!(view.max_regenerations, 3);
    assert!(view.draft_text.starts_with("Draft v1"));
}

#[tokio::test]
async fn copy_action_finalizes_the_request() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;

    harness.engine.mark_copied(&token).await.unwrap();

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Copied);
    assert!(request.copied_at.is_some());
}

#[tokio::test]
async fn terminal_states_are_sticky() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;

    harness.engine.mark_copied(&token).await.unwrap();
    let copied_at = harness
        .store
        .get(&key(2))
        .await
        .unwrap()
        .unwrap()
        .copied_at;

    // A later decline with the same token is rejected without mutation.
    let err = harness.engine.decline(&token).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Action(ActionError::RequestAlreadyFinalized { .. })
    ));

    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Copied);
    assert_eq!(request.copied_at, copied_at);
}

#[tokio::test]
async fn unknown_token_is_not_found() {
    let harness = harness();
    let err = harness.engine.mark_copied("no-such-token").await.unwrap_err();
    assert!(matches!(err, Error::Action(ActionError::TokenNotFound)));
}

#[tokio::test]
async fn concurrent_conflicting_actions_serialize() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;

    let (copy, decline) = tokio::join!(
        harness.engine.mark_copied(&token),
        harness.engine.decline(&token),
    );

    // Exactly one action wins; the loser sees the finalized request.
    assert_eq!(copy.is_ok() as u8 + decline.is_ok() as u8, 1);
    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    match request.status {
        RequestStatus::Copied => assert!(decline.is_err()),
        RequestStatus::Declined => assert!(copy.is_err()),
        other => panic!("unexpected terminal status {other}"),
    }
}

// ── Token lifecycle ─────────────────────────────────────────────────

#[tokio::test]
async fn expired_token_drives_request_to_expired() {
    let harness = harness_with(
        EngineConfig {
            // Tokens are born expired.
            token_expiry_days: -1,
            ..EngineConfig::default()
        },
        RecordingChannel::succeeding(DeliveryMethod::Whatsapp),
        RecordingChannel::succeeding(DeliveryMethod::Email),
        ScriptedModel::working(),
        MockCrm::with_client("alice@client.co", alice()),
    );

    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;

    let err = harness.engine.mark_copied(&token).await.unwrap_err();
    assert!(matches!(err, Error::Action(ActionError::TokenExpired)));

    // Lazy expiry transitioned the request as a side effect.
    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Expired);

    // Further actions now report the terminal state.
    let err = harness.engine.decline(&token).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Action(ActionError::RequestAlreadyFinalized { .. })
    ));
}

// ── Regeneration ────────────────────────────────────────────────────

#[tokio::test]
async fn regeneration_replaces_draft_and_token() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let first_token = current_token(&harness, 2).await;

    let outcome = harness.engine.regenerate(&first_token).await.unwrap();
    assert_eq!(outcome.regeneration_count, 1);
    assert!(outcome.draft_text.starts_with("Draft v2"));
    assert_ne!(outcome.token, first_token);

    // The superseded token is dead.
    let err = harness.engine.mark_copied(&first_token).await.unwrap_err();
    assert!(matches!(err, Error::Action(ActionError::TokenNotFound)));

    // The fresh token works and the request went back to Sent.
    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::Sent);
    harness.engine.mark_copied(&outcome.token).await.unwrap();
}

#[tokio::test]
async fn regeneration_is_bounded_by_the_cap() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();

    // Three regenerations succeed and increment the counter to 3.
    let mut token = current_token(&harness, 2).await;
    for expected_count in 1..=3 {
        let outcome = harness.engine.regenerate(&token).await.unwrap();
        assert_eq!(outcome.regeneration_count, expected_count);
        token = outcome.token;
    }

    // The fourth transitions to the terminal cap state and is rejected.
    let err = harness.engine.regenerate(&token).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Action(ActionError::RegenLimitReached { max: 3 })
    ));
    let request = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(request.status, RequestStatus::RegenLimitReached);
    assert_eq!(request.regeneration_count, 3);

    // Rejected thereafter, even with the (still current) token.
    let err = harness.engine.regenerate(&token).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Action(ActionError::RequestAlreadyFinalized { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn failed_regeneration_keeps_old_draft_and_token() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;
    let before = harness.store.get(&key(2)).await.unwrap().unwrap();

    // Model breaks after the initial draft.
    harness.model.set_failing(true);

    let err = harness.engine.regenerate(&token).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Action(ActionError::RegenerationFailed(_))
    ));

    // Status unchanged, old draft and token still live, failure logged.
    let after = harness.store.get(&key(2)).await.unwrap().unwrap();
    assert_eq!(after.status, RequestStatus::Sent);
    assert_eq!(after.draft_text, before.draft_text);
    assert_eq!(after.regeneration_count, 0);
    assert_eq!(after.error_log.len(), 1);
    assert_eq!(after.error_log[0].stage, "regenerate");
    assert!(harness.engine.review_view(&token).await.is_ok());

    // Once the model recovers, the same token regenerates normally.
    harness.model.set_failing(false);
    let outcome = harness.engine.regenerate(&token).await.unwrap();
    assert_eq!(outcome.regeneration_count, 1);
}

#[tokio::test]
async fn regeneration_redelivers_with_fresh_link() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();
    let token = current_token(&harness, 2).await;

    let outcome = harness.engine.regenerate(&token).await.unwrap();

    // Initial delivery plus the regeneration re-delivery.
    assert_eq!(harness.whatsapp.sent_count().await, 2);
    let messages = harness.whatsapp.sent.lock().await.clone();
    assert_eq!(messages[1].token, outcome.token);
    assert!(messages[1].landing_url.ends_with(&outcome.token));
    assert_eq!(messages[1].draft_text, outcome.draft_text);
}

// ── Reminders ───────────────────────────────────────────────────────

#[tokio::test]
async fn reminder_sweep_skips_recent_and_counts_expired() {
    let harness = harness();
    harness
        .engine
        .handle_submission(&qualifying_payload(2))
        .await
        .unwrap();

    // Freshly sent: nothing to remind yet.
    let report = harness.engine.send_reminders().await.unwrap();
    assert_eq!(report.reminded, 0);
    assert_eq!(report.expired, 0);
    assert_eq!(harness.whatsapp.sent_count().await, 1);
}
