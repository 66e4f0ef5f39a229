//! Shared test doubles for the engine's external collaborators.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use review_relay::alert::{AlertReason, AlertSink};
use review_relay::config::EngineConfig;
use review_relay::crm::{ClientProfile, CrmLookup};
use review_relay::delivery::{DeliveryChannel, DeliveryMethod, DeliveryPayload, Dispatcher};
use review_relay::draft::{DraftGenerator, DraftModel};
use review_relay::engine::{EngineDeps, ReviewEngine};
use review_relay::error::{AlertError, CrmError, DeliveryError, DraftError};
use review_relay::mirror::TracingMirror;
use review_relay::store::{MemoryStore, RequestStore};
use review_relay::submission::RawSubmission;

/// CRM with a fixed directory, matched case-insensitively.
pub struct MockCrm {
    profiles: HashMap<String, ClientProfile>,
}

impl MockCrm {
    pub fn with_client(email: &str, profile: ClientProfile) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(email.to_lowercase(), profile);
        Self { profiles }
    }

    pub fn empty() -> Self {
        Self {
            profiles: HashMap::new(),
        }
    }
}

#[async_trait]
impl CrmLookup for MockCrm {
    async fn lookup_client(&self, email: &str) -> Result<Option<ClientProfile>, CrmError> {
        Ok(self.profiles.get(&email.to_lowercase()).cloned())
    }
}

/// Draft model producing a distinct, word-window-sized draft per call.
/// Failure is togglable so a test can break the model mid-flow.
pub struct ScriptedModel {
    pub calls: AtomicU32,
    fail: AtomicBool,
}

impl ScriptedModel {
    pub fn working() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail: AtomicBool::new(false),
        })
    }

    pub fn broken() -> Arc<Self> {
        let model = Self::working();
        model.set_failing(true);
        model
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl DraftModel for ScriptedModel {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _prompt: &str,
        _temperature: f32,
        _max_tokens: u32,
    ) -> Result<String, DraftError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail.load(Ordering::SeqCst) {
            return Err(DraftError::RequestFailed {
                model: "scripted".into(),
                reason: "model offline".into(),
            });
        }
        Ok(format!(
            "Draft v{n}: working with the team was a genuinely smooth experience from \
             kickoff to launch, with responsive communication, careful planning, and \
             solid technical delivery throughout the whole project."
        ))
    }
}

/// What a recording channel captured for one delivery.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub token: String,
    pub landing_url: String,
    pub draft_text: String,
    pub reminder: bool,
}

/// A delivery channel with scripted outcomes and a capture log.
pub struct RecordingChannel {
    method: DeliveryMethod,
    /// Outcome script, popped per attempt; empty means succeed.
    outcomes: Mutex<VecDeque<bool>>,
    pub sent: Mutex<Vec<SentMessage>>,
}

impl RecordingChannel {
    pub fn succeeding(method: DeliveryMethod) -> Arc<Self> {
        Arc::new(Self {
            method,
            outcomes: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn scripted(method: DeliveryMethod, outcomes: Vec<bool>) -> Arc<Self> {
        Arc::new(Self {
            method,
            outcomes: Mutex::new(outcomes.into()),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.lock().await.len()
    }
}

#[async_trait]
impl DeliveryChannel for RecordingChannel {
    fn method(&self) -> DeliveryMethod {
        self.method
    }

    fn can_reach(&self, client: &ClientProfile) -> bool {
        match self.method {
            DeliveryMethod::Whatsapp => client.whatsapp.is_some(),
            DeliveryMethod::Email => !client.business_email.is_empty(),
            DeliveryMethod::None => false,
        }
    }

    async fn attempt(
        &self,
        payload: &DeliveryPayload<'_>,
    ) -> Result<Option<String>, DeliveryError> {
        let succeed = self.outcomes.lock().await.pop_front().unwrap_or(true);
        if !succeed {
            return Err(DeliveryError::SendFailed {
                channel: self.method.to_string(),
                reason: "scripted failure".into(),
            });
        }

        self.sent.lock().await.push(SentMessage {
            token: payload.token.to_string(),
            landing_url: payload.landing_url.to_string(),
            draft_text: payload.draft_text.to_string(),
            reminder: payload.reminder,
        });
        Ok(Some(format!("msg-{}", self.sent.lock().await.len())))
    }
}

/// Alert sink that records reasons.
#[derive(Default)]
pub struct CountingAlerts {
    pub reasons: Mutex<Vec<AlertReason>>,
}

#[async_trait]
impl AlertSink for CountingAlerts {
    async fn notify_low_rating(
        &self,
        _record: &review_relay::submission::SubmissionRecord,
        _client: Option<&ClientProfile>,
        _average: Option<f64>,
        reason: AlertReason,
    ) -> Result<(), AlertError> {
        self.reasons.lock().await.push(reason);
        Ok(())
    }
}

/// The usual CRM profile the tests resolve to.
pub fn alice() -> ClientProfile {
    ClientProfile {
        name: "Alice Kumar".into(),
        company: "Acme Textiles".into(),
        services: "E-commerce build".into(),
        whatsapp: Some("+919876543210".into()),
        business_email: "alice@acme.example".into(),
    }
}

/// A qualifying payload: scores [9,9,8,9,8,9,8,9] → average 8.625.
pub fn qualifying_payload(row: u32) -> RawSubmission {
    serde_json::from_value(serde_json::json!({
        "sheet_id": "sheet-1",
        "row_number": row,
        "timestamp": "2026-03-01T10:00:00Z",
        "email": "alice@client.co",
        "q1": 9, "q2": 9, "q3": 8, "q4": 9,
        "q5": 8, "q6": 9, "q7": 8, "q8": 9,
        "testimonial_consent": "Yes",
        "feedback": "Launch went great."
    }))
    .expect("payload deserializes")
}

/// Everything a test needs to drive the engine and inspect side effects.
pub struct Harness {
    pub engine: Arc<ReviewEngine>,
    pub store: Arc<MemoryStore>,
    pub whatsapp: Arc<RecordingChannel>,
    pub email: Arc<RecordingChannel>,
    pub alerts: Arc<CountingAlerts>,
    pub model: Arc<ScriptedModel>,
}

/// Build an engine with in-memory store and recording collaborators.
pub fn harness_with(
    config: EngineConfig,
    whatsapp: Arc<RecordingChannel>,
    email: Arc<RecordingChannel>,
    model: Arc<ScriptedModel>,
    crm: MockCrm,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let alerts = Arc::new(CountingAlerts::default());

    let deps = EngineDeps {
        store: store.clone() as Arc<dyn RequestStore>,
        crm: Arc::new(crm),
        drafts: Arc::new(DraftGenerator::new(
            model.clone() as Arc<dyn DraftModel>,
            config.business_name.clone(),
        )),
        dispatcher: Arc::new(Dispatcher::new(vec![
            whatsapp.clone() as Arc<dyn DeliveryChannel>,
            email.clone() as Arc<dyn DeliveryChannel>,
        ])),
        alerts: alerts.clone() as Arc<dyn AlertSink>,
        mirror: Arc::new(TracingMirror),
    };

    Harness {
        engine: Arc::new(ReviewEngine::new(config, deps)),
        store,
        whatsapp,
        email,
        alerts,
        model,
    }
}

/// Default harness: resolvable client, both channels succeeding.
pub fn harness() -> Harness {
    harness_with(
        EngineConfig {
            business_name: "bdcode".into(),
            gbp_review_url: "https://g.page/r/bdcode/review".into(),
            ..EngineConfig::default()
        },
        RecordingChannel::succeeding(DeliveryMethod::Whatsapp),
        RecordingChannel::succeeding(DeliveryMethod::Email),
        ScriptedModel::working(),
        MockCrm::with_client("alice@client.co", alice()),
    )
}
