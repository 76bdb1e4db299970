#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc};

use call_session_cell::error::{CallError, MediaError};
use call_session_cell::models::{CallReport, SignalEnvelope, SignalMessage, SignalSender};
use call_session_cell::services::{
    CallReporter, CallSessionOrchestrator, MediaEvent, MediaHandle, MediaRuntime, MediaSessionClient,
    MediaState, PresenceGate, SignalingChannel, SignalingTransport, TransportLink,
};
use shared_config::{AppConfig, CallTimeouts};
use shared_models::auth::{CallIdentity, ParticipantRole};
use shared_utils::test_utils::{init_test_tracing, TestConfig, TestIdentity};

// ==============================================================================
// MEDIA FAKES
// ==============================================================================

pub struct FakeMedia {
    events: broadcast::Sender<MediaEvent>,
    handles: Mutex<Vec<MediaHandle>>,
    create_errors: Mutex<VecDeque<MediaError>>,
    join_error: Mutex<Option<MediaError>>,
    join_delay: Mutex<Duration>,
    create_delay: Mutex<Duration>,
    teardown_hangs: AtomicBool,
    pub created: AtomicU32,
    pub joined: AtomicU32,
    pub left: AtomicU32,
    pub ended: AtomicU32,
}

impl FakeMedia {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            events,
            handles: Mutex::new(Vec::new()),
            create_errors: Mutex::new(VecDeque::new()),
            join_error: Mutex::new(None),
            join_delay: Mutex::new(Duration::ZERO),
            create_delay: Mutex::new(Duration::ZERO),
            teardown_hangs: AtomicBool::new(false),
            created: AtomicU32::new(0),
            joined: AtomicU32::new(0),
            left: AtomicU32::new(0),
            ended: AtomicU32::new(0),
        })
    }

    pub fn fail_next_create(&self, error: MediaError) {
        self.create_errors.lock().unwrap().push_back(error);
    }

    pub fn fail_join(&self, error: MediaError) {
        *self.join_error.lock().unwrap() = Some(error);
    }

    pub fn set_join_delay(&self, delay: Duration) {
        *self.join_delay.lock().unwrap() = delay;
    }

    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock().unwrap() = delay;
    }

    /// `leave` and `end_for_all` are counted, then never complete.
    pub fn hang_teardown(&self) {
        self.teardown_hangs.store(true, Ordering::SeqCst);
    }

    async fn maybe_hang(&self) {
        if self.teardown_hangs.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
    }

    pub fn last_handle(&self) -> Option<MediaHandle> {
        self.handles.lock().unwrap().last().cloned()
    }

    /// Reports a state change for the most recently created session.
    pub fn emit(&self, state: MediaState) {
        if let Some(handle) = self.last_handle() {
            let _ = self.events.send(MediaEvent {
                handle_id: handle.id,
                state,
                participant_count: 2,
            });
        }
    }

    pub fn count(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSessionClient for FakeMedia {
    async fn create_or_join(&self, session_id: &str, _participants: &[String]) -> Result<MediaHandle, MediaError> {
        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.create_errors.lock().unwrap().pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        let handle = MediaHandle::new(session_id);
        self.handles.lock().unwrap().push(handle.clone());
        Ok(handle)
    }

    async fn join(&self, _handle: &MediaHandle) -> Result<(), MediaError> {
        let delay = *self.join_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.join_error.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.joined.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn leave(&self, _handle: &MediaHandle) -> Result<(), MediaError> {
        self.left.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        Ok(())
    }

    async fn end_for_all(&self, _handle: &MediaHandle) -> Result<(), MediaError> {
        self.ended.fetch_add(1, Ordering::SeqCst);
        self.maybe_hang().await;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<MediaEvent> {
        self.events.subscribe()
    }
}

pub struct FakeRuntime {
    pub media: Arc<FakeMedia>,
    init_delay: Mutex<Duration>,
    init_error: Mutex<Option<MediaError>>,
    pub initialized: AtomicU32,
    pub shutdowns: AtomicU32,
}

impl FakeRuntime {
    pub fn new(media: Arc<FakeMedia>) -> Arc<Self> {
        Arc::new(Self {
            media,
            init_delay: Mutex::new(Duration::ZERO),
            init_error: Mutex::new(None),
            initialized: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
        })
    }

    pub fn set_init_delay(&self, delay: Duration) {
        *self.init_delay.lock().unwrap() = delay;
    }

    pub fn fail_init(&self, error: MediaError) {
        *self.init_error.lock().unwrap() = Some(error);
    }
}

#[async_trait]
impl MediaRuntime for FakeRuntime {
    async fn initialize(
        &self,
        _identity: &CallIdentity,
        _credentials: &shared_models::auth::MediaCredentials,
    ) -> Result<Arc<dyn MediaSessionClient>, MediaError> {
        let delay = *self.init_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.init_error.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }
        self.initialized.fetch_add(1, Ordering::SeqCst);
        let client: Arc<dyn MediaSessionClient> = self.media.clone();
        Ok(client)
    }

    async fn shutdown(&self, _client: Arc<dyn MediaSessionClient>) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

// ==============================================================================
// SIGNALING FAKE
// ==============================================================================

pub struct FakeTransport {
    sent: Arc<Mutex<Vec<SignalMessage>>>,
    inbound: Mutex<Option<mpsc::Sender<SignalEnvelope>>>,
    failures_left: AtomicU32,
    hangs_left: AtomicU32,
    connect_delay: Mutex<Duration>,
    pub connects: AtomicU32,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Mutex::new(None),
            failures_left: AtomicU32::new(0),
            hangs_left: AtomicU32::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicU32::new(0),
        })
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    /// The next `count` connects never complete.
    pub fn hang_next_connects(&self, count: u32) {
        self.hangs_left.store(count, Ordering::SeqCst);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().unwrap() = delay;
    }

    pub fn sent(&self) -> Vec<SignalMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_count(&self, kind: &str) -> usize {
        self.sent.lock().unwrap().iter().filter(|m| m.kind() == kind).count()
    }

    /// Delivers a message as if relayed by the rendezvous service.
    pub async fn inject(&self, sender: Option<SignalSender>, message: SignalMessage) {
        let inbound = self.inbound.lock().unwrap().clone();
        if let Some(inbound) = inbound {
            inbound
                .send(SignalEnvelope::new(sender, message))
                .await
                .expect("signaling link closed");
        } else {
            panic!("transport not connected");
        }
    }

    /// Simulates the server going away.
    pub fn drop_connection(&self) {
        self.inbound.lock().unwrap().take();
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn connect(&self, _credential: &str) -> Result<TransportLink, CallError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hangs_left.load(Ordering::SeqCst);
        if hangs > 0 {
            self.hangs_left.store(hangs - 1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let remaining = self.failures_left.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures_left.store(remaining - 1, Ordering::SeqCst);
            return Err(CallError::SignalingUnavailable {
                message: "connection refused".to_string(),
            });
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalMessage>(32);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SignalEnvelope>(32);
        let sent = self.sent.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                sent.lock().unwrap().push(message);
            }
        });
        *self.inbound.lock().unwrap() = Some(inbound_tx);

        Ok(TransportLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}

// ==============================================================================
// REPORTER FAKE
// ==============================================================================

#[derive(Default)]
pub struct RecordingReporter {
    reports: Mutex<Vec<CallReport>>,
}

impl RecordingReporter {
    pub fn reports(&self) -> Vec<CallReport> {
        self.reports.lock().unwrap().clone()
    }
}

#[async_trait]
impl CallReporter for RecordingReporter {
    async fn report(&self, report: &CallReport) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push(report.clone());
        Ok(())
    }
}

// ==============================================================================
// HARNESS
// ==============================================================================

pub struct Harness {
    pub config: AppConfig,
    pub orchestrator: Arc<CallSessionOrchestrator>,
    pub gate: PresenceGate,
    pub signaling: SignalingChannel,
    pub runtime: Arc<FakeRuntime>,
    pub media: Arc<FakeMedia>,
    pub transport: Arc<FakeTransport>,
    pub reporter: Arc<RecordingReporter>,
}

impl Harness {
    pub fn build(timeouts: CallTimeouts) -> Self {
        init_test_tracing();
        let config = TestConfig {
            timeouts,
            ..TestConfig::default()
        }
        .to_app_config();

        let media = FakeMedia::new();
        let runtime = FakeRuntime::new(media.clone());
        let transport = FakeTransport::new();
        let reporter = Arc::new(RecordingReporter::default());

        let gate = PresenceGate::new(runtime.clone(), config.timeouts.readiness);
        let signaling = SignalingChannel::new(transport.clone(), config.signaling.clone());
        let orchestrator = CallSessionOrchestrator::new(
            gate.clone(),
            signaling.clone(),
            reporter.clone(),
            config.timeouts.clone(),
        );

        Self {
            config,
            orchestrator,
            gate,
            signaling,
            runtime,
            media,
            transport,
            reporter,
        }
    }

    /// Media ready and signaling connected for `identity`.
    pub async fn signed_in(identity: CallIdentity) -> Self {
        let harness = Self::build(CallTimeouts::default());
        harness
            .gate
            .initialize(identity, TestIdentity::credentials())
            .await
            .expect("gate ready");
        harness.signaling.connect("test-token").await.expect("signaling connected");
        harness
    }

    pub async fn doctor() -> Self {
        Self::signed_in(TestIdentity::doctor("Grey")).await
    }

    pub async fn patient() -> Self {
        Self::signed_in(TestIdentity::patient("Ada")).await
    }

    pub fn created(&self) -> u32 {
        FakeMedia::count(&self.media.created)
    }

    pub fn left(&self) -> u32 {
        FakeMedia::count(&self.media.left)
    }

    pub fn ended(&self) -> u32 {
        FakeMedia::count(&self.media.ended)
    }
}

pub fn patient_sender() -> SignalSender {
    SignalSender {
        user_id: "patient-ada".to_string(),
        display_name: "Ada".to_string(),
        role: Some(ParticipantRole::Patient),
    }
}

pub fn doctor_sender(name: &str) -> SignalSender {
    SignalSender {
        user_id: format!("doctor-{}", name.to_lowercase()),
        display_name: format!("Dr. {}", name),
        role: Some(ParticipantRole::Doctor),
    }
}

/// Lets spawned tasks run. With a paused clock this only advances time
/// once everything else is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
