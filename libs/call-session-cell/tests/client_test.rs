mod support;

use std::sync::Arc;

use assert_matches::assert_matches;

use call_session_cell::error::CallError;
use call_session_cell::models::CallPhase;
use call_session_cell::services::{ConnectionState, GateStatus, TelehealthCallClient};
use shared_models::auth::{CallIdentity, MediaCredentials, ParticipantRole};
use shared_utils::test_utils::{init_test_tracing, TestConfig, TestIdentity};

use support::{settle, FakeMedia, FakeRuntime, FakeTransport, RecordingReporter};

struct Fixture {
    client: TelehealthCallClient,
    runtime: Arc<FakeRuntime>,
    transport: Arc<FakeTransport>,
}

fn fixture() -> Fixture {
    init_test_tracing();
    let config = TestConfig::default().to_app_config();
    let runtime = FakeRuntime::new(FakeMedia::new());
    let transport = FakeTransport::new();
    let client = TelehealthCallClient::new(
        &config,
        transport.clone(),
        runtime.clone(),
        Arc::new(RecordingReporter::default()),
    );
    Fixture {
        client,
        runtime,
        transport,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_connects_signaling_and_warms_media() {
    let f = fixture();

    f.client
        .sign_in(TestIdentity::doctor("Grey"), TestIdentity::credentials())
        .await
        .unwrap();
    settle().await;

    let orchestrator = f.client.orchestrator();
    assert_eq!(orchestrator.signaling().state(), ConnectionState::Connected);
    assert_eq!(orchestrator.gate().status(), GateStatus::Ready);
    assert_eq!(f.client.identity().await.map(|i| i.role), Some(ParticipantRole::Doctor));
    assert_eq!(FakeMedia::count(&f.transport.connects), 1);
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_rejects_incomplete_identity() {
    let f = fixture();

    let result = f
        .client
        .sign_in(
            CallIdentity::new("", "Nobody", ParticipantRole::Patient),
            TestIdentity::credentials(),
        )
        .await;
    assert_matches!(result, Err(CallError::GateFailure { .. }));

    let result = f
        .client
        .sign_in(TestIdentity::patient("Ada"), MediaCredentials::new("", ""))
        .await;
    assert_matches!(result, Err(CallError::GateFailure { .. }));

    assert!(f.client.identity().await.is_none());
    assert_eq!(FakeMedia::count(&f.transport.connects), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sign_out_ends_call_and_releases_everything() {
    let f = fixture();
    f.client
        .sign_in(TestIdentity::doctor("Grey"), TestIdentity::credentials())
        .await
        .unwrap();
    settle().await;

    let orchestrator = f.client.orchestrator();
    orchestrator.start_call("A1").await.unwrap();
    assert_eq!(orchestrator.snapshot().phase, CallPhase::Ringing);

    f.client.sign_out().await;
    settle().await;

    assert_eq!(orchestrator.snapshot().phase, CallPhase::Idle);
    assert_eq!(orchestrator.signaling().state(), ConnectionState::Disconnected);
    assert_eq!(orchestrator.gate().status(), GateStatus::Uninitialized);
    assert_eq!(FakeMedia::count(&f.runtime.shutdowns), 1);
    assert_eq!(FakeMedia::count(&f.runtime.media.ended), 1);
    assert!(f.client.identity().await.is_none());
    assert_eq!(f.transport.sent_count("cancel"), 1);
}
