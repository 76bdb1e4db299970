use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use call_session_cell::error::CallError;
use call_session_cell::models::{CallOutcome, CallReport, CallRole, CallSession, PeerIdentity};
use call_session_cell::services::{CallReporter, SupabaseCallReporter, CALL_LOG_TABLE};
use shared_database::supabase::SupabaseError;
use shared_models::auth::ParticipantRole;
use shared_utils::test_utils::TestConfig;
use shared_utils::RetryPolicy;

fn report(outcome: CallOutcome) -> CallReport {
    let mut session = CallSession::new("A1", CallRole::Initiator, 1);
    session.assign_peer(PeerIdentity {
        peer_id: "patient-ada".to_string(),
        display_name: "Ada".to_string(),
        role: Some(ParticipantRole::Patient),
    });
    CallReport::from_session(&session, outcome, Utc::now())
}

fn reporter_for(server: &MockServer) -> SupabaseCallReporter {
    let config = TestConfig::default()
        .with_supabase_url(server.uri())
        .to_app_config();
    SupabaseCallReporter::new(&config).with_policy(RetryPolicy::new(
        3,
        Duration::from_millis(10),
        Duration::from_millis(50),
    ))
}

fn log_path() -> String {
    format!("/rest/v1/{}", CALL_LOG_TABLE)
}

#[tokio::test]
async fn test_report_posts_call_log_row() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(log_path()))
        .and(header("apikey", "test-anon-key"))
        .and(body_partial_json(json!({
            "appointment_id": "A1",
            "session_id": "appointment_A1",
            "role": "initiator",
            "outcome": "no_answer",
            "error_kind": "invite_timeout",
            "peer_id": "patient-ada",
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let result = reporter_for(&server).report(&report(CallOutcome::NoAnswer)).await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_report_retries_server_errors() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(log_path()))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
        .up_to_n_times(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(log_path()))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let result = reporter_for(&server)
        .report(&report(CallOutcome::Failed {
            error: CallError::JoinTimeout { timeout_seconds: 30 },
        }))
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_report_does_not_retry_auth_failures() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(log_path()))
        .respond_with(ResponseTemplate::new(401).set_body_string("jwt expired"))
        .expect(1)
        .mount(&server)
        .await;

    let result = reporter_for(&server)
        .with_auth_token("expired-token")
        .report(&report(CallOutcome::Left))
        .await;

    let err = result.unwrap_err();
    assert_matches!(
        err.downcast_ref::<SupabaseError>(),
        Some(SupabaseError::Unauthorized(body)) if body == "jwt expired"
    );
}
