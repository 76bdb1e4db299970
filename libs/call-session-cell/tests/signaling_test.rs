mod support;

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use tokio::time::{sleep, Instant};

use call_session_cell::error::CallError;
use call_session_cell::models::SignalMessage;
use call_session_cell::services::{ConnectionState, SignalingChannel};
use shared_config::SignalingSettings;

use support::{patient_sender, settle, FakeMedia, FakeTransport};

fn channel() -> (SignalingChannel, Arc<FakeTransport>) {
    let transport = FakeTransport::new();
    let channel = SignalingChannel::new(transport.clone(), SignalingSettings::default());
    (channel, transport)
}

fn cancel(appointment_id: &str) -> SignalMessage {
    SignalMessage::Cancel {
        appointment_id: appointment_id.to_string(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_send_before_connect_fails_after_grace() {
    let (channel, transport) = channel();
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    let started = Instant::now();
    let result = channel.send(cancel("A1")).await;

    assert_matches!(result, Err(CallError::SignalingUnavailable { .. }));
    assert!(started.elapsed() >= Duration::from_secs(3));
    assert!(transport.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_send_waits_for_connection_within_grace() {
    let (channel, transport) = channel();

    let sender = channel.clone();
    let pending = tokio::spawn(async move { sender.send(cancel("A1")).await });
    sleep(Duration::from_secs(1)).await;

    channel.connect("token").await.unwrap();
    assert!(pending.await.unwrap().is_ok());

    settle().await;
    assert_eq!(transport.sent(), vec![cancel("A1")]);
}

#[tokio::test(start_paused = true)]
async fn test_connect_retries_until_transport_accepts() {
    let (channel, transport) = channel();
    transport.fail_next_connects(1);

    channel.connect("token").await.unwrap();

    assert!(channel.is_connected());
    assert_eq!(FakeMedia::count(&transport.connects), 2);
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_connection_drop() {
    let (channel, transport) = channel();
    channel.connect("token").await.unwrap();
    let mut states = channel.watch_state();

    transport.drop_connection();
    settle().await;

    assert!(states.has_changed().unwrap());

    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(FakeMedia::count(&transport.connects), 2);

    channel.send(cancel("A1")).await.unwrap();
    settle().await;
    assert_eq!(transport.sent_count("cancel"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_during_reconnect_waits_for_new_link() {
    let (channel, transport) = channel();
    channel.connect("token").await.unwrap();
    transport.set_connect_delay(Duration::from_millis(500));

    transport.drop_connection();
    settle().await;
    assert_eq!(channel.state(), ConnectionState::Reconnecting { attempt: 1 });

    channel.send(cancel("A1")).await.unwrap();
    assert!(channel.is_connected());

    settle().await;
    assert_eq!(transport.sent_count("cancel"), 1);
    assert_eq!(FakeMedia::count(&transport.connects), 2);
}

#[tokio::test(start_paused = true)]
async fn test_hung_connect_attempt_is_abandoned_and_retried() {
    let (channel, transport) = channel();
    transport.hang_next_connects(1);

    let result = channel.connect("token").await;
    assert_matches!(result, Err(CallError::SignalingUnavailable { .. }));

    // The stuck attempt expires with the connect timeout, then backs off 1s.
    sleep(Duration::from_secs(2)).await;
    assert_eq!(channel.state(), ConnectionState::Connected);
    assert_eq!(FakeMedia::count(&transport.connects), 2);
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_reconnect_attempts() {
    let (channel, transport) = channel();
    transport.fail_next_connects(100);

    // The first connection is awaited for at most the connect timeout.
    let result = channel.connect("token").await;
    assert_matches!(result, Err(CallError::SignalingUnavailable { .. }));
    assert_ne!(channel.state(), ConnectionState::Failed);

    // Backoff of 1s, 2s, 4s, 5s, 5s between six attempts.
    sleep(Duration::from_secs(8)).await;
    assert_eq!(channel.state(), ConnectionState::Failed);
    assert_eq!(FakeMedia::count(&transport.connects), 6);

    // Failed is final until connect is called again.
    sleep(Duration::from_secs(30)).await;
    assert_eq!(FakeMedia::count(&transport.connects), 6);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_messages_reach_subscribers() {
    let (channel, transport) = channel();
    let mut inbound = channel.subscribe();
    channel.connect("token").await.unwrap();

    transport
        .inject(
            Some(patient_sender()),
            SignalMessage::Accept {
                appointment_id: "A1".to_string(),
            },
        )
        .await;

    let envelope = inbound.recv().await.unwrap();
    assert_eq!(envelope.message.kind(), "accept");
    assert_eq!(envelope.message.appointment_id(), Some("A1"));
    assert_eq!(envelope.sender.map(|s| s.user_id), Some("patient-ada".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_stops_delivery() {
    let (channel, transport) = channel();
    channel.connect("token").await.unwrap();

    channel.disconnect().await;
    assert_eq!(channel.state(), ConnectionState::Disconnected);

    let result = channel.send(cancel("A1")).await;
    assert_matches!(result, Err(CallError::SignalingUnavailable { .. }));
    assert_eq!(FakeMedia::count(&transport.connects), 1);
}
