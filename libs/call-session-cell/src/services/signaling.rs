// libs/call-session-cell/src/services/signaling.rs
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, instrument, warn};

use shared_config::SignalingSettings;
use shared_utils::RetryPolicy;

use crate::error::CallError;
use crate::models::{SignalEnvelope, SignalMessage};

const INBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnect attempts exhausted; `connect` must be called again.
    Failed,
}

/// One live connection to the rendezvous service. Dropping `outbound`
/// closes the connection; `inbound` ends when the service goes away.
pub struct TransportLink {
    pub outbound: mpsc::Sender<SignalMessage>,
    pub inbound: mpsc::Receiver<SignalEnvelope>,
}

#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self, credential: &str) -> Result<TransportLink, CallError>;
}

/// Persistent, authenticated control channel. A supervisor task owns the
/// connection and reconnects with backoff; callers only see the connection
/// state, a broadcast of inbound envelopes and `send`.
#[derive(Clone)]
pub struct SignalingChannel {
    inner: Arc<ChannelInner>,
}

struct ChannelInner {
    transport: Arc<dyn SignalingTransport>,
    settings: SignalingSettings,
    state_tx: watch::Sender<ConnectionState>,
    inbound_tx: broadcast::Sender<SignalEnvelope>,
    outbound: Mutex<Option<mpsc::Sender<SignalMessage>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn SignalingTransport>, settings: SignalingSettings) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (inbound_tx, _) = broadcast::channel(INBOUND_CAPACITY);
        Self {
            inner: Arc::new(ChannelInner {
                transport,
                settings,
                state_tx,
                inbound_tx,
                outbound: Mutex::new(None),
                supervisor: Mutex::new(None),
            }),
        }
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow() == ConnectionState::Connected
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Inbound messages from every connection the supervisor establishes.
    pub fn subscribe(&self) -> broadcast::Receiver<SignalEnvelope> {
        self.inner.inbound_tx.subscribe()
    }

    /// Starts (or restarts) the connection supervisor and waits up to the
    /// connect timeout for the first connection. The supervisor keeps
    /// retrying in the background when this returns an error.
    #[instrument(skip(self, credential))]
    pub async fn connect(&self, credential: &str) -> Result<(), CallError> {
        let mut state_rx = self.inner.state_tx.subscribe();

        {
            let mut supervisor = self.inner.supervisor.lock().await;
            if let Some(handle) = supervisor.take() {
                handle.abort();
            }
            *self.inner.outbound.lock().await = None;
            self.inner.state_tx.send_replace(ConnectionState::Connecting);

            let channel = self.clone();
            let credential = credential.to_string();
            *supervisor = Some(tokio::spawn(async move {
                channel.supervise(credential).await;
            }));
        }

        let waited = timeout(self.inner.settings.connect_timeout, async {
            state_rx
                .wait_for(|state| matches!(state, ConnectionState::Connected | ConnectionState::Failed))
                .await
                .map(|state| *state)
        })
        .await;

        match waited {
            Ok(Ok(ConnectionState::Connected)) => Ok(()),
            Ok(_) => Err(CallError::SignalingUnavailable {
                message: "unable to connect to the signaling service".to_string(),
            }),
            Err(_) => {
                warn!(
                    "Signaling connect timed out after {:?}, still retrying in background",
                    self.inner.settings.connect_timeout
                );
                Err(CallError::SignalingUnavailable {
                    message: "signaling connect timed out".to_string(),
                })
            }
        }
    }

    /// Sends a control message. Before the channel is connected the message
    /// waits out the send grace window, then fails instead of queuing.
    pub async fn send(&self, message: SignalMessage) -> Result<(), CallError> {
        let kind = message.kind();

        if !self.is_connected() {
            self.wait_for_connection(kind).await?;
        }

        let outbound = match self.inner.outbound.lock().await.clone() {
            Some(outbound) => outbound,
            None => {
                // The link dropped between the state check and the lock.
                self.wait_for_connection(kind).await?;
                self.inner
                    .outbound
                    .lock()
                    .await
                    .clone()
                    .ok_or_else(|| CallError::SignalingUnavailable {
                        message: format!("'{}' could not be delivered", kind),
                    })?
            }
        };

        outbound.send(message).await.map_err(|_| {
            warn!("Signaling connection closed while sending '{}'", kind);
            CallError::SignalingUnavailable {
                message: "signaling connection closed".to_string(),
            }
        })?;

        debug!("Sent '{}' signal", kind);
        Ok(())
    }

    async fn wait_for_connection(&self, kind: &str) -> Result<(), CallError> {
        let mut state_rx = self.inner.state_tx.subscribe();
        let connected = timeout(self.inner.settings.send_grace, async {
            state_rx
                .wait_for(|state| matches!(state, ConnectionState::Connected | ConnectionState::Failed))
                .await
                .map(|state| *state == ConnectionState::Connected)
        })
        .await;

        if matches!(connected, Ok(Ok(true))) {
            Ok(())
        } else {
            warn!("Dropping '{}' signal: channel not connected", kind);
            Err(CallError::SignalingUnavailable {
                message: format!("'{}' could not be delivered", kind),
            })
        }
    }

    pub async fn disconnect(&self) {
        if let Some(handle) = self.inner.supervisor.lock().await.take() {
            handle.abort();
        }
        self.inner.state_tx.send_replace(ConnectionState::Disconnected);
        *self.inner.outbound.lock().await = None;
        info!("Signaling channel disconnected");
    }

    async fn supervise(&self, credential: String) {
        let settings = &self.inner.settings;
        let policy = RetryPolicy::new(
            settings.reconnect_attempts,
            settings.reconnect_delay,
            settings.reconnect_delay_max,
        );
        let mut failures: u32 = 0;
        let mut was_connected = false;

        loop {
            if failures > 0 || was_connected {
                self.inner
                    .state_tx
                    .send_replace(ConnectionState::Reconnecting { attempt: failures + 1 });
            }

            let attempt = timeout(settings.connect_timeout, self.inner.transport.connect(&credential))
                .await
                .unwrap_or_else(|_| {
                    Err(CallError::SignalingUnavailable {
                        message: format!("transport connect timed out after {:?}", settings.connect_timeout),
                    })
                });

            match attempt {
                Ok(link) => {
                    failures = 0;
                    was_connected = true;
                    *self.inner.outbound.lock().await = Some(link.outbound);
                    self.inner.state_tx.send_replace(ConnectionState::Connected);
                    info!("Signaling channel connected");

                    let mut inbound = link.inbound;
                    while let Some(envelope) = inbound.recv().await {
                        debug!(
                            appointment_id = envelope.message.appointment_id().unwrap_or("-"),
                            "Received '{}' signal",
                            envelope.message.kind()
                        );
                        // No subscribers just means nobody is listening yet.
                        let _ = self.inner.inbound_tx.send(envelope);
                    }

                    // Leave Connected first so concurrent sends wait for the next link.
                    self.inner
                        .state_tx
                        .send_replace(ConnectionState::Reconnecting { attempt: 1 });
                    *self.inner.outbound.lock().await = None;
                    warn!("Signaling connection dropped, reconnecting");
                }
                Err(e) => {
                    if failures >= policy.max_retries {
                        error!("Signaling reconnect attempts exhausted: {}", e);
                        self.inner.state_tx.send_replace(ConnectionState::Failed);
                        return;
                    }
                    let delay = policy.delay_for(failures);
                    failures += 1;
                    warn!(
                        "Signaling connect failed (attempt {}/{}): {} - retrying in {:?}",
                        failures,
                        policy.max_retries,
                        e,
                        delay
                    );
                    sleep(delay).await;
                }
            }
        }
    }
}
