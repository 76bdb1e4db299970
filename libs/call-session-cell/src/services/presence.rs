// libs/call-session-cell/src/services/presence.rs
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use shared_models::auth::{CallIdentity, MediaCredentials};

use crate::error::CallError;
use crate::services::media::{MediaRuntime, MediaSessionClient};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GateStatus {
    Uninitialized,
    Initializing,
    Ready,
    Failed { error: CallError },
}

/// Readiness gate in front of every call attempt: the media client, device
/// and credentials must be initialized before the orchestrator may proceed.
///
/// Each initialization run carries a request id. A run that completes after
/// it timed out or was superseded by `retry`/`shutdown` is discarded and its
/// client shut down, so a late success never turns the gate ready.
#[derive(Clone)]
pub struct PresenceGate {
    inner: Arc<GateInner>,
}

struct GateInner {
    runtime: Arc<dyn MediaRuntime>,
    readiness_timeout: Duration,
    state: Mutex<GateState>,
    status_tx: watch::Sender<GateStatus>,
}

#[derive(Default)]
struct GateState {
    request_id: u64,
    in_flight: bool,
    client: Option<Arc<dyn MediaSessionClient>>,
    identity: Option<(CallIdentity, MediaCredentials)>,
}

impl PresenceGate {
    pub fn new(runtime: Arc<dyn MediaRuntime>, readiness_timeout: Duration) -> Self {
        let (status_tx, _) = watch::channel(GateStatus::Uninitialized);
        Self {
            inner: Arc::new(GateInner {
                runtime,
                readiness_timeout,
                state: Mutex::new(GateState::default()),
                status_tx,
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.inner.status_tx.borrow() == GateStatus::Ready
    }

    pub fn status(&self) -> GateStatus {
        self.inner.status_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<GateStatus> {
        self.inner.status_tx.subscribe()
    }

    pub async fn identity(&self) -> Option<CallIdentity> {
        let state = self.inner.state.lock().await;
        state.identity.as_ref().map(|(identity, _)| identity.clone())
    }

    /// Initializes the media client for `identity`. Concurrent callers join
    /// the run already in flight instead of starting a second one.
    #[instrument(skip(self, credentials), fields(user_id = %identity.user_id))]
    pub async fn initialize(
        &self,
        identity: CallIdentity,
        credentials: MediaCredentials,
    ) -> Result<Arc<dyn MediaSessionClient>, CallError> {
        if !identity.is_valid() || !credentials.is_complete() {
            return Err(CallError::GateFailure {
                message: "missing identity or media credentials".to_string(),
            });
        }
        if credentials.is_expired() {
            return Err(CallError::GateFailure {
                message: "media credentials expired".to_string(),
            });
        }

        let previous_client = {
            let mut state = self.inner.state.lock().await;
            let same_identity = state
                .identity
                .as_ref()
                .map(|(current, _)| current.user_id == identity.user_id)
                .unwrap_or(false);

            if same_identity {
                if let Some(client) = &state.client {
                    return Ok(client.clone());
                }
                if state.in_flight {
                    drop(state);
                    return self.wait_for_outcome().await;
                }
                state.identity = Some((identity, credentials));
                None
            } else {
                // A different user signed in: whatever belonged to the old one goes.
                state.request_id += 1;
                state.in_flight = false;
                state.identity = Some((identity, credentials));
                state.client.take()
            }
        };

        if let Some(client) = previous_client {
            self.inner.runtime.shutdown(client).await;
        }

        self.start_attempt().await
    }

    /// Returns the ready client, waiting for or starting initialization as needed.
    pub async fn ensure_ready(&self) -> Result<Arc<dyn MediaSessionClient>, CallError> {
        {
            let state = self.inner.state.lock().await;
            if let Some(client) = &state.client {
                return Ok(client.clone());
            }
            if state.identity.is_none() {
                return Err(CallError::GateFailure {
                    message: "not signed in".to_string(),
                });
            }
            if state.in_flight {
                drop(state);
                return self.wait_for_outcome().await;
            }
        }
        self.start_attempt().await
    }

    /// Tears down any partially initialized client and starts over.
    pub async fn retry(&self) -> Result<Arc<dyn MediaSessionClient>, CallError> {
        let stale = {
            let mut state = self.inner.state.lock().await;
            state.request_id += 1;
            state.in_flight = false;
            state.client.take()
        };

        if let Some(client) = stale {
            info!("Tearing down media client before retry");
            self.inner.runtime.shutdown(client).await;
        }

        self.start_attempt().await
    }

    /// Sign-out: drops identity and the process-wide media client.
    pub async fn shutdown(&self) {
        let client = {
            let mut state = self.inner.state.lock().await;
            state.request_id += 1;
            state.in_flight = false;
            state.identity = None;
            self.inner.status_tx.send_replace(GateStatus::Uninitialized);
            state.client.take()
        };

        if let Some(client) = client {
            self.inner.runtime.shutdown(client).await;
        }
        info!("Presence gate shut down");
    }

    async fn start_attempt(&self) -> Result<Arc<dyn MediaSessionClient>, CallError> {
        let (request_id, identity, credentials) = {
            let mut state = self.inner.state.lock().await;
            let Some((identity, credentials)) = state.identity.clone() else {
                return Err(CallError::GateFailure {
                    message: "not signed in".to_string(),
                });
            };
            state.request_id += 1;
            state.in_flight = true;
            self.inner.status_tx.send_replace(GateStatus::Initializing);
            (state.request_id, identity, credentials)
        };

        info!("Initializing media client (request {})", request_id);

        let runtime = self.inner.runtime.clone();
        let mut task = tokio::spawn(async move { runtime.initialize(&identity, &credentials).await });

        match timeout(self.inner.readiness_timeout, &mut task).await {
            Ok(Ok(Ok(client))) => self.complete(request_id, Ok(client)).await,
            Ok(Ok(Err(e))) => {
                warn!("Media client initialization failed: {}", e);
                self.complete(
                    request_id,
                    Err(CallError::GateFailure {
                        message: e.friendly_message(),
                    }),
                )
                .await
            }
            Ok(Err(join_error)) => {
                self.complete(
                    request_id,
                    Err(CallError::GateFailure {
                        message: join_error.to_string(),
                    }),
                )
                .await
            }
            Err(_) => {
                warn!(
                    "Media client initialization timed out after {:?}",
                    self.inner.readiness_timeout
                );
                let result = self
                    .complete(
                        request_id,
                        Err(CallError::GateTimeout {
                            timeout_seconds: self.inner.readiness_timeout.as_secs(),
                        }),
                    )
                    .await;

                // The run keeps going in the background; whatever it produces is discarded.
                let gate = self.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(client)) = task.await {
                        debug!("Discarding media client from timed-out request {}", request_id);
                        gate.inner.runtime.shutdown(client).await;
                    }
                });

                result
            }
        }
    }

    async fn complete(
        &self,
        request_id: u64,
        result: Result<Arc<dyn MediaSessionClient>, CallError>,
    ) -> Result<Arc<dyn MediaSessionClient>, CallError> {
        let mut state = self.inner.state.lock().await;

        if state.request_id != request_id {
            debug!(
                "Discarding stale gate result (request {}, current {})",
                request_id, state.request_id
            );
            let superseded_by_retry = state.in_flight;
            drop(state);
            if let Ok(client) = result {
                self.inner.runtime.shutdown(client).await;
            }
            return if superseded_by_retry {
                self.wait_for_outcome().await
            } else {
                Err(CallError::GateFailure {
                    message: "initialization was cancelled".to_string(),
                })
            };
        }

        state.in_flight = false;
        match result {
            Ok(client) => {
                state.client = Some(client.clone());
                self.inner.status_tx.send_replace(GateStatus::Ready);
                info!("Media client ready");
                Ok(client)
            }
            Err(error) => {
                self.inner
                    .status_tx
                    .send_replace(GateStatus::Failed { error: error.clone() });
                Err(error)
            }
        }
    }

    async fn wait_for_outcome(&self) -> Result<Arc<dyn MediaSessionClient>, CallError> {
        let mut rx = self.inner.status_tx.subscribe();
        let waited = timeout(self.inner.readiness_timeout, async {
            rx.wait_for(|status| *status != GateStatus::Initializing)
                .await
                .map(|status| status.clone())
        })
        .await;

        match waited {
            Ok(Ok(GateStatus::Ready)) => {
                let state = self.inner.state.lock().await;
                state.client.clone().ok_or_else(|| CallError::GateFailure {
                    message: "media client was shut down".to_string(),
                })
            }
            Ok(Ok(GateStatus::Failed { error })) => Err(error),
            Ok(Ok(_)) | Ok(Err(_)) => Err(CallError::GateFailure {
                message: "not signed in".to_string(),
            }),
            Err(_) => Err(CallError::GateTimeout {
                timeout_seconds: self.inner.readiness_timeout.as_secs(),
            }),
        }
    }
}
