// libs/call-session-cell/src/services/client.rs
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use shared_config::AppConfig;
use shared_models::auth::{CallIdentity, MediaCredentials};

use crate::error::CallError;
use crate::services::media::MediaRuntime;
use crate::services::orchestrator::CallSessionOrchestrator;
use crate::services::presence::PresenceGate;
use crate::services::reporter::{reporter_from_config, CallReporter};
use crate::services::signaling::{SignalingChannel, SignalingTransport};
use crate::services::websocket::WebSocketTransport;

/// Process-scoped entry point: owns the signaling channel and the presence
/// gate for the signed-in user and hands out the orchestrator.
///
/// The media credential token also authenticates the signaling connection.
pub struct TelehealthCallClient {
    gate: PresenceGate,
    signaling: SignalingChannel,
    orchestrator: Arc<CallSessionOrchestrator>,
    identity: RwLock<Option<CallIdentity>>,
}

impl TelehealthCallClient {
    pub fn new(
        config: &AppConfig,
        transport: Arc<dyn SignalingTransport>,
        runtime: Arc<dyn MediaRuntime>,
        reporter: Arc<dyn CallReporter>,
    ) -> Self {
        let gate = PresenceGate::new(runtime, config.timeouts.readiness);
        let signaling = SignalingChannel::new(transport, config.signaling.clone());
        let orchestrator = CallSessionOrchestrator::new(
            gate.clone(),
            signaling.clone(),
            reporter,
            config.timeouts.clone(),
        );

        Self {
            gate,
            signaling,
            orchestrator,
            identity: RwLock::new(None),
        }
    }

    /// WebSocket signaling plus the reporter the configuration calls for.
    pub fn from_config(config: &AppConfig, runtime: Arc<dyn MediaRuntime>) -> Self {
        if !config.is_signaling_configured() {
            warn!("SIGNALING_URL '{}' is not a WebSocket URL", config.signaling.url);
        }
        Self::new(
            config,
            Arc::new(WebSocketTransport::new(config.signaling.url.clone())),
            runtime,
            reporter_from_config(config),
        )
    }

    pub fn orchestrator(&self) -> Arc<CallSessionOrchestrator> {
        self.orchestrator.clone()
    }

    pub async fn identity(&self) -> Option<CallIdentity> {
        self.identity.read().await.clone()
    }

    /// Connects signaling and starts gate initialization in the background.
    /// A signaling error is returned, but the channel keeps retrying.
    pub async fn sign_in(&self, identity: CallIdentity, credentials: MediaCredentials) -> Result<(), CallError> {
        if !identity.is_valid() || !credentials.is_complete() {
            return Err(CallError::GateFailure {
                message: "missing identity or media credentials".to_string(),
            });
        }

        info!("Signing in {} ({})", identity.display_name, identity.role.as_str());
        *self.identity.write().await = Some(identity.clone());

        let gate = self.gate.clone();
        let token = credentials.token.clone();
        tokio::spawn(async move {
            if let Err(e) = gate.initialize(identity, credentials).await {
                warn!("Background media initialization failed: {}", e);
            }
        });

        self.signaling.connect(&token).await
    }

    pub async fn sign_out(&self) {
        self.orchestrator.shutdown().await;
        self.signaling.disconnect().await;
        self.gate.shutdown().await;
        *self.identity.write().await = None;
        info!("Signed out");
    }
}
