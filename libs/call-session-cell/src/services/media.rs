// libs/call-session-cell/src/services/media.rs
//! Capability boundary to the real-time media engine. The engine itself
//! (encode/decode/routing) lives outside this crate; the orchestrator only
//! drives session lifecycle through these traits.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use shared_models::auth::{CallIdentity, MediaCredentials};

use crate::error::MediaError;

/// Per-attempt session object. Each `create_or_join` yields a fresh handle,
/// even for the same session id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaHandle {
    pub id: Uuid,
    pub session_id: String,
}

impl MediaHandle {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session_id.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaState {
    Joined,
    Left,
    Reconnecting,
    Ended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaEvent {
    pub handle_id: Uuid,
    pub state: MediaState,
    pub participant_count: u32,
}

#[async_trait]
pub trait MediaSessionClient: Send + Sync {
    async fn create_or_join(&self, session_id: &str, participants: &[String]) -> Result<MediaHandle, MediaError>;

    async fn join(&self, handle: &MediaHandle) -> Result<(), MediaError>;

    async fn leave(&self, handle: &MediaHandle) -> Result<(), MediaError>;

    async fn end_for_all(&self, handle: &MediaHandle) -> Result<(), MediaError>;

    /// State transitions for every handle this client owns.
    fn subscribe(&self) -> broadcast::Receiver<MediaEvent>;
}

impl std::fmt::Debug for dyn MediaSessionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSessionClient").finish_non_exhaustive()
    }
}

/// Factory for the process-wide media client (device + credential handle).
/// Created once per sign-in and torn down on sign-out or gate retry, never
/// per call.
#[async_trait]
pub trait MediaRuntime: Send + Sync {
    async fn initialize(
        &self,
        identity: &CallIdentity,
        credentials: &MediaCredentials,
    ) -> Result<Arc<dyn MediaSessionClient>, MediaError>;

    async fn shutdown(&self, client: Arc<dyn MediaSessionClient>);
}
