// libs/call-session-cell/src/error.rs
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shared_models::error::AppError;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CallError {
    #[error("Call service did not become ready within {timeout_seconds}s")]
    GateTimeout { timeout_seconds: u64 },

    #[error("Call service unavailable: {message}")]
    GateFailure { message: String },

    #[error("Signaling channel unavailable: {message}")]
    SignalingUnavailable { message: String },

    #[error("No answer")]
    InviteTimeout,

    #[error("Joining the call timed out after {timeout_seconds}s")]
    JoinTimeout { timeout_seconds: u64 },

    #[error("Failed to join the call: {message}")]
    JoinFailure { message: String },

    #[error("Connection lost")]
    ReconnectTimeout,

    #[error("The other participant ended the call")]
    RemoteEnded,

    #[error("Call was declined")]
    RemoteDeclined { reason: Option<String> },

    #[error("The other participant is busy")]
    RemoteBusy,

    #[error("A call is already in progress for appointment {appointment_id}")]
    CallInProgress { appointment_id: String },

    #[error("No incoming call to answer")]
    NoPendingInvite,

    #[error("Operation not allowed while the call is {phase}")]
    InvalidPhase { phase: String },

    #[error("Call attempt was cancelled")]
    AttemptSuperseded,
}

impl CallError {
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::GateTimeout { .. } => "gate_timeout",
            CallError::GateFailure { .. } => "gate_failure",
            CallError::SignalingUnavailable { .. } => "signaling_unavailable",
            CallError::InviteTimeout => "invite_timeout",
            CallError::JoinTimeout { .. } => "join_timeout",
            CallError::JoinFailure { .. } => "join_failure",
            CallError::ReconnectTimeout => "reconnect_timeout",
            CallError::RemoteEnded => "remote_ended",
            CallError::RemoteDeclined { .. } => "remote_declined",
            CallError::RemoteBusy => "remote_busy",
            CallError::CallInProgress { .. } => "call_in_progress",
            CallError::NoPendingInvite => "no_pending_invite",
            CallError::InvalidPhase { .. } => "invalid_phase",
            CallError::AttemptSuperseded => "attempt_superseded",
        }
    }

    /// Errors from user-initiated actions; the UI offers a retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CallError::GateTimeout { .. }
                | CallError::GateFailure { .. }
                | CallError::SignalingUnavailable { .. }
                | CallError::InviteTimeout
                | CallError::JoinTimeout { .. }
                | CallError::JoinFailure { .. }
                | CallError::RemoteBusy
        )
    }

    /// Outcomes of passive/background events, shown as information and
    /// never blocking a new call.
    pub fn is_informational(&self) -> bool {
        matches!(
            self,
            CallError::RemoteEnded
                | CallError::RemoteDeclined { .. }
                | CallError::RemoteBusy
                | CallError::ReconnectTimeout
        )
    }

    pub fn user_message(&self) -> String {
        match self {
            CallError::GateTimeout { .. } | CallError::GateFailure { .. } => {
                "Video service is initializing. Please wait a moment and try again.".to_string()
            }
            CallError::SignalingUnavailable { .. } => {
                "Unable to reach the call service. Check your connection and try again.".to_string()
            }
            CallError::InviteTimeout => "No answer. Please try again later.".to_string(),
            CallError::JoinTimeout { .. } => {
                "Unable to join the call. Please try again in a few seconds.".to_string()
            }
            CallError::JoinFailure { message } => message.clone(),
            CallError::ReconnectTimeout => "The connection was lost.".to_string(),
            CallError::RemoteEnded => "The call has ended.".to_string(),
            CallError::RemoteDeclined { .. } => "Call was declined.".to_string(),
            CallError::RemoteBusy => "The other participant is on another call.".to_string(),
            other => other.to_string(),
        }
    }

    pub fn view(&self) -> CallErrorView {
        CallErrorView {
            kind: self.kind().to_string(),
            message: self.user_message(),
            retryable: self.is_retryable(),
            informational: self.is_informational(),
        }
    }
}

/// What the UI renders for the last error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallErrorView {
    pub kind: String,
    pub message: String,
    pub retryable: bool,
    pub informational: bool,
}

/// Failures reported by the media capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MediaError {
    #[error("media permission denied: {0}")]
    PermissionDenied(String),

    #[error("media device not found: {0}")]
    DeviceNotFound(String),

    #[error("media network error: {0}")]
    Network(String),

    #[error("media session rejected: {0}")]
    Rejected(String),

    #[error("media error: {0}")]
    Other(String),
}

impl MediaError {
    /// Classifies a raw engine error message.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let normalized = message.to_lowercase();

        if normalized.contains("notallowed") || normalized.contains("permission") {
            MediaError::PermissionDenied(message)
        } else if normalized.contains("notfound")
            || normalized.contains("device")
            || normalized.contains("getusermedia")
        {
            MediaError::DeviceNotFound(message)
        } else if normalized.contains("network")
            || normalized.contains("timeout")
            || normalized.contains("connection")
        {
            MediaError::Network(message)
        } else {
            MediaError::Other(message)
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, MediaError::Network(_))
    }

    pub fn friendly_message(&self) -> String {
        match self {
            MediaError::PermissionDenied(_) => {
                "Camera or microphone permission was denied. Please enable it and try again.".to_string()
            }
            MediaError::DeviceNotFound(_) => {
                "No camera or microphone was found. Please connect a device and try again.".to_string()
            }
            MediaError::Network(_) => {
                "Unable to join the call. Please try again in a few seconds.".to_string()
            }
            MediaError::Rejected(_) => "Call could not be accepted. Please try again.".to_string(),
            MediaError::Other(_) => "Something went wrong with the call. Please try again.".to_string(),
        }
    }
}

impl From<MediaError> for CallError {
    fn from(err: MediaError) -> Self {
        CallError::JoinFailure {
            message: err.friendly_message(),
        }
    }
}

impl From<CallError> for AppError {
    fn from(err: CallError) -> Self {
        match err {
            CallError::CallInProgress { .. } => AppError::Conflict(err.to_string()),
            CallError::NoPendingInvite => AppError::NotFound(err.to_string()),
            CallError::InvalidPhase { .. } | CallError::AttemptSuperseded => AppError::BadRequest(err.to_string()),
            CallError::GateFailure { .. } | CallError::SignalingUnavailable { .. } => {
                AppError::ServiceUnavailable(err.user_message())
            }
            CallError::GateTimeout { .. } | CallError::JoinTimeout { .. } | CallError::InviteTimeout => {
                AppError::Timeout(err.user_message())
            }
            other => AppError::Internal(other.user_message()),
        }
    }
}
