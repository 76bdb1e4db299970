// libs/call-session-cell/src/models.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use shared_models::auth::ParticipantRole;

use crate::error::{CallError, CallErrorView};

// ==============================================================================
// CALL SESSION DOMAIN MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum CallRole {
    #[serde(rename = "initiator")]
    Initiator,
    #[serde(rename = "responder")]
    Responder,
}

/// Single source of truth for where a call attempt is. The UI flags
/// (`is_ringing`, `is_connecting`, ...) are projections of this value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CallPhase {
    #[default]
    Idle,
    GateWait,
    Initiating,
    Ringing,
    Connecting,
    Active,
    Reconnecting,
    Ended,
    Error,
}

impl CallPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallPhase::Ended | CallPhase::Error)
    }

    /// Phases in which `cancel` applies.
    pub fn is_pre_active(&self) -> bool {
        matches!(
            self,
            CallPhase::GateWait | CallPhase::Initiating | CallPhase::Ringing | CallPhase::Connecting
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(self, CallPhase::Active | CallPhase::Reconnecting)
    }

    pub fn can_transition_to(&self, target: &CallPhase) -> bool {
        use CallPhase::*;
        match (self, target) {
            (Idle, GateWait) => true,
            (GateWait, Initiating) => true,
            // Responder skips ringing: it does not ring itself.
            (GateWait, Connecting) => true,
            (Initiating, Ringing) => true,
            (Ringing, Connecting) => true,
            (Connecting, Active) => true,
            (Active, Reconnecting) => true,
            (Reconnecting, Active) => true,
            (Ended | Error, Idle) => true,
            (from, Ended | Error) => !from.is_terminal() && *from != Idle,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallPhase::Idle => "idle",
            CallPhase::GateWait => "gate_wait",
            CallPhase::Initiating => "initiating",
            CallPhase::Ringing => "ringing",
            CallPhase::Connecting => "connecting",
            CallPhase::Active => "active",
            CallPhase::Reconnecting => "reconnecting",
            CallPhase::Ended => "ended",
            CallPhase::Error => "error",
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerIdentity {
    pub peer_id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallSession {
    /// Correlates signaling, the media session and the call log.
    pub session_id: String,
    pub appointment_id: String,
    pub role: CallRole,
    pub phase: CallPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer: Option<PeerIdentity>,
    /// Set when the local participant first joins the media session.
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub attempt: u64,
}

impl CallSession {
    pub fn new(appointment_id: &str, role: CallRole, attempt: u64) -> Self {
        Self {
            session_id: Self::session_id_for(appointment_id),
            appointment_id: appointment_id.to_string(),
            role,
            phase: CallPhase::GateWait,
            peer: None,
            started_at: None,
            last_error: None,
            created_at: Utc::now(),
            attempt,
        }
    }

    /// Both parties derive the media session from the appointment, so an
    /// invite only needs to carry the appointment id.
    pub fn session_id_for(appointment_id: &str) -> String {
        format!("appointment_{}", appointment_id)
    }

    /// Peer identity is resolved once; later assignments are ignored.
    pub fn assign_peer(&mut self, peer: PeerIdentity) -> bool {
        if self.peer.is_some() {
            return false;
        }
        self.peer = Some(peer);
        true
    }

    pub fn transition(&mut self, next: CallPhase) -> bool {
        if !self.phase.can_transition_to(&next) {
            return false;
        }
        self.phase = next;
        if !next.is_terminal() {
            self.last_error = None;
        }
        true
    }

    pub fn mark_started(&mut self, at: DateTime<Utc>) {
        if self.started_at.is_none() {
            self.started_at = Some(at);
        }
    }

    pub fn duration_seconds(&self, now: DateTime<Utc>) -> Option<i64> {
        self.started_at.map(|started| (now - started).num_seconds().max(0))
    }
}

/// An invite shown to the local user and not yet answered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingInvite {
    pub appointment_id: String,
    pub caller_id: String,
    pub caller_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caller_role: Option<ParticipantRole>,
    pub received_at: DateTime<Utc>,
}

impl PendingInvite {
    pub fn caller(&self) -> PeerIdentity {
        PeerIdentity {
            peer_id: self.caller_id.clone(),
            display_name: self.caller_name.clone(),
            role: self.caller_role,
        }
    }
}

/// How a call attempt finished.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CallOutcome {
    /// Local participant left; the session stays up for the peer.
    Left,
    EndedForAll,
    Cancelled,
    NoAnswer,
    Declined {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    Busy,
    RemoteEnded,
    ConnectionLost,
    Failed { error: CallError },
}

impl CallOutcome {
    pub fn terminal_phase(&self) -> CallPhase {
        match self {
            CallOutcome::Failed { .. } => CallPhase::Error,
            _ => CallPhase::Ended,
        }
    }

    /// The error surfaced to the UI for this outcome, if any.
    pub fn error(&self) -> Option<CallError> {
        match self {
            CallOutcome::Left | CallOutcome::EndedForAll | CallOutcome::Cancelled => None,
            CallOutcome::NoAnswer => Some(CallError::InviteTimeout),
            CallOutcome::Declined { reason } => Some(CallError::RemoteDeclined { reason: reason.clone() }),
            CallOutcome::Busy => Some(CallError::RemoteBusy),
            CallOutcome::RemoteEnded => Some(CallError::RemoteEnded),
            CallOutcome::ConnectionLost => Some(CallError::ReconnectTimeout),
            CallOutcome::Failed { error } => Some(error.clone()),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallOutcome::Left => "left",
            CallOutcome::EndedForAll => "ended_for_all",
            CallOutcome::Cancelled => "cancelled",
            CallOutcome::NoAnswer => "no_answer",
            CallOutcome::Declined { .. } => "declined",
            CallOutcome::Busy => "busy",
            CallOutcome::RemoteEnded => "remote_ended",
            CallOutcome::ConnectionLost => "connection_lost",
            CallOutcome::Failed { .. } => "failed",
        }
    }
}

impl fmt::Display for CallOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final record handed to the call-log collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallReport {
    pub appointment_id: String,
    pub session_id: String,
    pub role: CallRole,
    #[serde(flatten)]
    pub outcome: CallOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub duration_seconds: Option<i64>,
}

impl CallReport {
    pub fn from_session(session: &CallSession, outcome: CallOutcome, ended_at: DateTime<Utc>) -> Self {
        Self {
            appointment_id: session.appointment_id.clone(),
            session_id: session.session_id.clone(),
            role: session.role,
            outcome,
            peer_id: session.peer.as_ref().map(|p| p.peer_id.clone()),
            started_at: session.started_at,
            ended_at,
            duration_seconds: session.duration_seconds(ended_at),
        }
    }
}

/// Read model for UI binding.
#[derive(Debug, Clone, Serialize, Default)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<CallSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub incoming: Option<PendingInvite>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<CallErrorView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_report: Option<CallReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_online: Option<bool>,
}

impl CallSnapshot {
    pub fn is_initializing(&self) -> bool {
        matches!(self.phase, CallPhase::GateWait | CallPhase::Initiating)
    }

    pub fn is_ringing(&self) -> bool {
        self.phase == CallPhase::Ringing
    }

    pub fn is_connecting(&self) -> bool {
        self.phase == CallPhase::Connecting
    }

    pub fn is_in_call(&self) -> bool {
        self.phase.is_live()
    }

    pub fn has_incoming_call(&self) -> bool {
        self.incoming.is_some()
    }
}

// ==============================================================================
// SIGNALING WIRE MODELS
// ==============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    Declined,
    Busy,
    Unavailable,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::Declined => "declined",
            DeclineReason::Busy => "busy",
            DeclineReason::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InviteAckStatus {
    Delivered,
    PeerOffline,
}

/// Control messages carried by the signaling channel. The acting party's
/// identity is never part of the payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SignalMessage {
    Invite {
        appointment_id: String,
    },
    InviteAck {
        appointment_id: String,
        status: InviteAckStatus,
    },
    Accept {
        appointment_id: String,
    },
    Decline {
        appointment_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<DeclineReason>,
    },
    Cancel {
        appointment_id: String,
    },
    PeerPresence {
        role: ParticipantRole,
        online: bool,
    },
    CallEnded {
        appointment_id: String,
    },
}

impl SignalMessage {
    pub fn appointment_id(&self) -> Option<&str> {
        match self {
            SignalMessage::Invite { appointment_id }
            | SignalMessage::InviteAck { appointment_id, .. }
            | SignalMessage::Accept { appointment_id }
            | SignalMessage::Decline { appointment_id, .. }
            | SignalMessage::Cancel { appointment_id }
            | SignalMessage::CallEnded { appointment_id } => Some(appointment_id),
            SignalMessage::PeerPresence { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Invite { .. } => "invite",
            SignalMessage::InviteAck { .. } => "invite_ack",
            SignalMessage::Accept { .. } => "accept",
            SignalMessage::Decline { .. } => "decline",
            SignalMessage::Cancel { .. } => "cancel",
            SignalMessage::PeerPresence { .. } => "peer_presence",
            SignalMessage::CallEnded { .. } => "call_ended",
        }
    }
}

/// Authenticated identity the rendezvous service attaches to relayed messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SignalSender {
    pub user_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ParticipantRole>,
}

impl From<SignalSender> for PeerIdentity {
    fn from(sender: SignalSender) -> Self {
        PeerIdentity {
            peer_id: sender.user_id,
            display_name: sender.display_name,
            role: sender.role,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SignalEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<SignalSender>,
    #[serde(flatten)]
    pub message: SignalMessage,
}

impl SignalEnvelope {
    pub fn new(sender: Option<SignalSender>, message: SignalMessage) -> Self {
        Self { sender, message }
    }
}
