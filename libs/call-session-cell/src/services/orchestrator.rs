// libs/call-session-cell/src/services/orchestrator.rs
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use shared_config::CallTimeouts;
use shared_utils::{retry_with_backoff, RetryPolicy};

use crate::error::{CallError, MediaError};
use crate::models::{
    CallOutcome, CallPhase, CallReport, CallRole, CallSession, CallSnapshot, DeclineReason,
    InviteAckStatus, PendingInvite, SignalEnvelope, SignalMessage, SignalSender,
};
use crate::services::incoming::{IncomingCallSurface, InviteDisposition};
use crate::services::media::{MediaEvent, MediaHandle, MediaSessionClient, MediaState};
use crate::services::presence::PresenceGate;
use crate::services::reporter::CallReporter;
use crate::services::signaling::SignalingChannel;
use crate::services::timers::{CallTimers, TimerKind};

/// Per-attempt media session, paired with the process-wide client that owns it.
#[derive(Clone)]
struct AttemptMedia {
    client: Arc<dyn MediaSessionClient>,
    handle: MediaHandle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MediaTeardown {
    Leave,
    EndForAll,
}

struct OrchestratorState {
    attempt_seq: u64,
    /// Set synchronously at call entry, cleared only on return to idle.
    attempt_started: bool,
    session: Option<CallSession>,
    media: Option<AttemptMedia>,
    media_pump_stop: Option<oneshot::Sender<()>>,
    timers: CallTimers,
    incoming: IncomingCallSurface,
    invite_dispatched: bool,
    accept_sent: bool,
    last_error: Option<CallError>,
    last_report: Option<CallReport>,
    peer_online: Option<bool>,
    /// Appointment of the last outbound attempt that failed retryably.
    last_failed: Option<String>,
}

impl OrchestratorState {
    fn new() -> Self {
        Self {
            attempt_seq: 0,
            attempt_started: false,
            session: None,
            media: None,
            media_pump_stop: None,
            timers: CallTimers::new(),
            incoming: IncomingCallSurface::new(),
            invite_dispatched: false,
            accept_sent: false,
            last_error: None,
            last_report: None,
            peer_online: None,
            last_failed: None,
        }
    }

    fn is_current(&self, attempt: u64) -> bool {
        self.session
            .as_ref()
            .map(|s| s.attempt == attempt && !s.phase.is_terminal())
            .unwrap_or(false)
    }

    fn phase(&self) -> CallPhase {
        self.session.as_ref().map(|s| s.phase).unwrap_or(CallPhase::Idle)
    }

    /// The live session for `appointment_id`, if any.
    fn session_for(&self, appointment_id: &str) -> Option<&CallSession> {
        self.session
            .as_ref()
            .filter(|s| s.appointment_id == appointment_id && !s.phase.is_terminal())
    }

    fn advance(&mut self, next: CallPhase) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        let from = session.phase;
        if session.transition(next) {
            info!(appointment_id = %session.appointment_id, "Call phase {} -> {}", from, next);
            true
        } else {
            warn!(appointment_id = %session.appointment_id, "Rejected call phase {} -> {}", from, next);
            false
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            phase: self.phase(),
            session: self.session.clone(),
            incoming: self.incoming.current().cloned(),
            last_error: self.last_error.as_ref().map(CallError::view),
            last_report: self.last_report.clone(),
            peer_online: self.peer_online,
        }
    }

    fn stop_session_timers(&mut self) {
        self.timers.cancel(TimerKind::Ring);
        self.timers.cancel(TimerKind::Connection);
        self.timers.cancel(TimerKind::Reconnect);
    }
}

/// What the teardown funnel has to do once the attempt is marked terminal.
struct Teardown {
    session: CallSession,
    media: Option<(AttemptMedia, MediaTeardown)>,
    signal: Option<SignalMessage>,
}

/// State machine for one call attempt at a time.
///
/// Every async result is checked against the attempt id it was started for;
/// results belonging to a superseded attempt are dropped, and any media
/// session they produced is torn down again. All terminations go through
/// `finish_attempt`.
pub struct CallSessionOrchestrator {
    gate: PresenceGate,
    signaling: SignalingChannel,
    reporter: Arc<dyn CallReporter>,
    timeouts: CallTimeouts,
    create_policy: RetryPolicy,
    state: Mutex<OrchestratorState>,
    snapshot_tx: watch::Sender<CallSnapshot>,
    listener: std::sync::Mutex<Option<JoinHandle<()>>>,
    me: Weak<CallSessionOrchestrator>,
}

impl CallSessionOrchestrator {
    /// Builds the orchestrator and starts consuming inbound signals.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        gate: PresenceGate,
        signaling: SignalingChannel,
        reporter: Arc<dyn CallReporter>,
        timeouts: CallTimeouts,
    ) -> Arc<Self> {
        let (snapshot_tx, _) = watch::channel(CallSnapshot::default());
        let orchestrator = Arc::new_cyclic(|me| Self {
            gate,
            signaling,
            reporter,
            timeouts,
            create_policy: RetryPolicy::default(),
            state: Mutex::new(OrchestratorState::new()),
            snapshot_tx,
            listener: std::sync::Mutex::new(None),
            me: me.clone(),
        });
        orchestrator.spawn_signal_listener();
        orchestrator
    }

    pub fn gate(&self) -> &PresenceGate {
        &self.gate
    }

    pub fn signaling(&self) -> &SignalingChannel {
        &self.signaling
    }

    pub fn snapshot(&self) -> CallSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self, state: &OrchestratorState) {
        self.snapshot_tx.send_replace(state.snapshot());
    }

    fn spawn_signal_listener(&self) {
        let mut inbound = self.signaling.subscribe();
        let me = self.me.clone();

        let handle = tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(envelope) => {
                        let Some(this) = me.upgrade() else { break };
                        this.handle_signal(envelope).await;
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Signal listener lagged, {} messages skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Signal listener stopped");
        });

        if let Ok(mut listener) = self.listener.lock() {
            *listener = Some(handle);
        }
    }

    // ==========================================================================
    // OUTBOUND CALLS
    // ==========================================================================

    /// Places a call for `appointment_id`. Returns once the invite is out and
    /// the call is ringing; everything after that arrives on the snapshot
    /// stream.
    #[instrument(skip(self, appointment_id), fields(appointment_id = %appointment_id))]
    pub async fn start_call(&self, appointment_id: &str) -> Result<(), CallError> {
        let attempt = {
            let mut state = self.state.lock().await;
            if state.attempt_started {
                let current = state
                    .session
                    .as_ref()
                    .map(|s| s.appointment_id.clone())
                    .unwrap_or_default();
                info!("Call already in progress for appointment {}, ignoring start", current);
                return Err(CallError::CallInProgress { appointment_id: current });
            }
            if let Some(invite) = state.incoming.current() {
                return Err(CallError::CallInProgress {
                    appointment_id: invite.appointment_id.clone(),
                });
            }

            state.attempt_seq += 1;
            let attempt = state.attempt_seq;
            state.attempt_started = true;
            state.session = Some(CallSession::new(appointment_id, CallRole::Initiator, attempt));
            state.invite_dispatched = false;
            state.accept_sent = false;
            state.last_error = None;
            state.last_failed = None;
            state.peer_online = None;
            info!("Call phase idle -> gate_wait (attempt {})", attempt);
            self.publish(&state);
            attempt
        };

        let client = match self.gate.ensure_ready().await {
            Ok(client) => client,
            Err(e) => {
                self.finish_attempt(attempt, CallOutcome::Failed { error: e.clone() }).await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock().await;
            if !state.is_current(attempt) {
                debug!("Gate became ready for superseded attempt {}", attempt);
                return Err(CallError::AttemptSuperseded);
            }
            state.advance(CallPhase::Initiating);
            self.publish(&state);
        }

        let session_id = CallSession::session_id_for(appointment_id);
        let handle = match self.create_media(&client, &session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.finish_attempt(attempt, CallOutcome::Failed { error: e.clone() }).await;
                return Err(e);
            }
        };
        let media = AttemptMedia { client, handle };

        {
            let mut state = self.state.lock().await;
            if !state.is_current(attempt) {
                drop(state);
                warn!("Media session created for superseded attempt {}, ending it", attempt);
                self.teardown_media(&media, MediaTeardown::EndForAll).await;
                return Err(CallError::AttemptSuperseded);
            }
            self.attach_media(&mut state, attempt, media);
            // Marked before sending so a cancel racing the send still retracts the invite.
            state.invite_dispatched = true;
        }

        let invite = SignalMessage::Invite {
            appointment_id: appointment_id.to_string(),
        };
        if let Err(e) = self.signaling.send(invite).await {
            {
                let mut state = self.state.lock().await;
                if state.is_current(attempt) {
                    state.invite_dispatched = false;
                }
            }
            self.finish_attempt(attempt, CallOutcome::Failed { error: e.clone() }).await;
            return Err(e);
        }

        let mut state = self.state.lock().await;
        if !state.is_current(attempt) {
            return Err(CallError::AttemptSuperseded);
        }
        if state.phase() == CallPhase::Initiating {
            state.advance(CallPhase::Ringing);
            self.arm_timer(&mut state, TimerKind::Ring, self.timeouts.ring, attempt);
            self.publish(&state);
        }
        Ok(())
    }

    /// Cancels the attempt before it becomes active. Calling it again, or
    /// with nothing in progress, is a no-op.
    #[instrument(skip(self))]
    pub async fn cancel_call(&self) -> Result<(), CallError> {
        let attempt = {
            let state = self.state.lock().await;
            match state.session.as_ref() {
                None => return Ok(()),
                Some(session) if session.phase.is_terminal() => return Ok(()),
                Some(session) if session.phase.is_pre_active() => session.attempt,
                Some(session) => {
                    return Err(CallError::InvalidPhase {
                        phase: session.phase.to_string(),
                    })
                }
            }
        };

        self.finish_attempt(attempt, CallOutcome::Cancelled).await;
        Ok(())
    }

    /// Restarts the last outbound call that failed with a retryable error.
    #[instrument(skip(self))]
    pub async fn retry_call(&self) -> Result<(), CallError> {
        let appointment_id = {
            let state = self.state.lock().await;
            if state.attempt_started {
                return Err(CallError::CallInProgress {
                    appointment_id: state
                        .session
                        .as_ref()
                        .map(|s| s.appointment_id.clone())
                        .unwrap_or_default(),
                });
            }
            match (&state.last_failed, &state.last_error) {
                (Some(appointment_id), Some(error)) if error.is_retryable() => appointment_id.clone(),
                _ => {
                    return Err(CallError::InvalidPhase {
                        phase: CallPhase::Idle.to_string(),
                    })
                }
            }
        };

        info!("Retrying call for appointment {}", appointment_id);
        self.start_call(&appointment_id).await
    }

    pub async fn clear_error(&self) {
        let mut state = self.state.lock().await;
        state.last_error = None;
        state.last_failed = None;
        if let Some(session) = state.session.as_mut() {
            session.last_error = None;
        }
        self.publish(&state);
    }

    // ==========================================================================
    // INCOMING CALLS
    // ==========================================================================

    /// Answers the pending invite and joins the call. Skips `ringing`.
    #[instrument(skip(self))]
    pub async fn accept_incoming(&self) -> Result<(), CallError> {
        let (attempt, appointment_id) = {
            let mut state = self.state.lock().await;
            if state.attempt_started {
                return Err(CallError::CallInProgress {
                    appointment_id: state
                        .session
                        .as_ref()
                        .map(|s| s.appointment_id.clone())
                        .unwrap_or_default(),
                });
            }
            let Some(invite) = state.incoming.take() else {
                return Err(CallError::NoPendingInvite);
            };
            state.timers.cancel(TimerKind::InviteExpiry);

            state.attempt_seq += 1;
            let attempt = state.attempt_seq;
            let mut session = CallSession::new(&invite.appointment_id, CallRole::Responder, attempt);
            session.assign_peer(invite.caller());
            state.attempt_started = true;
            state.session = Some(session);
            state.invite_dispatched = false;
            state.accept_sent = false;
            state.last_error = None;
            state.last_failed = None;
            info!(
                "Accepting call for appointment {} from {} (attempt {})",
                invite.appointment_id, invite.caller_id, attempt
            );
            self.publish(&state);
            (attempt, invite.appointment_id)
        };

        let client = match self.gate.ensure_ready().await {
            Ok(client) => client,
            Err(e) => {
                self.finish_attempt(attempt, CallOutcome::Failed { error: e.clone() }).await;
                return Err(e);
            }
        };

        {
            let mut state = self.state.lock().await;
            if !state.is_current(attempt) {
                return Err(CallError::AttemptSuperseded);
            }
            state.accept_sent = true;
            state.advance(CallPhase::Connecting);
            self.arm_timer(&mut state, TimerKind::Connection, self.timeouts.connection, attempt);
            self.publish(&state);
        }

        let accept = SignalMessage::Accept {
            appointment_id: appointment_id.clone(),
        };
        if let Err(e) = self.signaling.send(accept).await {
            {
                let mut state = self.state.lock().await;
                if state.is_current(attempt) {
                    state.accept_sent = false;
                }
            }
            self.finish_attempt(attempt, CallOutcome::Failed { error: e.clone() }).await;
            return Err(e);
        }

        let session_id = CallSession::session_id_for(&appointment_id);
        let handle = match self.create_media(&client, &session_id).await {
            Ok(handle) => handle,
            Err(e) => {
                self.finish_attempt(attempt, CallOutcome::Failed { error: e.clone() }).await;
                return Err(e);
            }
        };
        let media = AttemptMedia { client, handle };

        {
            let mut state = self.state.lock().await;
            if !state.is_current(attempt) {
                drop(state);
                warn!("Media session joined for superseded attempt {}, leaving it", attempt);
                self.teardown_media(&media, MediaTeardown::Leave).await;
                return Err(CallError::AttemptSuperseded);
            }
            self.attach_media(&mut state, attempt, media.clone());
        }

        self.join_media(attempt, media).await
    }

    /// Declines the pending invite without waiting on the network.
    /// Declining twice sends one message.
    #[instrument(skip(self))]
    pub async fn decline_incoming(&self) {
        let invite = {
            let mut state = self.state.lock().await;
            let Some(invite) = state.incoming.take() else {
                debug!("No pending invite to decline");
                return;
            };
            state.timers.cancel(TimerKind::InviteExpiry);
            self.publish(&state);
            invite
        };

        info!("Declining call for appointment {}", invite.appointment_id);
        self.send_detached(SignalMessage::Decline {
            appointment_id: invite.appointment_id,
            reason: Some(DeclineReason::Declined),
        });
    }

    // ==========================================================================
    // ACTIVE CALLS
    // ==========================================================================

    /// Leaves the call; the media session stays up for the other party.
    #[instrument(skip(self))]
    pub async fn leave_active(&self) -> Result<(), CallError> {
        let attempt = self.live_attempt().await?;
        self.finish_attempt(attempt, CallOutcome::Left).await;
        Ok(())
    }

    /// Ends the call for both parties.
    #[instrument(skip(self))]
    pub async fn end_active(&self) -> Result<(), CallError> {
        let attempt = self.live_attempt().await?;
        self.finish_attempt(attempt, CallOutcome::EndedForAll).await;
        Ok(())
    }

    async fn live_attempt(&self) -> Result<u64, CallError> {
        let state = self.state.lock().await;
        match state.session.as_ref() {
            Some(session) if session.phase.is_live() => Ok(session.attempt),
            _ => Err(CallError::InvalidPhase {
                phase: state.phase().to_string(),
            }),
        }
    }

    /// Sign-out path: ends whatever is in progress and drops the pending invite.
    pub async fn shutdown(&self) {
        let (attempt, outcome, invite) = {
            let mut state = self.state.lock().await;
            state.timers.cancel(TimerKind::InviteExpiry);
            let invite = state.incoming.take();
            let running = state.session.as_ref().filter(|s| !s.phase.is_terminal()).map(|s| {
                let outcome = if s.phase.is_live() {
                    CallOutcome::Left
                } else {
                    CallOutcome::Cancelled
                };
                (s.attempt, outcome)
            });
            self.publish(&state);
            match running {
                Some((attempt, outcome)) => (Some(attempt), Some(outcome), invite),
                None => (None, None, invite),
            }
        };

        if let Some(invite) = invite {
            self.send_detached(SignalMessage::Decline {
                appointment_id: invite.appointment_id,
                reason: Some(DeclineReason::Unavailable),
            });
        }
        if let (Some(attempt), Some(outcome)) = (attempt, outcome) {
            self.finish_attempt(attempt, outcome).await;
        }
    }

    // ==========================================================================
    // SIGNAL HANDLING
    // ==========================================================================

    async fn handle_signal(&self, envelope: SignalEnvelope) {
        let SignalEnvelope { sender, message } = envelope;
        match message {
            SignalMessage::Invite { appointment_id } => self.on_invite(sender, appointment_id).await,
            SignalMessage::InviteAck { appointment_id, status } => {
                self.on_invite_ack(appointment_id, status).await
            }
            SignalMessage::Accept { appointment_id } => self.on_peer_accepted(sender, appointment_id).await,
            SignalMessage::Decline { appointment_id, reason } => {
                self.on_peer_declined(appointment_id, reason).await
            }
            SignalMessage::Cancel { appointment_id } => self.on_peer_cancelled(appointment_id).await,
            SignalMessage::CallEnded { appointment_id } => self.on_remote_call_ended(appointment_id).await,
            SignalMessage::PeerPresence { role, online } => {
                debug!("Peer presence: {} online={}", role.as_str(), online);
                let mut state = self.state.lock().await;
                state.peer_online = Some(online);
                self.publish(&state);
            }
        }
    }

    async fn on_invite(&self, sender: Option<SignalSender>, appointment_id: String) {
        let Some(sender) = sender else {
            warn!("Ignoring invite for appointment {} without sender identity", appointment_id);
            return;
        };

        let invite = PendingInvite {
            appointment_id: appointment_id.clone(),
            caller_id: sender.user_id,
            caller_name: sender.display_name,
            caller_role: sender.role,
            received_at: Utc::now(),
        };

        let disposition = {
            let mut state = self.state.lock().await;
            let busy = state.attempt_started;
            let disposition = state.incoming.offer(invite, busy);
            if disposition == InviteDisposition::Accepted {
                self.arm_invite_expiry(&mut state, appointment_id.clone());
                self.publish(&state);
            }
            disposition
        };

        match disposition {
            InviteDisposition::Accepted => info!("Incoming call for appointment {}", appointment_id),
            InviteDisposition::Duplicate => debug!("Duplicate invite for appointment {}", appointment_id),
            InviteDisposition::Busy => {
                info!("Busy, auto-declining invite for appointment {}", appointment_id);
                self.send_detached(SignalMessage::Decline {
                    appointment_id,
                    reason: Some(DeclineReason::Busy),
                });
            }
        }
    }

    async fn on_invite_ack(&self, appointment_id: String, status: InviteAckStatus) {
        let mut state = self.state.lock().await;
        if state.session_for(&appointment_id).is_none() {
            return;
        }
        if status == InviteAckStatus::PeerOffline {
            info!("Invite for appointment {} could not reach the peer", appointment_id);
            state.peer_online = Some(false);
        } else {
            state.peer_online = Some(true);
        }
        self.publish(&state);
    }

    async fn on_peer_accepted(&self, sender: Option<SignalSender>, appointment_id: String) {
        let (attempt, media) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.session_for(&appointment_id) else {
                debug!("Ignoring accept for appointment {}: no matching call", appointment_id);
                return;
            };
            if session.role != CallRole::Initiator || session.phase != CallPhase::Ringing {
                debug!("Ignoring accept for appointment {} in {}", appointment_id, session.phase);
                return;
            }
            let attempt = session.attempt;
            let Some(media) = state.media.clone() else {
                return;
            };

            if let (Some(sender), Some(session)) = (sender, state.session.as_mut()) {
                session.assign_peer(sender.into());
            }
            state.timers.cancel(TimerKind::Ring);
            state.advance(CallPhase::Connecting);
            state.peer_online = Some(true);
            self.arm_timer(&mut state, TimerKind::Connection, self.timeouts.connection, attempt);
            self.publish(&state);
            (attempt, media)
        };

        // Joined off the listener so later signals (cancel, call_ended) are not held up.
        if let Some(this) = self.me.upgrade() {
            tokio::spawn(async move {
                let _ = this.join_media(attempt, media).await;
            });
        }
    }

    async fn on_peer_declined(&self, appointment_id: String, reason: Option<DeclineReason>) {
        let attempt = {
            let state = self.state.lock().await;
            match state.session_for(&appointment_id) {
                Some(session) if session.role == CallRole::Initiator && session.phase.is_pre_active() => {
                    session.attempt
                }
                _ => {
                    debug!("Ignoring decline for appointment {}", appointment_id);
                    return;
                }
            }
        };

        let outcome = match reason {
            Some(DeclineReason::Busy) => CallOutcome::Busy,
            other => CallOutcome::Declined {
                reason: other.map(|r| r.as_str().to_string()),
            },
        };
        self.finish_attempt(attempt, outcome).await;
    }

    async fn on_peer_cancelled(&self, appointment_id: String) {
        let attempt = {
            let mut state = self.state.lock().await;
            if state.incoming.clear_if(&appointment_id).is_some() {
                state.timers.cancel(TimerKind::InviteExpiry);
                info!("Caller hung up before answer for appointment {}", appointment_id);
                self.publish(&state);
                return;
            }
            match state.session_for(&appointment_id) {
                Some(session) if session.phase.is_pre_active() => session.attempt,
                _ => {
                    debug!("Ignoring cancel for appointment {}", appointment_id);
                    return;
                }
            }
        };

        self.finish_attempt(attempt, CallOutcome::RemoteEnded).await;
    }

    async fn on_remote_call_ended(&self, appointment_id: String) {
        let attempt = {
            let mut state = self.state.lock().await;
            if state.incoming.clear_if(&appointment_id).is_some() {
                state.timers.cancel(TimerKind::InviteExpiry);
                self.publish(&state);
                return;
            }
            match state.session_for(&appointment_id) {
                Some(session) => session.attempt,
                None => {
                    debug!("Ignoring call_ended for appointment {}", appointment_id);
                    return;
                }
            }
        };

        self.finish_attempt(attempt, CallOutcome::RemoteEnded).await;
    }

    // ==========================================================================
    // MEDIA
    // ==========================================================================

    async fn create_media(
        &self,
        client: &Arc<dyn MediaSessionClient>,
        session_id: &str,
    ) -> Result<MediaHandle, CallError> {
        let participants: Vec<String> = self
            .gate
            .identity()
            .await
            .map(|identity| vec![identity.user_id])
            .unwrap_or_default();
        let participants = participants.as_slice();
        let client: &dyn MediaSessionClient = client.as_ref();

        let created = timeout(
            self.timeouts.connection,
            retry_with_backoff(
                &self.create_policy,
                "media session create",
                |e: &MediaError| e.is_transient(),
                move || client.create_or_join(session_id, participants),
            ),
        )
        .await;

        match created {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(e)) => {
                warn!("Failed to create media session {}: {}", session_id, e);
                Err(e.into())
            }
            Err(_) => Err(CallError::JoinTimeout {
                timeout_seconds: self.timeouts.connection.as_secs(),
            }),
        }
    }

    /// Stores the attempt's media session and starts forwarding its events.
    fn attach_media(&self, state: &mut OrchestratorState, attempt: u64, media: AttemptMedia) {
        let mut events = media.client.subscribe();
        let handle_id = media.handle.id;
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let me = self.me.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut stop_rx => break,
                    event = events.recv() => match event {
                        Ok(event) if event.handle_id == handle_id => {
                            let Some(this) = me.upgrade() else { break };
                            this.on_media_event(attempt, event).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Media event stream lagged, {} events skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        state.media = Some(media);
        state.media_pump_stop = Some(stop_tx);
    }

    async fn join_media(&self, attempt: u64, media: AttemptMedia) -> Result<(), CallError> {
        let result = media.client.join(&media.handle).await;

        let mut state = self.state.lock().await;
        if !state.is_current(attempt) || state.phase() != CallPhase::Connecting {
            drop(state);
            if result.is_ok() {
                warn!("Join completed for superseded attempt {}, leaving", attempt);
                self.teardown_media(&media, MediaTeardown::Leave).await;
            }
            return Err(CallError::AttemptSuperseded);
        }

        match result {
            Ok(()) => {
                state.timers.cancel(TimerKind::Connection);
                if let Some(session) = state.session.as_mut() {
                    session.mark_started(Utc::now());
                }
                state.advance(CallPhase::Active);
                self.publish(&state);
                Ok(())
            }
            Err(e) => {
                drop(state);
                warn!("Join failed: {}", e);
                let error: CallError = e.into();
                self.finish_attempt(attempt, CallOutcome::Failed { error: error.clone() }).await;
                Err(error)
            }
        }
    }

    async fn on_media_event(&self, attempt: u64, event: MediaEvent) {
        let outcome = {
            let mut state = self.state.lock().await;
            if !state.is_current(attempt) {
                return;
            }
            let phase = state.phase();
            debug!(
                "Media event {:?} in {} ({} participants)",
                event.state, phase, event.participant_count
            );

            match (event.state, phase) {
                (MediaState::Reconnecting, CallPhase::Active) => {
                    state.advance(CallPhase::Reconnecting);
                    self.arm_timer(&mut state, TimerKind::Reconnect, self.timeouts.reconnect, attempt);
                    self.publish(&state);
                    None
                }
                (MediaState::Joined, CallPhase::Reconnecting) => {
                    state.timers.cancel(TimerKind::Reconnect);
                    state.advance(CallPhase::Active);
                    self.publish(&state);
                    None
                }
                (MediaState::Ended, _) => Some(CallOutcome::RemoteEnded),
                (MediaState::Left, CallPhase::Active | CallPhase::Reconnecting) => {
                    Some(CallOutcome::ConnectionLost)
                }
                _ => None,
            }
        };

        if let Some(outcome) = outcome {
            self.finish_attempt(attempt, outcome).await;
        }
    }

    /// Bounded by the connection timeout; an unresponsive engine is abandoned.
    async fn teardown_media(&self, media: &AttemptMedia, action: MediaTeardown) {
        let request = async {
            match action {
                MediaTeardown::Leave => media.client.leave(&media.handle).await,
                MediaTeardown::EndForAll => media.client.end_for_all(&media.handle).await,
            }
        };
        match timeout(self.timeouts.connection, request).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Media teardown ({:?}) of {} failed: {}", action, media.handle.session_id, e);
            }
            Err(_) => {
                warn!(
                    "Media teardown ({:?}) of {} timed out after {:?}",
                    action, media.handle.session_id, self.timeouts.connection
                );
            }
        }
    }

    // ==========================================================================
    // TIMERS
    // ==========================================================================

    fn arm_timer(&self, state: &mut OrchestratorState, kind: TimerKind, after: Duration, attempt: u64) {
        let me = self.me.clone();
        state.timers.start(kind, after, move |generation| async move {
            if let Some(this) = me.upgrade() {
                this.on_timer(kind, attempt, generation).await;
            }
        });
    }

    fn arm_invite_expiry(&self, state: &mut OrchestratorState, appointment_id: String) {
        let me = self.me.clone();
        state
            .timers
            .start(TimerKind::InviteExpiry, self.timeouts.ring, move |generation| async move {
                if let Some(this) = me.upgrade() {
                    this.on_invite_expired(appointment_id, generation).await;
                }
            });
    }

    async fn on_timer(&self, kind: TimerKind, attempt: u64, generation: u64) {
        let outcome = {
            let mut state = self.state.lock().await;
            if !state.timers.take_fired(kind, generation) || !state.is_current(attempt) {
                debug!("Discarding stale {} timer", kind.as_str());
                return;
            }
            match (kind, state.phase()) {
                (TimerKind::Ring, CallPhase::Ringing) => CallOutcome::NoAnswer,
                (TimerKind::Connection, CallPhase::Connecting) => CallOutcome::Failed {
                    error: CallError::JoinTimeout {
                        timeout_seconds: self.timeouts.connection.as_secs(),
                    },
                },
                (TimerKind::Reconnect, CallPhase::Reconnecting) => CallOutcome::ConnectionLost,
                (_, phase) => {
                    debug!("{} timer fired in {}, ignoring", kind.as_str(), phase);
                    return;
                }
            }
        };

        info!("{} timer expired", kind.as_str());
        self.finish_attempt(attempt, outcome).await;
    }

    async fn on_invite_expired(&self, appointment_id: String, generation: u64) {
        let mut state = self.state.lock().await;
        if !state.timers.take_fired(TimerKind::InviteExpiry, generation) {
            return;
        }
        if state.incoming.clear_if(&appointment_id).is_some() {
            info!("Incoming call for appointment {} expired unanswered", appointment_id);
            self.publish(&state);
        }
    }

    // ==========================================================================
    // TEARDOWN FUNNEL
    // ==========================================================================

    /// The only way an attempt ends. The terminal phase is applied under the
    /// lock before anything is awaited, so a second trigger for the same
    /// attempt finds it terminal and returns; side effects run exactly once.
    async fn finish_attempt(&self, attempt: u64, outcome: CallOutcome) -> bool {
        let teardown = {
            let mut state = self.state.lock().await;
            if !state.is_current(attempt) {
                debug!("Attempt {} already finished, ignoring {}", attempt, outcome);
                return false;
            }

            let Some(from) = state.session.as_ref().map(|s| s.phase) else {
                return false;
            };
            state.advance(outcome.terminal_phase());
            state.stop_session_timers();
            state.media_pump_stop = None;

            let error = outcome.error();
            if let Some(session) = state.session.as_mut() {
                session.last_error = error.as_ref().map(CallError::user_message);
            }
            state.last_error = error;

            let Some(session) = state.session.clone() else {
                return false;
            };
            let engaged = state.invite_dispatched || state.accept_sent;
            let media = state.media.take().map(|media| {
                let action = match (&outcome, session.role) {
                    (CallOutcome::EndedForAll, _) => MediaTeardown::EndForAll,
                    (_, CallRole::Initiator) if from.is_pre_active() => MediaTeardown::EndForAll,
                    _ => MediaTeardown::Leave,
                };
                (media, action)
            });

            let signal = if from.is_pre_active() && engaged {
                Some(SignalMessage::Cancel {
                    appointment_id: session.appointment_id.clone(),
                })
            } else if outcome == CallOutcome::EndedForAll {
                Some(SignalMessage::CallEnded {
                    appointment_id: session.appointment_id.clone(),
                })
            } else {
                None
            };

            self.publish(&state);
            Teardown { session, media, signal }
        };

        info!(
            appointment_id = %teardown.session.appointment_id,
            "Call attempt {} finished: {}", attempt, outcome
        );

        if let Some(signal) = teardown.signal {
            match timeout(self.timeouts.connection, self.signaling.send(signal)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Failed to notify peer during teardown: {}", e),
                Err(_) => warn!("Timed out notifying peer during teardown"),
            }
        }
        if let Some((media, action)) = &teardown.media {
            self.teardown_media(media, *action).await;
        }

        let report = CallReport::from_session(&teardown.session, outcome.clone(), Utc::now());
        let reporter = self.reporter.clone();
        let pending_report = report.clone();
        tokio::spawn(async move {
            if let Err(e) = reporter.report(&pending_report).await {
                warn!("Failed to record call outcome: {:#}", e);
            }
        });

        let mut state = self.state.lock().await;
        if state.session.as_ref().map(|s| s.attempt) == Some(attempt) {
            state.session = None;
            state.attempt_started = false;
            state.invite_dispatched = false;
            state.accept_sent = false;
            state.last_report = Some(report);
            let retryable = state.last_error.as_ref().map(CallError::is_retryable).unwrap_or(false);
            if teardown.session.role == CallRole::Initiator && retryable {
                state.last_failed = Some(teardown.session.appointment_id.clone());
            }
            info!(appointment_id = %teardown.session.appointment_id, "Call phase {} -> idle", outcome.terminal_phase());
            self.publish(&state);
        }
        true
    }

    /// Sends a signal without waiting on the network.
    fn send_detached(&self, message: SignalMessage) {
        let signaling = self.signaling.clone();
        tokio::spawn(async move {
            let kind = message.kind();
            if let Err(e) = signaling.send(message).await {
                warn!("Failed to send '{}' signal: {}", kind, e);
            }
        });
    }
}

impl Drop for CallSessionOrchestrator {
    fn drop(&mut self) {
        if let Ok(mut listener) = self.listener.lock() {
            if let Some(handle) = listener.take() {
                handle.abort();
            }
        }
    }
}
