// libs/call-session-cell/src/services/incoming.rs
use crate::models::PendingInvite;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteDisposition {
    /// Now the pending invite; show it to the user.
    Accepted,
    /// Re-delivery of the invite already pending.
    Duplicate,
    /// Something else is pending or a call is up; decline with `busy`.
    Busy,
}

/// Tracks the single invite awaiting an answer. Holds no I/O: the
/// orchestrator decides what to send based on what this returns.
#[derive(Debug, Default)]
pub struct IncomingCallSurface {
    pending: Option<PendingInvite>,
}

impl IncomingCallSurface {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offer(&mut self, invite: PendingInvite, call_in_progress: bool) -> InviteDisposition {
        if let Some(current) = &self.pending {
            if current.appointment_id == invite.appointment_id && current.caller_id == invite.caller_id {
                return InviteDisposition::Duplicate;
            }
            return InviteDisposition::Busy;
        }
        if call_in_progress {
            return InviteDisposition::Busy;
        }
        self.pending = Some(invite);
        InviteDisposition::Accepted
    }

    pub fn current(&self) -> Option<&PendingInvite> {
        self.pending.as_ref()
    }

    /// Removes the pending invite for answering. A second call returns
    /// `None`, which keeps accept/decline at-most-once.
    pub fn take(&mut self) -> Option<PendingInvite> {
        self.pending.take()
    }

    /// Clears the invite only when it belongs to `appointment_id`
    /// (caller cancelled, or the invite expired).
    pub fn clear_if(&mut self, appointment_id: &str) -> Option<PendingInvite> {
        match &self.pending {
            Some(invite) if invite.appointment_id == appointment_id => self.pending.take(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn invite(appointment_id: &str, caller_id: &str) -> PendingInvite {
        PendingInvite {
            appointment_id: appointment_id.to_string(),
            caller_id: caller_id.to_string(),
            caller_name: format!("Caller {}", caller_id),
            caller_role: None,
            received_at: Utc::now(),
        }
    }

    #[test]
    fn test_second_invite_is_busy_and_first_untouched() {
        let mut surface = IncomingCallSurface::new();
        assert_eq!(surface.offer(invite("A1", "doc-1"), false), InviteDisposition::Accepted);
        assert_eq!(surface.offer(invite("A2", "doc-2"), false), InviteDisposition::Busy);
        assert_eq!(surface.current().map(|i| i.appointment_id.as_str()), Some("A1"));
    }

    #[test]
    fn test_redelivered_invite_is_duplicate() {
        let mut surface = IncomingCallSurface::new();
        surface.offer(invite("A1", "doc-1"), false);
        assert_eq!(surface.offer(invite("A1", "doc-1"), false), InviteDisposition::Duplicate);
    }

    #[test]
    fn test_invite_during_call_is_busy() {
        let mut surface = IncomingCallSurface::new();
        assert_eq!(surface.offer(invite("A1", "doc-1"), true), InviteDisposition::Busy);
        assert!(surface.current().is_none());
    }

    #[test]
    fn test_take_and_clear_are_idempotent() {
        let mut surface = IncomingCallSurface::new();
        surface.offer(invite("A1", "doc-1"), false);

        assert!(surface.clear_if("A9").is_none());
        assert!(surface.take().is_some());
        assert!(surface.take().is_none());
        assert!(surface.clear_if("A1").is_none());
    }
}
