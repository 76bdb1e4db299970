// libs/call-session-cell/src/services/timers.rs
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    Ring,
    Connection,
    Reconnect,
    /// Lifetime of an unanswered incoming invite.
    InviteExpiry,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::Ring => "ring",
            TimerKind::Connection => "connection",
            TimerKind::Reconnect => "reconnect",
            TimerKind::InviteExpiry => "invite_expiry",
        }
    }
}

/// At most one timer per kind. Starting a kind aborts the previous instance,
/// and every firing carries its generation so a callback that raced with a
/// restart can tell it is stale.
#[derive(Default)]
pub struct CallTimers {
    generation: u64,
    slots: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl CallTimers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start<F, Fut>(&mut self, kind: TimerKind, after: Duration, on_fire: F) -> u64
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(kind);
        self.generation += 1;
        let generation = self.generation;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            on_fire(generation).await;
        });
        self.slots.insert(kind, (generation, handle));
        debug!("Started {} timer ({:?})", kind.as_str(), after);
        generation
    }

    /// Claims a firing. Returns false when the timer was cancelled or
    /// restarted after this generation was scheduled. The slot is released
    /// without aborting, since the caller is the timer task itself.
    pub fn take_fired(&mut self, kind: TimerKind, generation: u64) -> bool {
        match self.slots.get(&kind) {
            Some((current, _)) if *current == generation => {
                self.slots.remove(&kind);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) {
        if let Some((_, handle)) = self.slots.remove(&kind) {
            handle.abort();
            debug!("Cancelled {} timer", kind.as_str());
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.slots.drain() {
            handle.abort();
        }
    }
}

impl Drop for CallTimers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
