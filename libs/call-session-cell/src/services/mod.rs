// libs/call-session-cell/src/services/mod.rs

pub mod client;
pub mod incoming;
pub mod media;
pub mod orchestrator;
pub mod presence;
pub mod reporter;
pub mod signaling;
pub mod timers;
pub mod websocket;

pub use client::TelehealthCallClient;
pub use incoming::{IncomingCallSurface, InviteDisposition};
pub use media::{MediaEvent, MediaHandle, MediaRuntime, MediaSessionClient, MediaState};
pub use orchestrator::CallSessionOrchestrator;
pub use presence::{GateStatus, PresenceGate};
pub use reporter::{
    reporter_from_config, CallReporter, SupabaseCallReporter, TracingCallReporter, CALL_LOG_TABLE,
};
pub use signaling::{ConnectionState, SignalingChannel, SignalingTransport, TransportLink};
pub use timers::{CallTimers, TimerKind};
pub use websocket::WebSocketTransport;
