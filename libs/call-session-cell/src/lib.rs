// libs/call-session-cell/src/lib.rs
//! # Call Session Cell
//!
//! Call lifecycle for scheduled telehealth appointments: a doctor and a
//! patient reach each other through a rendezvous (signaling) service, and a
//! real-time media session is set up, kept alive through transient network
//! loss, and torn down exactly once however the call ends.
//!
//! ## Architecture
//!
//! ```text
//! +----------------------------------------------------------+
//! |                    Call Session Cell                     |
//! +----------------------------------------------------------+
//! |  handlers.rs      |  HTTP/SSE control surface            |
//! |  router.rs        |  Route definitions                   |
//! |  models.rs        |  Session, phases, signals, reports   |
//! |  error.rs         |  CallError / MediaError taxonomy     |
//! |  services/        |                                      |
//! |    orchestrator.rs|  Call state machine + teardown       |
//! |    presence.rs    |  Media readiness gate                |
//! |    signaling.rs   |  Reconnecting control channel        |
//! |    websocket.rs   |  WebSocket signaling transport       |
//! |    incoming.rs    |  Pending invite policy               |
//! |    timers.rs      |  Ring / connection / reconnect timers|
//! |    media.rs       |  Media engine capability traits      |
//! |    reporter.rs    |  Call-log reporting                  |
//! |    client.rs      |  Sign-in / sign-out facade           |
//! +----------------------------------------------------------+
//! ```
//!
//! ## Call phases
//!
//! `idle -> gate_wait -> initiating -> ringing -> connecting -> active -> ended`,
//! with `reconnecting` as a sub-state of `active` and `error` reachable from
//! every non-terminal phase. The responder goes from `gate_wait` straight to
//! `connecting`.
//!
//! ## API Endpoints
//!
//! - `GET /calls/state` - Current call snapshot
//! - `GET /calls/events` - Snapshot stream (SSE)
//! - `POST /calls/{appointment_id}/start` - Call the other party
//! - `POST /calls/cancel` - Cancel before the call is active
//! - `POST /calls/retry` - Retry the last failed call
//! - `POST /calls/incoming/accept` - Answer the pending invite
//! - `POST /calls/incoming/decline` - Decline the pending invite
//! - `POST /calls/active/leave` - Leave, the other party stays
//! - `POST /calls/active/end` - End the call for both
//! - `DELETE /calls/error` - Dismiss the last error
//! - `GET /calls/health` - Health check
//!
//! ## Usage Example
//!
//! ```rust,ignore
//! use call_session_cell::router::call_session_routes;
//! use call_session_cell::services::TelehealthCallClient;
//! use shared_config::AppConfig;
//!
//! let config = AppConfig::from_env();
//! let client = TelehealthCallClient::from_config(&config, media_runtime);
//! client.sign_in(identity, credentials).await?;
//!
//! let app = Router::new().nest("/calls", call_session_routes(client.orchestrator()));
//! ```

pub mod error;
pub mod handlers;
pub mod models;
pub mod router;
pub mod services;

pub use error::{CallError, CallErrorView, MediaError};
pub use models::{
    CallOutcome, CallPhase, CallReport, CallRole, CallSession, CallSnapshot, PendingInvite,
    SignalEnvelope, SignalMessage,
};
pub use router::call_session_routes;
pub use services::{CallSessionOrchestrator, PresenceGate, SignalingChannel, TelehealthCallClient};
