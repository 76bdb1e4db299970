// libs/call-session-cell/src/router.rs
use std::sync::Arc;

use axum::{
    routing::{delete, get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use crate::handlers::*;
use crate::services::CallSessionOrchestrator;

/// Control surface for UI binding. Mounted by the host under `/calls`.
pub fn call_session_routes(orchestrator: Arc<CallSessionOrchestrator>) -> Router {
    Router::new()
        .route("/health", get(call_health_check))
        // Read model
        .route("/state", get(get_call_state))
        .route("/events", get(stream_call_events))
        .route("/error", delete(clear_call_error))
        // Outbound calls
        .route("/{appointment_id}/start", post(start_call))
        .route("/cancel", post(cancel_call))
        .route("/retry", post(retry_call))
        // Incoming calls
        .route("/incoming/accept", post(accept_incoming_call))
        .route("/incoming/decline", post(decline_incoming_call))
        // Active calls
        .route("/active/leave", post(leave_active_call))
        .route("/active/end", post(end_active_call))
        .layer(TraceLayer::new_for_http())
        .with_state(orchestrator)
}
