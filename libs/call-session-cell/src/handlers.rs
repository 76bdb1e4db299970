// libs/call-session-cell/src/handlers.rs
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream};
use serde_json::{json, Value};
use tracing::debug;

use shared_models::error::AppError;

use crate::models::CallSnapshot;
use crate::services::CallSessionOrchestrator;

type OrchestratorState = State<Arc<CallSessionOrchestrator>>;

// ==============================================================================
// READ MODEL
// ==============================================================================

pub async fn call_health_check(State(orchestrator): OrchestratorState) -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "call-session-cell",
        "phase": orchestrator.snapshot().phase,
        "signaling": orchestrator.signaling().state(),
        "media": orchestrator.gate().status(),
    }))
}

pub async fn get_call_state(State(orchestrator): OrchestratorState) -> Json<CallSnapshot> {
    Json(orchestrator.snapshot())
}

/// Server-sent events: the current snapshot first, then one event per change.
pub async fn stream_call_events(
    State(orchestrator): OrchestratorState,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let receiver = orchestrator.subscribe();

    let events = stream::unfold((receiver, true), |(mut receiver, first)| async move {
        if !first && receiver.changed().await.is_err() {
            debug!("Call event stream closed");
            return None;
        }
        let snapshot = receiver.borrow_and_update().clone();
        let event = Event::default()
            .event("call_state")
            .json_data(&snapshot)
            .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
        Some((Ok(event), (receiver, false)))
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}

// ==============================================================================
// CALL CONTROL
// ==============================================================================

pub async fn start_call(
    State(orchestrator): OrchestratorState,
    Path(appointment_id): Path<String>,
) -> Result<Json<CallSnapshot>, AppError> {
    if appointment_id.trim().is_empty() {
        return Err(AppError::BadRequest("appointment_id is required".to_string()));
    }
    orchestrator.start_call(&appointment_id).await?;
    Ok(Json(orchestrator.snapshot()))
}

pub async fn cancel_call(State(orchestrator): OrchestratorState) -> Result<Json<CallSnapshot>, AppError> {
    orchestrator.cancel_call().await?;
    Ok(Json(orchestrator.snapshot()))
}

pub async fn retry_call(State(orchestrator): OrchestratorState) -> Result<Json<CallSnapshot>, AppError> {
    orchestrator.retry_call().await?;
    Ok(Json(orchestrator.snapshot()))
}

pub async fn accept_incoming_call(
    State(orchestrator): OrchestratorState,
) -> Result<Json<CallSnapshot>, AppError> {
    orchestrator.accept_incoming().await?;
    Ok(Json(orchestrator.snapshot()))
}

pub async fn decline_incoming_call(State(orchestrator): OrchestratorState) -> Json<CallSnapshot> {
    orchestrator.decline_incoming().await;
    Json(orchestrator.snapshot())
}

pub async fn leave_active_call(
    State(orchestrator): OrchestratorState,
) -> Result<Json<CallSnapshot>, AppError> {
    orchestrator.leave_active().await?;
    Ok(Json(orchestrator.snapshot()))
}

pub async fn end_active_call(State(orchestrator): OrchestratorState) -> Result<Json<CallSnapshot>, AppError> {
    orchestrator.end_active().await?;
    Ok(Json(orchestrator.snapshot()))
}

pub async fn clear_call_error(State(orchestrator): OrchestratorState) -> Json<CallSnapshot> {
    orchestrator.clear_error().await;
    Json(orchestrator.snapshot())
}
