// libs/call-session-cell/src/services/reporter.rs
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{info, instrument};

use shared_config::AppConfig;
use shared_database::supabase::{SupabaseClient, SupabaseError};
use shared_utils::{retry_with_backoff, RetryPolicy};

use crate::models::CallReport;

pub const CALL_LOG_TABLE: &str = "call_logs";

/// Receives the final outcome of every call attempt.
#[async_trait]
pub trait CallReporter: Send + Sync {
    async fn report(&self, report: &CallReport) -> Result<()>;
}

/// Writes call outcomes to the clinic backend's `call_logs` table.
pub struct SupabaseCallReporter {
    supabase: SupabaseClient,
    policy: RetryPolicy,
    auth_token: Option<String>,
}

impl SupabaseCallReporter {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            supabase: SupabaseClient::new(config),
            policy: RetryPolicy::default(),
            auth_token: None,
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn row(report: &CallReport) -> Value {
        json!({
            "appointment_id": report.appointment_id,
            "session_id": report.session_id,
            "role": report.role,
            "outcome": report.outcome.as_str(),
            "error_kind": report.outcome.error().map(|e| e.kind()),
            "peer_id": report.peer_id,
            "started_at": report.started_at,
            "ended_at": report.ended_at,
            "duration_seconds": report.duration_seconds,
        })
    }
}

#[async_trait]
impl CallReporter for SupabaseCallReporter {
    #[instrument(skip(self, report), fields(appointment_id = %report.appointment_id, outcome = %report.outcome))]
    async fn report(&self, report: &CallReport) -> Result<()> {
        let row = Self::row(report);
        let row = &row;
        let supabase = &self.supabase;
        let auth_token = self.auth_token.as_deref();

        retry_with_backoff(
            &self.policy,
            "call log insert",
            |e: &anyhow::Error| !e.downcast_ref::<SupabaseError>().is_some_and(SupabaseError::is_auth),
            move || supabase.insert(CALL_LOG_TABLE, row.clone(), auth_token),
        )
        .await?;

        info!("Call outcome recorded");
        Ok(())
    }
}

/// Used when no backend is configured: the outcome only reaches the logs.
pub struct TracingCallReporter;

#[async_trait]
impl CallReporter for TracingCallReporter {
    async fn report(&self, report: &CallReport) -> Result<()> {
        info!(
            appointment_id = %report.appointment_id,
            session_id = %report.session_id,
            outcome = %report.outcome,
            duration_seconds = ?report.duration_seconds,
            "Call finished"
        );
        Ok(())
    }
}

pub fn reporter_from_config(config: &AppConfig) -> Arc<dyn CallReporter> {
    if config.is_call_logging_configured() {
        Arc::new(SupabaseCallReporter::new(config))
    } else {
        Arc::new(TracingCallReporter)
    }
}
