use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;

use shared_config::{AppConfig, CallTimeouts, SignalingSettings};
use shared_models::auth::{CallIdentity, MediaCredentials, ParticipantRole};

pub struct TestConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub signaling_url: String,
    pub timeouts: CallTimeouts,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            supabase_url: "http://localhost:54321".to_string(),
            supabase_anon_key: "test-anon-key".to_string(),
            signaling_url: "ws://localhost:5000/signaling".to_string(),
            timeouts: CallTimeouts::default(),
        }
    }
}

impl TestConfig {
    pub fn with_supabase_url(mut self, url: impl Into<String>) -> Self {
        self.supabase_url = url.into();
        self
    }

    pub fn to_app_config(&self) -> AppConfig {
        AppConfig {
            supabase_url: self.supabase_url.clone(),
            supabase_anon_key: self.supabase_anon_key.clone(),
            signaling: SignalingSettings {
                url: self.signaling_url.clone(),
                send_grace: Duration::from_millis(3000),
                connect_timeout: Duration::from_secs(10),
                reconnect_attempts: 5,
                reconnect_delay: Duration::from_millis(1000),
                reconnect_delay_max: Duration::from_millis(5000),
            },
            timeouts: self.timeouts.clone(),
        }
    }

    pub fn to_arc(&self) -> Arc<AppConfig> {
        Arc::new(self.to_app_config())
    }
}

pub struct TestIdentity;

impl TestIdentity {
    pub fn doctor(name: &str) -> CallIdentity {
        CallIdentity::new(format!("doctor-{}", name.to_lowercase()), format!("Dr. {}", name), ParticipantRole::Doctor)
    }

    pub fn patient(name: &str) -> CallIdentity {
        CallIdentity::new(format!("patient-{}", name.to_lowercase()), name, ParticipantRole::Patient)
    }

    pub fn credentials() -> MediaCredentials {
        MediaCredentials::new("test-api-key", "test-media-token")
            .with_expiry(Utc::now() + chrono::Duration::hours(24))
    }

    pub fn expired_credentials() -> MediaCredentials {
        MediaCredentials::new("test-api-key", "test-media-token")
            .with_expiry(Utc::now() - chrono::Duration::minutes(5))
    }
}

/// Installs a fmt subscriber that writes through the test harness. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_creation() {
        let config = TestConfig::default().to_app_config();

        assert_eq!(config.supabase_url, "http://localhost:54321");
        assert_eq!(config.supabase_anon_key, "test-anon-key");
        assert!(config.is_call_logging_configured());
        assert_eq!(config.timeouts.ring, Duration::from_secs(60));
    }

    #[test]
    fn test_identity_helpers() {
        let doctor = TestIdentity::doctor("House");
        assert_eq!(doctor.role, ParticipantRole::Doctor);
        assert_eq!(doctor.display_name, "Dr. House");
        assert!(doctor.is_valid());

        assert!(TestIdentity::credentials().is_complete());
        assert!(TestIdentity::expired_credentials().is_expired());
    }
}
