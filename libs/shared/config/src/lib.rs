use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Upper bounds for every phase of a call attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallTimeouts {
    /// Bounds PresenceGate initialization.
    pub readiness: Duration,
    /// Invite sent/received until accepted.
    pub ring: Duration,
    /// Join requested until joined.
    pub connection: Duration,
    /// Transient media loss until the call is given up as lost.
    pub reconnect: Duration,
}

impl Default for CallTimeouts {
    fn default() -> Self {
        Self {
            readiness: Duration::from_secs(15),
            ring: Duration::from_secs(60),
            connection: Duration::from_secs(30),
            reconnect: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingSettings {
    pub url: String,
    /// How long `send` waits for a connection before giving up.
    pub send_grace: Duration,
    pub connect_timeout: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub reconnect_delay_max: Duration,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        Self {
            url: "ws://localhost:5000/signaling".to_string(),
            send_grace: Duration::from_millis(3000),
            connect_timeout: Duration::from_secs(10),
            reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(1000),
            reconnect_delay_max: Duration::from_millis(5000),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    pub signaling: SignalingSettings,
    pub timeouts: CallTimeouts,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            supabase_url: String::new(),
            supabase_anon_key: String::new(),
            signaling: SignalingSettings::default(),
            timeouts: CallTimeouts::default(),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = CallTimeouts::default();
        let signaling_defaults = SignalingSettings::default();

        let config = Self {
            supabase_url: env::var("SUPABASE_URL")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_URL not set, call logging will stay local");
                    String::new()
                }),
            supabase_anon_key: env::var("SUPABASE_ANON_PUBLIC_KEY")
                .unwrap_or_else(|_| {
                    warn!("SUPABASE_ANON_PUBLIC_KEY not set, using empty value");
                    String::new()
                }),
            signaling: SignalingSettings {
                url: env::var("SIGNALING_URL")
                    .unwrap_or_else(|_| {
                        warn!("SIGNALING_URL not set, using default");
                        signaling_defaults.url.clone()
                    }),
                send_grace: Duration::from_millis(env_number(
                    "SIGNALING_SEND_GRACE_MS",
                    signaling_defaults.send_grace.as_millis() as u64,
                )),
                connect_timeout: Duration::from_secs(env_number(
                    "SIGNALING_CONNECT_TIMEOUT_SECS",
                    signaling_defaults.connect_timeout.as_secs(),
                )),
                reconnect_attempts: env_number(
                    "SIGNALING_RECONNECT_ATTEMPTS",
                    signaling_defaults.reconnect_attempts,
                ),
                reconnect_delay: Duration::from_millis(env_number(
                    "SIGNALING_RECONNECT_DELAY_MS",
                    signaling_defaults.reconnect_delay.as_millis() as u64,
                )),
                reconnect_delay_max: Duration::from_millis(env_number(
                    "SIGNALING_RECONNECT_DELAY_MAX_MS",
                    signaling_defaults.reconnect_delay_max.as_millis() as u64,
                )),
            },
            timeouts: CallTimeouts {
                readiness: Duration::from_secs(env_number(
                    "CALL_READINESS_TIMEOUT_SECS",
                    defaults.readiness.as_secs(),
                )),
                ring: Duration::from_secs(env_number("CALL_RING_TIMEOUT_SECS", defaults.ring.as_secs())),
                connection: Duration::from_secs(env_number(
                    "CALL_CONNECTION_TIMEOUT_SECS",
                    defaults.connection.as_secs(),
                )),
                reconnect: Duration::from_secs(env_number(
                    "CALL_RECONNECT_TIMEOUT_SECS",
                    defaults.reconnect.as_secs(),
                )),
            },
        };

        if !config.is_call_logging_configured() {
            warn!("Call logging not configured - outcomes will only be traced");
        }

        config
    }

    pub fn is_call_logging_configured(&self) -> bool {
        !self.supabase_url.is_empty() && !self.supabase_anon_key.is_empty()
    }

    pub fn is_signaling_configured(&self) -> bool {
        self.signaling.url.starts_with("ws://") || self.signaling.url.starts_with("wss://")
    }
}

/// Reads a numeric variable, keeping the default when it is missing or malformed.
fn env_number<T>(name: &str, default: T) -> T
where
    T: FromStr + Copy + std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{} has invalid value '{}', using default {}", name, raw, default);
            default
        }),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = CallTimeouts::default();
        assert_eq!(timeouts.readiness, Duration::from_secs(15));
        assert_eq!(timeouts.ring, Duration::from_secs(60));
        assert_eq!(timeouts.connection, Duration::from_secs(30));
        assert_eq!(timeouts.reconnect, Duration::from_secs(30));
    }

    #[test]
    fn test_env_number_falls_back_on_garbage() {
        env::set_var("SHARED_CONFIG_TEST_GARBAGE", "soon");
        assert_eq!(env_number("SHARED_CONFIG_TEST_GARBAGE", 42u64), 42);
        env::set_var("SHARED_CONFIG_TEST_NUMBER", " 7 ");
        assert_eq!(env_number("SHARED_CONFIG_TEST_NUMBER", 42u64), 7);
        assert_eq!(env_number("SHARED_CONFIG_TEST_MISSING", 5u32), 5);
    }

    #[test]
    fn test_logging_configuration_flags() {
        let mut config = AppConfig::default();
        assert!(!config.is_call_logging_configured());
        assert!(config.is_signaling_configured());

        config.supabase_url = "http://localhost:54321".to_string();
        config.supabase_anon_key = "anon".to_string();
        assert!(config.is_call_logging_configured());

        config.signaling.url = "http://not-a-socket".to_string();
        assert!(!config.is_signaling_configured());
    }
}
