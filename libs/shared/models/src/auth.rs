use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Which side of the consultation a participant is on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ParticipantRole {
    #[serde(rename = "doctor")]
    Doctor,
    #[serde(rename = "patient")]
    Patient,
}

impl ParticipantRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipantRole::Doctor => "doctor",
            ParticipantRole::Patient => "patient",
        }
    }
}

/// The locally signed-in participant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CallIdentity {
    pub user_id: String,
    pub display_name: String,
    pub role: ParticipantRole,
}

impl CallIdentity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>, role: ParticipantRole) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
            role,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.user_id.trim().is_empty()
    }
}

/// Credentials handed to the media provider and the signaling service.
#[derive(Clone, Serialize, Deserialize)]
pub struct MediaCredentials {
    pub api_key: String,
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl MediaCredentials {
    pub fn new(api_key: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            token: token.into(),
            expires_at: None,
        }
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn is_complete(&self) -> bool {
        !self.api_key.is_empty() && !self.token.is_empty()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|exp| exp <= Utc::now()).unwrap_or(false)
    }
}

// Tokens never end up in logs.
impl std::fmt::Debug for MediaCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaCredentials")
            .field("api_key", &self.api_key)
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_credentials_expiry() {
        let fresh = MediaCredentials::new("key", "token").with_expiry(Utc::now() + Duration::hours(1));
        assert!(fresh.is_complete());
        assert!(!fresh.is_expired());

        let stale = MediaCredentials::new("key", "token").with_expiry(Utc::now() - Duration::seconds(1));
        assert!(stale.is_expired());

        assert!(!MediaCredentials::new("", "token").is_complete());
    }

    #[test]
    fn test_credentials_debug_redacts_token() {
        let creds = MediaCredentials::new("key", "super-secret");
        let printed = format!("{:?}", creds);
        assert!(!printed.contains("super-secret"));
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_string(&ParticipantRole::Doctor).unwrap(), "\"doctor\"");
        let role: ParticipantRole = serde_json::from_str("\"patient\"").unwrap();
        assert_eq!(role, ParticipantRole::Patient);
    }
}
