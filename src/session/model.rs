//! Persisted session record.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection status of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Waiting for the owner to scan a pairing code.
    #[default]
    Pending,
    /// Paired and connected to the network.
    Connected,
    /// Paired before, currently not connected.
    Disconnected,
    /// Unrecoverable failure.
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Pending => "pending",
            SessionStatus::Connected => "connected",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }

    /// Whether the session completed pairing at some point and can be
    /// resumed from stored credentials.
    pub fn was_paired(&self) -> bool {
        matches!(self, SessionStatus::Connected | SessionStatus::Disconnected)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SessionStatus::Pending),
            "connected" => Ok(SessionStatus::Connected),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "error" => Ok(SessionStatus::Error),
            other => Err(format!("unknown session status: {}", other)),
        }
    }
}

/// Owner details supplied on registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionProfile {
    pub name: String,
    pub email: String,
}

impl SessionProfile {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }
}

/// A persisted messaging session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    pub session_key: String,
    pub owner_name: String,
    pub owner_email: String,
    /// Phone-equivalent account identifier, known once paired.
    pub account_id: Option<String>,
    /// Device credential identifier (device JID), known once paired.
    pub device_id: Option<String>,
    pub status: SessionStatus,
    pub pairing_code: Option<String>,
    pub pairing_expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Create a new pending session.
    pub fn new(
        tenant_id: impl Into<String>,
        session_key: impl Into<String>,
        profile: &SessionProfile,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            session_key: session_key.into(),
            owner_name: profile.name.clone(),
            owner_email: profile.email.clone(),
            account_id: None,
            device_id: None,
            status: SessionStatus::Pending,
            pairing_code: None,
            pairing_expires_at: None,
            created_at: now,
            updated_at: now,
            last_connected_at: None,
        }
    }

    /// Clear pairing linkage and take the new owner details, keeping the
    /// record identity and creation time.
    pub fn reset(&mut self, profile: &SessionProfile) {
        self.owner_name = profile.name.clone();
        self.owner_email = profile.email.clone();
        self.status = SessionStatus::Pending;
        self.account_id = None;
        self.device_id = None;
        self.pairing_code = None;
        self.pairing_expires_at = None;
        self.last_connected_at = None;
        self.updated_at = Utc::now();
    }

    /// Persisted pairing code, if one is cached and still valid at `now`.
    pub fn valid_pairing_code(&self, now: DateTime<Utc>) -> Option<(&str, DateTime<Utc>)> {
        match (&self.pairing_code, self.pairing_expires_at) {
            (Some(code), Some(exp)) if now < exp => Some((code.as_str(), exp)),
            _ => None,
        }
    }

    pub fn account_id(&self) -> Option<&str> {
        self.account_id.as_deref().filter(|a| !a.is_empty())
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref().filter(|d| !d.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn profile() -> SessionProfile {
        SessionProfile::new("Alice", "alice@example.com")
    }

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            SessionStatus::Pending,
            SessionStatus::Connected,
            SessionStatus::Disconnected,
            SessionStatus::Error,
        ] {
            assert_eq!(status.as_str().parse::<SessionStatus>().unwrap(), status);
        }
        assert!("paired".parse::<SessionStatus>().is_err());
    }

    #[test]
    fn test_status_serde_lowercase() {
        let json = serde_json::to_string(&SessionStatus::Disconnected).unwrap();
        assert_eq!(json, "\"disconnected\"");
    }

    #[test]
    fn test_was_paired() {
        assert!(SessionStatus::Connected.was_paired());
        assert!(SessionStatus::Disconnected.was_paired());
        assert!(!SessionStatus::Pending.was_paired());
        assert!(!SessionStatus::Error.was_paired());
    }

    #[test]
    fn test_new_session_is_pending() {
        let session = Session::new("tenantA", "alice", &profile());
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.owner_email, "alice@example.com");
        assert!(session.account_id.is_none());
        assert_eq!(session.created_at, session.updated_at);
    }

    #[test]
    fn test_reset_keeps_identity() {
        let mut session = Session::new("tenantA", "alice", &profile());
        let id = session.id;
        let created = session.created_at;
        session.status = SessionStatus::Connected;
        session.account_id = Some("5511999999999".into());
        session.device_id = Some("5511999999999:3@s.whatsapp.net".into());
        session.pairing_code = Some("code".into());
        session.last_connected_at = Some(Utc::now());

        session.reset(&SessionProfile::new("Alice B", "alice.b@example.com"));

        assert_eq!(session.id, id);
        assert_eq!(session.created_at, created);
        assert_eq!(session.status, SessionStatus::Pending);
        assert_eq!(session.owner_name, "Alice B");
        assert!(session.account_id.is_none());
        assert!(session.device_id.is_none());
        assert!(session.pairing_code.is_none());
        assert!(session.last_connected_at.is_none());
    }

    #[test]
    fn test_valid_pairing_code() {
        let mut session = Session::new("tenantA", "alice", &profile());
        let now = Utc::now();
        assert!(session.valid_pairing_code(now).is_none());

        session.pairing_code = Some("abc".into());
        session.pairing_expires_at = Some(now + Duration::seconds(30));
        assert_eq!(session.valid_pairing_code(now).map(|(c, _)| c), Some("abc"));

        session.pairing_expires_at = Some(now - Duration::seconds(1));
        assert!(session.valid_pairing_code(now).is_none());
    }

    #[test]
    fn test_empty_identifiers_are_absent() {
        let mut session = Session::new("tenantA", "alice", &profile());
        session.account_id = Some(String::new());
        assert!(session.account_id().is_none());
    }
}
