//! API request and response types.

use axum::{http::StatusCode, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GatewayError;
use crate::manager::{MediaMessage, PairingCode};
use crate::media::MediaSource;
use crate::session::{Session, SessionProfile, SessionStatus};

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Request to register (or re-register) a session.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub session_key: String,
    pub name: String,
    pub email: String,
}

impl RegisterRequest {
    /// Reject blank fields before touching the manager.
    pub fn validate(&self) -> Result<SessionProfile, ApiError> {
        for (field, value) in [
            ("session_key", &self.session_key),
            ("name", &self.name),
            ("email", &self.email),
        ] {
            if value.trim().is_empty() {
                return Err(bad_request(format!("'{}' must not be empty", field)));
            }
        }
        if !self.email.contains('@') {
            return Err(bad_request(format!("'{}' is not an email address", self.email)));
        }
        Ok(SessionProfile::new(self.name.trim(), self.email.trim()))
    }
}

/// Public view of a persisted session. The cached pairing code is left out.
#[derive(Debug, Clone, Serialize)]
pub struct SessionResponse {
    pub id: Uuid,
    pub session_key: String,
    pub name: String,
    pub email: String,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// Whether a live connection handle exists right now.
    pub live: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
}

impl SessionResponse {
    pub fn from_session(session: Session, live: bool) -> Self {
        Self {
            id: session.id,
            account_id: session.account_id().map(str::to_string),
            session_key: session.session_key,
            name: session.owner_name,
            email: session.owner_email,
            status: session.status,
            live,
            created_at: session.created_at,
            updated_at: session.updated_at,
            last_connected_at: session.last_connected_at,
        }
    }
}

/// List sessions response.
#[derive(Debug, Clone, Serialize)]
pub struct ListSessionsResponse {
    pub count: usize,
    pub sessions: Vec<SessionResponse>,
}

/// Pairing code query response.
#[derive(Debug, Clone, Serialize)]
pub struct QrResponse {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qr_code_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl From<PairingCode> for QrResponse {
    fn from(code: PairingCode) -> Self {
        match code {
            PairingCode::Code { code, expires_at } => Self {
                status: SessionStatus::Pending,
                qr_code_base64: Some(code),
                expires_at: Some(expires_at),
            },
            PairingCode::AlreadyConnected => Self {
                status: SessionStatus::Connected,
                qr_code_base64: None,
                expires_at: None,
            },
        }
    }
}

/// Disconnect response.
#[derive(Debug, Clone, Serialize)]
pub struct DisconnectResponse {
    /// False when there was no live connection to close.
    pub disconnected: bool,
}

/// Request to send a text message.
#[derive(Debug, Clone, Deserialize)]
pub struct SendTextRequest {
    #[serde(alias = "recipient")]
    pub number: String,
    pub text: String,
}

/// Request to send a media message. Exactly one of `media_url` and
/// `media_base64` must be set.
#[derive(Debug, Clone, Deserialize)]
pub struct SendMediaRequest {
    #[serde(alias = "recipient")]
    pub number: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_url: Option<String>,
    #[serde(default)]
    pub media_base64: Option<String>,
    #[serde(default)]
    pub mime_type: Option<String>,
}

impl SendMediaRequest {
    pub fn into_message(self) -> Result<MediaMessage, ApiError> {
        let non_empty = |v: Option<String>| v.filter(|s| !s.trim().is_empty());
        let source = match (non_empty(self.media_url), non_empty(self.media_base64)) {
            (Some(url), None) => MediaSource::Url(url),
            (None, Some(data)) => MediaSource::Base64(data),
            (Some(_), Some(_)) => {
                return Err(bad_request("set only one of 'media_url' and 'media_base64'"))
            }
            (None, None) => return Err(bad_request("'media_url' or 'media_base64' is required")),
        };
        Ok(MediaMessage {
            recipient: self.number,
            source,
            mime_type: non_empty(self.mime_type),
            caption: non_empty(self.caption),
        })
    }
}

/// Generic API error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    /// Error code (e.g., "SESSION_NOT_FOUND").
    pub code: String,
    /// Human-readable error message.
    pub message: String,
    /// Additional details (optional).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new("BAD_REQUEST", message)
    }
}

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::bad_request(message)))
}

/// Map a gateway error onto a status code and JSON body.
pub fn api_error(err: GatewayError) -> ApiError {
    let (status, code) = match &err {
        GatewayError::NotFound(_) => (StatusCode::NOT_FOUND, "SESSION_NOT_FOUND"),
        GatewayError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
        GatewayError::PairingTimeout => (StatusCode::GATEWAY_TIMEOUT, "PAIRING_TIMEOUT"),
        GatewayError::Expired => (StatusCode::GONE, "QR_EXPIRED"),
        GatewayError::NotGenerated => (StatusCode::NOT_FOUND, "QR_NOT_GENERATED"),
        GatewayError::NotConnected(_) => (StatusCode::CONFLICT, "NOT_CONNECTED"),
        GatewayError::InvalidRecipient(_) => (StatusCode::BAD_REQUEST, "INVALID_RECIPIENT"),
        GatewayError::InvalidMedia(_) => (StatusCode::BAD_REQUEST, "INVALID_MEDIA"),
        GatewayError::MediaDownload(_) => (StatusCode::BAD_GATEWAY, "MEDIA_DOWNLOAD_FAILED"),
        GatewayError::Transport { .. } => (StatusCode::BAD_GATEWAY, "TRANSPORT_ERROR"),
        GatewayError::Persistence(_)
        | GatewayError::Qr(_)
        | GatewayError::LockPoisoned
        | GatewayError::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
    };

    if status.is_server_error() {
        tracing::error!(error = %err, "request failed");
    }

    let mut body = ErrorResponse::new(code, err.to_string());
    if let Some(source) = std::error::Error::source(&err) {
        body = body.with_details(source.to_string());
    }
    (status, Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::TransportError;

    #[test]
    fn test_register_request_validation() {
        let req: RegisterRequest = serde_json::from_str(
            r#"{"session_key": "alice", "name": " Alice ", "email": "alice@example.com"}"#,
        )
        .unwrap();
        let profile = req.validate().unwrap();
        assert_eq!(profile.name, "Alice");

        let req = RegisterRequest {
            session_key: " ".into(),
            name: "A".into(),
            email: "a@example.com".into(),
        };
        assert_eq!(req.validate().unwrap_err().0, StatusCode::BAD_REQUEST);

        let req = RegisterRequest {
            session_key: "a".into(),
            name: "A".into(),
            email: "not-an-email".into(),
        };
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_media_request_needs_exactly_one_source() {
        let req: SendMediaRequest =
            serde_json::from_str(r#"{"number": "11999", "media_url": "https://x/y.png"}"#).unwrap();
        let message = req.into_message().unwrap();
        assert_eq!(message.source, MediaSource::Url("https://x/y.png".into()));

        let req: SendMediaRequest = serde_json::from_str(r#"{"number": "11999"}"#).unwrap();
        assert!(req.into_message().is_err());

        let req: SendMediaRequest = serde_json::from_str(
            r#"{"number": "11999", "media_url": "https://x", "media_base64": "aGk="}"#,
        )
        .unwrap();
        assert!(req.into_message().is_err());
    }

    #[test]
    fn test_text_request_accepts_recipient_alias() {
        let req: SendTextRequest =
            serde_json::from_str(r#"{"recipient": "11999", "text": "hi"}"#).unwrap();
        assert_eq!(req.number, "11999");
    }

    #[test]
    fn test_error_mapping() {
        let (status, body) = api_error(GatewayError::NotFound("bob".into()));
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.code, "SESSION_NOT_FOUND");

        let (status, _) = api_error(GatewayError::Expired);
        assert_eq!(status, StatusCode::GONE);

        let (status, body) = api_error(GatewayError::transport(
            "failed to send message",
            TransportError::Send("socket closed".into()),
        ));
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(body.details.as_deref(), Some("send failed: socket closed"));
    }

    #[test]
    fn test_error_response_serialization() {
        let err = ErrorResponse::new("TEST_ERROR", "Test message");
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("TEST_ERROR"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn test_qr_response_from_code() {
        let response = QrResponse::from(PairingCode::AlreadyConnected);
        assert_eq!(response.status, SessionStatus::Connected);
        assert!(response.qr_code_base64.is_none());
    }
}
