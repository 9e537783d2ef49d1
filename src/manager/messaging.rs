//! Outbound text and media messages on connected sessions.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::info;

use super::SessionManager;
use crate::error::GatewayError;
use crate::media::{self, MediaPayload, MediaSource};
use crate::session::{ConnectionHandle, HandleKey};
use crate::transport::{
    Jid, MediaKind, OutgoingMessage, TransportClient, TransportError, USER_SERVER,
};
use crate::Result;

/// Messaging tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MessagingConfig {
    /// Prefixed to recipients that do not start with it.
    pub default_country_code: String,
    #[serde(with = "secs")]
    pub send_timeout: Duration,
    /// Covers upload plus send.
    #[serde(with = "secs")]
    pub media_timeout: Duration,
    #[serde(with = "secs")]
    pub download_timeout: Duration,
    pub max_download_bytes: usize,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            default_country_code: "55".to_string(),
            send_timeout: Duration::from_secs(30),
            media_timeout: Duration::from_secs(300),
            download_timeout: Duration::from_secs(120),
            max_download_bytes: 25 * 1024 * 1024,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// A media message request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMessage {
    pub recipient: String,
    pub source: MediaSource,
    pub mime_type: Option<String>,
    pub caption: Option<String>,
}

/// Receipt of a delivered message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentMessage {
    pub message_id: String,
    pub recipient: String,
}

/// Turn a phone number (or full address) into a user address.
///
/// Spaces, dashes and parentheses are removed; numbers without the default
/// country code get it prefixed.
pub fn normalize_recipient(input: &str, default_country_code: &str) -> Result<Jid> {
    let cleaned: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')'))
        .collect();
    if cleaned.is_empty() {
        return Err(GatewayError::InvalidRecipient("empty recipient".into()));
    }

    if cleaned.contains('@') {
        return cleaned
            .parse()
            .map_err(|e| GatewayError::InvalidRecipient(format!("{}", e)));
    }

    let number = cleaned.strip_prefix('+').unwrap_or(&cleaned);
    if !number.chars().all(|c| c.is_ascii_digit()) {
        return Err(GatewayError::InvalidRecipient(format!(
            "'{}' is not a phone number",
            input
        )));
    }
    let number = if number.starts_with(default_country_code) {
        number.to_string()
    } else {
        format!("{}{}", default_country_code, number)
    };
    format!("{}@{}", number, USER_SERVER)
        .parse()
        .map_err(|e| GatewayError::InvalidRecipient(format!("{}", e)))
}

impl SessionManager {
    /// Handle of a paired, connected session.
    fn ready_handle(&self, tenant_id: &str, session_key: &str) -> Result<Arc<ConnectionHandle>> {
        let handle = self
            .registry
            .get(&HandleKey::new(tenant_id, session_key))?
            .ok_or_else(|| GatewayError::NotConnected(format!("no live connection for '{}'", session_key)))?;
        if handle.identity().is_none() {
            return Err(GatewayError::NotConnected(format!(
                "session '{}' is not authenticated",
                session_key
            )));
        }
        if !handle.client().is_connected() {
            return Err(GatewayError::NotConnected(format!(
                "session '{}' is not connected",
                session_key
            )));
        }
        Ok(handle)
    }

    pub async fn send_text(
        &self,
        tenant_id: &str,
        session_key: &str,
        recipient: &str,
        text: &str,
    ) -> Result<SentMessage> {
        let handle = self.ready_handle(tenant_id, session_key)?;
        let to = normalize_recipient(recipient, &self.messaging.default_country_code)?;

        let message = OutgoingMessage::Text {
            body: text.to_string(),
        };
        let message_id = timeout(
            self.messaging.send_timeout,
            handle.client().send_message(&to, message),
        )
        .await
        .map_err(|_| GatewayError::transport("failed to send message", TransportError::Timeout))?
        .map_err(|e| GatewayError::transport("failed to send message", e))?;

        info!(key = %handle.key(), %to, %message_id, "text message sent");
        Ok(SentMessage {
            message_id,
            recipient: to.to_string(),
        })
    }

    pub async fn send_media(
        &self,
        tenant_id: &str,
        session_key: &str,
        request: MediaMessage,
    ) -> Result<SentMessage> {
        let handle = self.ready_handle(tenant_id, session_key)?;
        let to = normalize_recipient(&request.recipient, &self.messaging.default_country_code)?;

        let payload = match &request.source {
            MediaSource::Base64(data) => media::decode_base64(data, request.mime_type.as_deref())?,
            MediaSource::Url(url) => self.fetcher.fetch(url, request.mime_type.as_deref()).await?,
        };

        let message_id = timeout(
            self.messaging.media_timeout,
            upload_and_send(handle.client().as_ref(), &to, payload, request.caption),
        )
        .await
        .map_err(|_| GatewayError::transport("failed to send media", TransportError::Timeout))??;

        info!(key = %handle.key(), %to, %message_id, "media message sent");
        Ok(SentMessage {
            message_id,
            recipient: to.to_string(),
        })
    }
}

async fn upload_and_send(
    client: &dyn TransportClient,
    to: &Jid,
    payload: MediaPayload,
    caption: Option<String>,
) -> Result<String> {
    let kind = MediaKind::from_content_type(&payload.content_type);
    let uploaded = client
        .upload(payload.data, kind)
        .await
        .map_err(|e| GatewayError::transport("failed to upload media", e))?;

    // Audio carries no caption or file name; documents need the file name.
    let (caption, file_name) = match kind {
        MediaKind::Audio => (None, None),
        MediaKind::Document => (caption, Some(payload.file_name)),
        MediaKind::Image | MediaKind::Video => (caption, None),
    };
    let message = OutgoingMessage::Media {
        kind,
        media: uploaded,
        mime_type: payload.content_type,
        caption,
        file_name,
    };
    client
        .send_message(to, message)
        .await
        .map_err(|e| GatewayError::transport("failed to send media", e))
}
