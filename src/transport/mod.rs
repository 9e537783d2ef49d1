//! Transport collaborator interface.
//!
//! The wire protocol and its cryptography live behind these traits. A
//! [`DeviceProvider`] owns the provisioned device credentials and hands out
//! [`TransportClient`]s bound to them; the gateway only orchestrates those
//! clients.
//!
//! Events flow as messages: pairing progress arrives on the stream returned
//! by [`TransportClient::open_pairing_stream`], connection notifications on
//! the bounded sink installed with [`TransportClient::set_event_sink`].

mod jid;
pub mod loopback;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use jid::{Jid, ParseJidError, USER_SERVER};

/// Errors reported by the transport collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("pairing unavailable: {0}")]
    Pairing(String),

    #[error("upload failed: {0}")]
    Upload(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("device store error: {0}")]
    Device(String),

    #[error("operation timed out")]
    Timeout,

    #[error("client closed")]
    Closed,
}

/// One item of a pairing-event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A fresh one-time pairing payload. `timeout` is how long the network
    /// keeps it valid, when it says so.
    Code {
        code: String,
        timeout: Option<Duration>,
    },
    /// The owner scanned a code and the device is now linked.
    Success,
    /// The network stopped issuing codes.
    Timeout,
    /// Pairing failed.
    Error(String),
}

/// Pairing events for one flow. Closed by the collaborator when the flow ends.
pub type PairingStream = mpsc::Receiver<PairingEvent>;

/// Connection notifications delivered for a live client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    LoggedOut,
}

/// Media categories understood by the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    /// Pick a category from a MIME content type.
    pub fn from_content_type(content_type: &str) -> Self {
        if content_type.starts_with("image/") {
            MediaKind::Image
        } else if content_type.starts_with("video/") {
            MediaKind::Video
        } else if content_type.starts_with("audio/") {
            MediaKind::Audio
        } else {
            MediaKind::Document
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Document => "document",
        }
    }
}

/// Reference to uploaded, encrypted media.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UploadedMedia {
    pub url: String,
    pub direct_path: String,
    pub media_key: Vec<u8>,
    pub file_sha256: Vec<u8>,
    pub file_enc_sha256: Vec<u8>,
    pub file_length: u64,
}

/// Message handed to the transport for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutgoingMessage {
    Text {
        body: String,
    },
    Media {
        kind: MediaKind,
        media: UploadedMedia,
        mime_type: String,
        caption: Option<String>,
        file_name: Option<String>,
    },
}

/// A single connection to the messaging network, bound to one device
/// credential.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Open the connection.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Close the connection. Never fails.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    /// Stable device identity, present once pairing completed.
    fn device(&self) -> Option<Jid>;

    /// Open a pairing-event stream. Must be called before [`connect`] on an
    /// unpaired client. Cancelling `cancel` ends the flow.
    ///
    /// [`connect`]: TransportClient::connect
    async fn open_pairing_stream(
        &self,
        cancel: CancellationToken,
    ) -> Result<PairingStream, TransportError>;

    async fn upload(&self, data: Vec<u8>, kind: MediaKind)
        -> Result<UploadedMedia, TransportError>;

    /// Deliver a message, returning the network message id.
    async fn send_message(
        &self,
        recipient: &Jid,
        message: OutgoingMessage,
    ) -> Result<String, TransportError>;

    /// Install the queue that receives connection notifications. Replaces any
    /// previous sink.
    fn set_event_sink(&self, sink: mpsc::Sender<ConnectionEvent>);
}

/// Container of provisioned device credentials.
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Allocate a fresh, unpaired device credential and a client bound to it.
    async fn new_device(&self) -> Result<Arc<dyn TransportClient>, TransportError>;

    /// All device credentials that completed pairing.
    async fn all_devices(&self) -> Result<Vec<Jid>, TransportError>;

    /// Look up one credential by its exact address.
    async fn get_device(&self, jid: &Jid) -> Result<Option<Jid>, TransportError>;

    /// Build a client for a stored credential.
    async fn client_for(&self, device: &Jid) -> Result<Arc<dyn TransportClient>, TransportError>;

    /// Forget a credential, e.g. after the account logged the device out.
    async fn delete_device(&self, device: &Jid) -> Result<(), TransportError>;
}
