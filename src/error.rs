//! Error types for pairgate.

use thiserror::Error;

use crate::store::StoreError;
use crate::transport::TransportError;

/// Main error type for gateway operations.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Session is absent or not owned by the caller's tenant.
    #[error("session not found: {0}")]
    NotFound(String),

    /// Duplicate session key or email within a tenant.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Neither a device identity nor a pairing code showed up in time.
    #[error("timed out waiting for pairing code")]
    PairingTimeout,

    /// Cached pairing code is past its expiry and could not be refreshed.
    #[error("pairing code expired, register again")]
    Expired,

    /// No pairing code has been produced for the session yet.
    #[error("pairing code not yet generated")]
    NotGenerated,

    /// Session has no authenticated, connected transport client.
    #[error("session not connected: {0}")]
    NotConnected(String),

    /// Recipient could not be turned into an address.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Media payload could not be prepared.
    #[error("invalid media: {0}")]
    InvalidMedia(String),

    /// Remote media could not be fetched.
    #[error("media download failed: {0}")]
    MediaDownload(String),

    /// Transport collaborator failed. The cause is always kept.
    #[error("{context}: {source}")]
    Transport {
        context: String,
        #[source]
        source: TransportError,
    },

    /// Session store failed.
    #[error("persistence error: {0}")]
    Persistence(#[source] StoreError),

    /// Pairing code could not be rendered.
    #[error("QR render error: {0}")]
    Qr(String),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GatewayError {
    /// Wrap a transport failure with a short description of what was attempted.
    pub fn transport(context: impl Into<String>, source: TransportError) -> Self {
        Self::Transport {
            context: context.into(),
            source,
        }
    }
}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(what) => Self::NotFound(what),
            StoreError::Conflict(what) => Self::Conflict(what),
            other => Self::Persistence(other),
        }
    }
}

/// Convenience Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
