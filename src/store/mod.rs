//! Session record persistence.
//!
//! [`SessionRepository`] is the seam to the durable store. Two
//! implementations ship with the crate: [`MemorySessionRepository`] for tests
//! and ephemeral runs, and [`SqliteSessionRepository`] backed by sqlx.

mod memory;
mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::session::{Session, SessionProfile, SessionStatus};

pub use memory::MemorySessionRepository;
pub use sqlite::SqliteSessionRepository;

/// Errors reported by a session store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No record matched.
    #[error("session not found: {0}")]
    NotFound(String),

    /// A uniqueness constraint on (tenant, key) or (tenant, email) was hit.
    #[error("{0}")]
    Conflict(String),

    /// Backend failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored row could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(String),

    /// Internal lock was poisoned.
    #[error("internal lock poisoned")]
    LockPoisoned,
}

/// Durable storage of [`Session`] records.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Insert a new record. Fails with [`StoreError::Conflict`] on a duplicate
    /// (tenant, key) or (tenant, email).
    async fn create(&self, session: &Session) -> Result<(), StoreError>;

    async fn get_by_id(&self, id: Uuid) -> Result<Session, StoreError>;

    async fn get_by_key_and_tenant(
        &self,
        session_key: &str,
        tenant_id: &str,
    ) -> Result<Session, StoreError>;

    async fn find_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<Session>, StoreError>;

    /// Reset a record in place for a new registration: owner details
    /// replaced, status pending, pairing linkage and cached code cleared.
    async fn reset_for_reregister(
        &self,
        id: Uuid,
        profile: &SessionProfile,
    ) -> Result<(), StoreError>;

    /// Partial status update. `None` (or empty) identifiers keep the stored
    /// values; a connected status stamps the last-connected time.
    async fn update_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        account_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn update_device_id(&self, id: Uuid, device_id: &str) -> Result<(), StoreError>;

    async fn update_pairing_code(
        &self,
        id: Uuid,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Clear account and device identifiers and put the session back to
    /// pending.
    async fn mark_logged_out(&self, id: Uuid) -> Result<(), StoreError>;

    /// All records, newest first.
    async fn list(&self) -> Result<Vec<Session>, StoreError>;

    /// Records of one tenant, newest first.
    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Session>, StoreError>;

    async fn delete(&self, id: Uuid) -> Result<(), StoreError>;
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
