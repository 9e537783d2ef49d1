//! In-memory session store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{non_empty, SessionRepository, StoreError};
use crate::session::{Session, SessionProfile, SessionStatus};

/// Thread-safe, process-local storage for session records.
#[derive(Default)]
pub struct MemorySessionRepository {
    sessions: RwLock<HashMap<Uuid, Session>>,
}

impl MemorySessionRepository {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of records in the store.
    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    fn update<F>(&self, id: Uuid, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Session),
    {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        let session = sessions
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        f(session);
        session.updated_at = Utc::now();
        Ok(())
    }

    fn sorted(mut sessions: Vec<Session>) -> Vec<Session> {
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        sessions
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn create(&self, session: &Session) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        for existing in sessions.values() {
            if existing.tenant_id != session.tenant_id {
                continue;
            }
            if existing.session_key == session.session_key {
                return Err(StoreError::Conflict(format!(
                    "a session with key '{}' already exists",
                    session.session_key
                )));
            }
            if existing.owner_email == session.owner_email {
                return Err(StoreError::Conflict(format!(
                    "a session with email '{}' already exists",
                    session.owner_email
                )));
            }
        }

        sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Session, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        sessions
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn get_by_key_and_tenant(
        &self,
        session_key: &str,
        tenant_id: &str,
    ) -> Result<Session, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        sessions
            .values()
            .find(|s| s.session_key == session_key && s.tenant_id == tenant_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(session_key.to_string()))
    }

    async fn find_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<Session>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(sessions
            .values()
            .find(|s| s.tenant_id == tenant_id && s.owner_email == email)
            .cloned())
    }

    async fn reset_for_reregister(
        &self,
        id: Uuid,
        profile: &SessionProfile,
    ) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;

        let tenant_id = sessions
            .get(&id)
            .map(|s| s.tenant_id.clone())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;

        let taken = sessions
            .values()
            .any(|s| s.id != id && s.tenant_id == tenant_id && s.owner_email == profile.email);
        if taken {
            return Err(StoreError::Conflict(format!(
                "a session with email '{}' already exists",
                profile.email
            )));
        }

        if let Some(session) = sessions.get_mut(&id) {
            session.reset(profile);
        }
        Ok(())
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: SessionStatus,
        account_id: Option<&str>,
        device_id: Option<&str>,
    ) -> Result<(), StoreError> {
        self.update(id, |s| {
            s.status = status;
            if let Some(account) = non_empty(account_id) {
                s.account_id = Some(account.to_string());
            }
            if let Some(device) = non_empty(device_id) {
                s.device_id = Some(device.to_string());
            }
            if status == SessionStatus::Connected {
                s.last_connected_at = Some(Utc::now());
            }
        })
    }

    async fn update_device_id(&self, id: Uuid, device_id: &str) -> Result<(), StoreError> {
        if device_id.is_empty() {
            return Ok(());
        }
        self.update(id, |s| s.device_id = Some(device_id.to_string()))
    }

    async fn update_pairing_code(
        &self,
        id: Uuid,
        code: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.update(id, |s| {
            s.pairing_code = Some(code.to_string());
            s.pairing_expires_at = Some(expires_at);
        })
    }

    async fn mark_logged_out(&self, id: Uuid) -> Result<(), StoreError> {
        self.update(id, |s| {
            s.status = SessionStatus::Pending;
            s.account_id = None;
            s.device_id = None;
        })
    }

    async fn list(&self) -> Result<Vec<Session>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(Self::sorted(sessions.values().cloned().collect()))
    }

    async fn list_by_tenant(&self, tenant_id: &str) -> Result<Vec<Session>, StoreError> {
        let sessions = self
            .sessions
            .read()
            .map_err(|_| StoreError::LockPoisoned)?;
        Ok(Self::sorted(
            sessions
                .values()
                .filter(|s| s.tenant_id == tenant_id)
                .cloned()
                .collect(),
        ))
    }

    async fn delete(&self, id: Uuid) -> Result<(), StoreError> {
        let mut sessions = self
            .sessions
            .write()
            .map_err(|_| StoreError::LockPoisoned)?;
        sessions
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }
}
