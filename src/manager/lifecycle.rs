//! Register, pairing-code query, disconnect, delete, list and shutdown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::SessionManager;
use crate::error::GatewayError;
use crate::pairing::PairingOutcome;
use crate::session::{ConnectionHandle, HandleKey, Session, SessionProfile, SessionStatus};
use crate::store::StoreError;
use crate::transport::TransportClient;
use crate::Result;

/// Result of a registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Registration {
    pub id: Uuid,
    pub session_key: String,
    pub status: SessionStatus,
    /// Base64 PNG to scan, absent when the session connected right away.
    pub qr_code_base64: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Answer to a pairing-code query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingCode {
    /// A code valid until `expires_at`.
    Code {
        code: String,
        expires_at: DateTime<Utc>,
    },
    /// The session is paired and needs no code.
    AlreadyConnected,
}

/// What a disconnect did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// A live handle was torn down and the session marked disconnected.
    Disconnected,
    /// There was no live handle. Nothing changed.
    NotConnected,
}

impl SessionManager {
    /// Register (or re-register) a session and wait for a pairing code.
    ///
    /// Any live handle for the key is torn down first. An existing record is
    /// reset in place; otherwise a pending record is created.
    pub async fn register(
        &self,
        tenant_id: &str,
        session_key: &str,
        profile: SessionProfile,
    ) -> Result<Registration> {
        let key = HandleKey::new(tenant_id, session_key);

        if let Some(other) = self.repo.find_by_email(tenant_id, &profile.email).await? {
            if other.session_key != session_key {
                return Err(GatewayError::Conflict(format!(
                    "email '{}' is already used by another session",
                    profile.email
                )));
            }
        }

        if let Some(previous) = self.registry.remove(&key)? {
            info!(%key, "tearing down previous connection for re-registration");
            previous.teardown().await;
        }

        let session = self.upsert_session(tenant_id, session_key, &profile).await?;
        let handle = self.open_pairing(&key, &session).await?;

        match self.pairing.wait(&handle).await? {
            PairingOutcome::Connected(device) => {
                handle.cancel_pairing()?;
                let device_id = device.to_string();
                if let Err(e) = self
                    .repo
                    .update_status(
                        session.id,
                        SessionStatus::Connected,
                        Some(device.account()),
                        Some(&device_id),
                    )
                    .await
                {
                    warn!(%key, error = %e, "failed to record connected status");
                }
                info!(%key, device = %device_id, "session connected during registration");
                Ok(Registration {
                    id: session.id,
                    session_key: session.session_key,
                    status: SessionStatus::Connected,
                    qr_code_base64: None,
                    expires_at: None,
                })
            }
            PairingOutcome::Code(code) => {
                info!(%key, expires_at = %code.expires_at, "pairing code ready");
                Ok(Registration {
                    id: session.id,
                    session_key: session.session_key,
                    status: SessionStatus::Pending,
                    qr_code_base64: Some(code.code),
                    expires_at: Some(code.expires_at),
                })
            }
        }
    }

    async fn upsert_session(
        &self,
        tenant_id: &str,
        session_key: &str,
        profile: &SessionProfile,
    ) -> Result<Session> {
        match self.repo.get_by_key_and_tenant(session_key, tenant_id).await {
            Ok(mut existing) => {
                self.repo.reset_for_reregister(existing.id, profile).await?;
                existing.reset(profile);
                debug!(tenant_id, session_key, "session reset for re-registration");
                Ok(existing)
            }
            Err(StoreError::NotFound(_)) => {
                let session = Session::new(tenant_id, session_key, profile);
                self.repo.create(&session).await?;
                Ok(session)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Allocate a fresh device, start its pairing flow, register the handle
    /// and connect.
    async fn open_pairing(
        &self,
        key: &HandleKey,
        session: &Session,
    ) -> Result<Arc<ConnectionHandle>> {
        let client = self
            .devices
            .new_device()
            .await
            .map_err(|e| GatewayError::transport("failed to allocate device", e))?;
        let handle = Arc::new(ConnectionHandle::new(session.id, key.clone(), client));

        self.attach_events(&handle)?;
        if let Err(e) = self.pairing.start(&handle).await {
            handle.teardown().await;
            return Err(e);
        }
        self.install(Arc::clone(&handle)).await?;

        if let Err(e) = handle.client().connect().await {
            self.registry.remove_if_same(key, &handle)?;
            handle.teardown().await;
            return Err(GatewayError::transport("failed to connect", e));
        }
        Ok(handle)
    }

    /// Current pairing code of a session.
    ///
    /// A code is never returned past its expiry: an expired cached code is
    /// refreshed once, and [`GatewayError::Expired`] is returned if that
    /// fails.
    pub async fn pairing_code(&self, tenant_id: &str, session_key: &str) -> Result<PairingCode> {
        let session = self.repo.get_by_key_and_tenant(session_key, tenant_id).await?;
        let key = HandleKey::new(tenant_id, session_key);
        let now = Utc::now();

        let Some(handle) = self.registry.get(&key)? else {
            if let (Some(code), Some(expires_at)) = (&session.pairing_code, session.pairing_expires_at) {
                return if now < expires_at {
                    Ok(PairingCode::Code {
                        code: code.clone(),
                        expires_at,
                    })
                } else {
                    Err(GatewayError::Expired)
                };
            }
            if session.status == SessionStatus::Connected {
                return Ok(PairingCode::AlreadyConnected);
            }
            return Err(GatewayError::NotGenerated);
        };

        if handle.identity().is_some() {
            return Ok(PairingCode::AlreadyConnected);
        }

        let cached = handle.code()?.ok_or(GatewayError::NotGenerated)?;
        if !cached.is_expired(now) {
            return Ok(PairingCode::Code {
                code: cached.code,
                expires_at: cached.expires_at,
            });
        }

        match self.pairing.refresh(&handle).await {
            Ok(PairingOutcome::Code(code)) => Ok(PairingCode::Code {
                code: code.code,
                expires_at: code.expires_at,
            }),
            Ok(PairingOutcome::Connected(_)) => Ok(PairingCode::AlreadyConnected),
            Err(e) => {
                warn!(%key, error = %e, "pairing code refresh failed");
                Err(GatewayError::Expired)
            }
        }
    }

    /// Tear down a session's live connection and mark it disconnected.
    pub async fn disconnect(&self, tenant_id: &str, session_key: &str) -> Result<DisconnectOutcome> {
        let session = self.repo.get_by_key_and_tenant(session_key, tenant_id).await?;
        let key = HandleKey::new(tenant_id, session_key);

        let Some(handle) = self.registry.remove(&key)? else {
            debug!(%key, "disconnect requested without a live connection");
            return Ok(DisconnectOutcome::NotConnected);
        };

        handle.teardown().await;
        self.repo
            .update_status(session.id, SessionStatus::Disconnected, None, None)
            .await?;
        info!(%key, "session disconnected");
        Ok(DisconnectOutcome::Disconnected)
    }

    /// Disconnect (best effort) and delete a session.
    pub async fn delete(&self, tenant_id: &str, session_key: &str) -> Result<()> {
        if let Err(e) = self.disconnect(tenant_id, session_key).await {
            debug!(tenant_id, session_key, error = %e, "disconnect before delete failed");
        }

        let session = self.repo.get_by_key_and_tenant(session_key, tenant_id).await?;
        self.repo.delete(session.id).await?;
        info!(tenant_id, session_key, "session deleted");
        Ok(())
    }

    /// Sessions of a tenant, newest first.
    pub async fn list(&self, tenant_id: &str) -> Result<Vec<Session>> {
        Ok(self.repo.list_by_tenant(tenant_id).await?)
    }

    /// One session of a tenant.
    pub async fn session(&self, tenant_id: &str, session_key: &str) -> Result<Session> {
        Ok(self.repo.get_by_key_and_tenant(session_key, tenant_id).await?)
    }

    /// Tear down every live connection. Only the first call does anything.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let handles = match self.registry.drain() {
            Ok(handles) => handles,
            Err(e) => {
                warn!(error = %e, "failed to drain session registry");
                return;
            }
        };

        let count = handles.len();
        let mut tasks = JoinSet::new();
        for (_, handle) in handles {
            tasks.spawn(async move { handle.teardown().await });
        }
        while tasks.join_next().await.is_some() {}
        info!(count, "all sessions disconnected");
    }
}
