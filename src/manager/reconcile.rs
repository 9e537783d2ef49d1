//! Startup reconciliation of persisted sessions with stored device
//! credentials.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::SessionManager;
use crate::error::GatewayError;
use crate::session::{ConnectionHandle, HandleKey, Session, SessionStatus};
use crate::transport::{DeviceProvider, Jid, TransportClient};
use crate::Result;

/// Counts from one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub total: usize,
    /// Sessions whose device id was filled in from stored credentials.
    pub backfilled: usize,
    /// Sessions with a handle registered and a connect under way.
    pub reconnected: usize,
    /// Previously paired sessions without credentials, put back to pending.
    pub pending: usize,
    pub failed: usize,
}

enum Resumed {
    Connecting,
    NoCredentials,
}

impl SessionManager {
    /// Re-establish connections for sessions that completed pairing before
    /// the last shutdown.
    ///
    /// Per-session failures are logged and mark that session disconnected;
    /// only failing to load the session inventory is an error.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let sessions = self.repo.list().await?;
        let devices = match self.devices.all_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "failed to list stored devices");
                Vec::new()
            }
        };
        info!(sessions = sessions.len(), devices = devices.len(), "reconciling sessions");

        let by_account: HashMap<&str, &Jid> = devices.iter().map(|d| (d.account(), d)).collect();
        let mut report = ReconcileReport::default();

        for mut session in sessions {
            report.total += 1;

            if session.device_id().is_none() {
                if let Some(device) = session.account_id().and_then(|a| by_account.get(a)) {
                    let device_id = device.to_string();
                    match self.repo.update_device_id(session.id, &device_id).await {
                        Ok(()) => {
                            debug!(session_key = %session.session_key, %device_id, "device id backfilled");
                            session.device_id = Some(device_id);
                            report.backfilled += 1;
                        }
                        Err(e) => warn!(session_key = %session.session_key, error = %e, "failed to backfill device id"),
                    }
                }
            }

            if !session.status.was_paired() || session.account_id().is_none() {
                continue;
            }

            match self.resume(&session, &devices).await {
                Ok(Resumed::Connecting) => report.reconnected += 1,
                Ok(Resumed::NoCredentials) => report.pending += 1,
                Err(e) => {
                    error!(
                        tenant_id = %session.tenant_id,
                        session_key = %session.session_key,
                        error = %e,
                        "failed to reconnect session"
                    );
                    report.failed += 1;
                    if let Err(e) = self
                        .repo
                        .update_status(session.id, SessionStatus::Disconnected, None, None)
                        .await
                    {
                        warn!(session_key = %session.session_key, error = %e, "failed to mark session disconnected");
                    }
                }
            }
        }

        info!(
            total = report.total,
            backfilled = report.backfilled,
            reconnected = report.reconnected,
            pending = report.pending,
            failed = report.failed,
            "reconciliation finished"
        );
        Ok(report)
    }

    async fn resume(&self, session: &Session, devices: &[Jid]) -> Result<Resumed> {
        let Some(device) = self.resolve_device(session, devices).await else {
            info!(session_key = %session.session_key, "no stored credentials, session back to pending");
            self.repo
                .update_status(session.id, SessionStatus::Pending, None, None)
                .await?;
            return Ok(Resumed::NoCredentials);
        };

        let client = self
            .devices
            .client_for(&device)
            .await
            .map_err(|e| GatewayError::transport("failed to load device", e))?;
        let key = HandleKey::new(&session.tenant_id, &session.session_key);
        let handle = Arc::new(ConnectionHandle::new(session.id, key, client));
        self.attach_events(&handle)?;
        self.install(Arc::clone(&handle)).await?;

        let repo = Arc::clone(&self.repo);
        tokio::spawn(async move {
            let lifetime = handle.lifetime();
            let result = tokio::select! {
                _ = lifetime.cancelled() => return,
                result = handle.client().connect() => result,
            };
            if let Err(e) = result {
                warn!(key = %handle.key(), error = %e, "reconnect failed");
                if let Err(e) = repo
                    .update_status(handle.session_id(), SessionStatus::Disconnected, None, None)
                    .await
                {
                    warn!(key = %handle.key(), error = %e, "failed to mark session disconnected");
                }
            }
        });

        debug!(session_key = %session.session_key, %device, "reconnect started");
        Ok(Resumed::Connecting)
    }

    /// Find stored credentials for a session: by recorded device id, then by
    /// the account address, then by scanning every device of the account.
    async fn resolve_device(&self, session: &Session, devices: &[Jid]) -> Option<Jid> {
        let account = session.account_id()?;

        if let Some(raw) = session.device_id() {
            match raw.parse::<Jid>() {
                Ok(jid) => match self.devices.get_device(&jid).await {
                    Ok(Some(device)) => return Some(device),
                    Ok(None) => {}
                    Err(e) => warn!(device = %jid, error = %e, "device lookup failed"),
                },
                Err(e) => warn!(session_key = %session.session_key, error = %e, "stored device id is malformed"),
            }
        }

        let user = Jid::user(account);
        match self.devices.get_device(&user).await {
            Ok(Some(device)) => return Some(device),
            Ok(None) => {}
            Err(e) => warn!(device = %user, error = %e, "device lookup failed"),
        }

        devices.iter().find(|d| d.account() == account).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::manager::ManagerConfig;
    use crate::session::SessionProfile;
    use crate::store::{MemorySessionRepository, SessionRepository};
    use crate::transport::loopback::LoopbackProvider;
    use crate::transport::TransportError;

    async fn paired(
        repo: &MemorySessionRepository,
        key: &str,
        account: &str,
        device_id: Option<&str>,
        status: SessionStatus,
    ) -> Session {
        let mut session = Session::new("t1", key, &SessionProfile::new(key, format!("{key}@example.com")));
        session.account_id = Some(account.to_string());
        session.device_id = device_id.map(str::to_string);
        session.status = status;
        repo.create(&session).await.unwrap();
        session
    }

    fn manager(
        repo: &Arc<MemorySessionRepository>,
        devices: Arc<dyn DeviceProvider>,
    ) -> SessionManager {
        SessionManager::new(repo.clone(), devices, ManagerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_reconnects_paired_sessions() {
        let provider = LoopbackProvider::new();
        let jid = provider.provision("5511999");
        let repo = Arc::new(MemorySessionRepository::new());
        let session = paired(&repo, "alice", "5511999", Some(&jid.to_string()), SessionStatus::Connected).await;
        let manager = manager(&repo, Arc::new(provider.clone()));

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.total, 1);
        assert_eq!(report.reconnected, 1);
        assert!(manager.handle("t1", "alice").unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(provider.last_client().unwrap().is_connected());
        let stored = repo.get_by_id(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Connected);
    }

    #[tokio::test]
    async fn test_backfills_device_id_and_scans_by_account() {
        let provider = LoopbackProvider::new();
        let jid = provider.provision("5511888");
        let repo = Arc::new(MemorySessionRepository::new());
        let session = paired(&repo, "bob", "5511888", None, SessionStatus::Disconnected).await;
        let manager = manager(&repo, Arc::new(provider.clone()));

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.backfilled, 1);
        assert_eq!(report.reconnected, 1);
        let stored = repo.get_by_id(session.id).await.unwrap();
        assert_eq!(stored.device_id, Some(jid.to_string()));
    }

    #[tokio::test]
    async fn test_missing_credentials_mark_pending() {
        let provider = LoopbackProvider::new();
        let repo = Arc::new(MemorySessionRepository::new());
        let session = paired(&repo, "carol", "5511777", Some("5511777:3@s.whatsapp.net"), SessionStatus::Connected).await;
        let manager = manager(&repo, Arc::new(provider));

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.pending, 1);
        assert!(manager.registry().is_empty().unwrap());
        let stored = repo.get_by_id(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Pending);
    }

    #[tokio::test]
    async fn test_skips_unpaired_sessions() {
        let provider = LoopbackProvider::new();
        provider.provision("5511666");
        let repo = Arc::new(MemorySessionRepository::new());
        paired(&repo, "dave", "5511666", None, SessionStatus::Pending).await;
        let manager = manager(&repo, Arc::new(provider));

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.reconnected, 0);
        assert!(manager.registry().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_async_connect_failure_marks_disconnected() {
        let provider = LoopbackProvider::new();
        let jid = provider.provision("5511555");
        provider.configure(|c| c.fail_connect = true);
        let repo = Arc::new(MemorySessionRepository::new());
        let session = paired(&repo, "erin", "5511555", Some(&jid.to_string()), SessionStatus::Connected).await;
        let manager = manager(&repo, Arc::new(provider));

        manager.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stored = repo.get_by_id(session.id).await.unwrap();
        assert_eq!(stored.status, SessionStatus::Disconnected);
    }

    /// Provider whose credentials exist but cannot be loaded.
    struct BrokenLoader(LoopbackProvider);

    #[async_trait]
    impl DeviceProvider for BrokenLoader {
        async fn new_device(&self) -> std::result::Result<Arc<dyn TransportClient>, TransportError> {
            self.0.new_device().await
        }
        async fn all_devices(&self) -> std::result::Result<Vec<Jid>, TransportError> {
            self.0.all_devices().await
        }
        async fn get_device(&self, jid: &Jid) -> std::result::Result<Option<Jid>, TransportError> {
            self.0.get_device(jid).await
        }
        async fn client_for(&self, _: &Jid) -> std::result::Result<Arc<dyn TransportClient>, TransportError> {
            Err(TransportError::Device("corrupt credential".into()))
        }
        async fn delete_device(&self, jid: &Jid) -> std::result::Result<(), TransportError> {
            self.0.delete_device(jid).await
        }
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_pass() {
        let provider = LoopbackProvider::new();
        let a = provider.provision("5511001");
        let b = provider.provision("5511002");
        let repo = Arc::new(MemorySessionRepository::new());
        let first = paired(&repo, "frank", "5511001", Some(&a.to_string()), SessionStatus::Connected).await;
        let second = paired(&repo, "gina", "5511002", Some(&b.to_string()), SessionStatus::Connected).await;
        let manager = manager(&repo, Arc::new(BrokenLoader(provider)));

        let report = manager.reconcile().await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.failed, 2);
        for id in [first.id, second.id] {
            assert_eq!(
                repo.get_by_id(id).await.unwrap().status,
                SessionStatus::Disconnected
            );
        }
    }
}
