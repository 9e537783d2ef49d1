//! Session manager: the lifecycle entry points over the registry, the
//! pairing controller, the session store and the device provider.
//!
//! One [`SessionManager`] is shared by every inbound request. It keeps at
//! most one live [`ConnectionHandle`] per (tenant, session key) and mirrors
//! transport events into the store.

mod events;
mod lifecycle;
mod messaging;
mod reconcile;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use crate::media::MediaFetcher;
use crate::pairing::{PairingConfig, PairingController};
use crate::session::{ConnectionHandle, HandleKey, SessionRegistry};
use crate::store::SessionRepository;
use crate::transport::DeviceProvider;
use crate::Result;

pub use lifecycle::{DisconnectOutcome, PairingCode, Registration};
pub use messaging::{normalize_recipient, MediaMessage, MessagingConfig, SentMessage};
pub use reconcile::ReconcileReport;

/// Tunables of the manager.
#[derive(Debug, Clone, Default)]
pub struct ManagerConfig {
    pub pairing: PairingConfig,
    pub messaging: MessagingConfig,
}

/// Coordinates session lifecycles.
pub struct SessionManager {
    repo: Arc<dyn SessionRepository>,
    devices: Arc<dyn DeviceProvider>,
    registry: SessionRegistry,
    pairing: PairingController,
    messaging: MessagingConfig,
    fetcher: MediaFetcher,
    shut_down: AtomicBool,
}

impl SessionManager {
    pub fn new(
        repo: Arc<dyn SessionRepository>,
        devices: Arc<dyn DeviceProvider>,
        config: ManagerConfig,
    ) -> Result<Self> {
        let fetcher = MediaFetcher::new(
            config.messaging.max_download_bytes,
            config.messaging.download_timeout,
        )?;
        Ok(Self {
            pairing: PairingController::new(Arc::clone(&repo), config.pairing),
            repo,
            devices,
            registry: SessionRegistry::new(),
            messaging: config.messaging,
            fetcher,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn repository(&self) -> &Arc<dyn SessionRepository> {
        &self.repo
    }

    /// Live handle for a session, if any.
    pub fn handle(&self, tenant_id: &str, session_key: &str) -> Result<Option<Arc<ConnectionHandle>>> {
        self.registry.get(&HandleKey::new(tenant_id, session_key))
    }

    /// Install `handle`, tearing down whatever it displaced.
    async fn install(&self, handle: Arc<ConnectionHandle>) -> Result<()> {
        let key = handle.key().clone();
        if let Some(previous) = self.registry.set(key, handle)? {
            previous.teardown().await;
        }
        Ok(())
    }
}
