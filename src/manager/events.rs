//! Mirrors transport connection events into the session store.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::SessionManager;
use crate::session::{ConnectionHandle, PairingState, SessionStatus};
use crate::store::SessionRepository;
use crate::transport::{ConnectionEvent, DeviceProvider, TransportClient};
use crate::Result;

/// Capacity of each handle's event queue.
pub const EVENT_BUFFER: usize = 32;

impl SessionManager {
    /// Install an event sink on the handle's client and spawn the task that
    /// drains it. The task stops when the handle is torn down.
    pub(super) fn attach_events(&self, handle: &Arc<ConnectionHandle>) -> Result<()> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        handle.client().set_event_sink(tx);

        let consumer = EventConsumer {
            handle: Arc::clone(handle),
            repo: Arc::clone(&self.repo),
            devices: Arc::clone(&self.devices),
        };
        let task = tokio::spawn(consumer.run(rx, handle.lifetime()));
        handle.set_consumer(task)
    }
}

struct EventConsumer {
    handle: Arc<ConnectionHandle>,
    repo: Arc<dyn SessionRepository>,
    devices: Arc<dyn DeviceProvider>,
}

impl EventConsumer {
    async fn run(self, mut events: mpsc::Receiver<ConnectionEvent>, lifetime: CancellationToken) {
        loop {
            let event = tokio::select! {
                biased;
                _ = lifetime.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.apply(event).await;
        }
        debug!(key = %self.handle.key(), "event consumer stopped");
    }

    async fn apply(&self, event: ConnectionEvent) {
        let key = self.handle.key();
        let id = self.handle.session_id();

        match event {
            ConnectionEvent::Connected => {
                let device = self.handle.identity();
                let account = device.as_ref().map(|d| d.account().to_string());
                let device_id = device.as_ref().map(|d| d.to_string());
                info!(%key, device = ?device_id, "session connected");

                if let Err(e) = self
                    .repo
                    .update_status(
                        id,
                        SessionStatus::Connected,
                        account.as_deref(),
                        device_id.as_deref(),
                    )
                    .await
                {
                    warn!(%key, error = %e, "failed to record connected status");
                }
                if device.is_some() {
                    if let Err(e) = self.handle.transition(PairingState::Connected) {
                        warn!(%key, error = %e, "failed to record pairing state");
                    }
                }
                self.handle.notify();
            }
            ConnectionEvent::Disconnected => {
                info!(%key, "session disconnected");
                if let Err(e) = self
                    .repo
                    .update_status(id, SessionStatus::Disconnected, None, None)
                    .await
                {
                    warn!(%key, error = %e, "failed to record disconnected status");
                }
            }
            ConnectionEvent::LoggedOut => {
                info!(%key, "session logged out by the account owner");
                if let Some(device) = self.handle.identity() {
                    if let Err(e) = self.devices.delete_device(&device).await {
                        warn!(%key, error = %e, "failed to delete device credential");
                    }
                }
                if let Err(e) = self.repo.mark_logged_out(id).await {
                    warn!(%key, error = %e, "failed to record logout");
                }
            }
        }
    }
}
