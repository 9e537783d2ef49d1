//! Connection handle: one live transport client and its pairing state.

use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{HandleKey, PairingState};
use crate::error::GatewayError;
use crate::transport::{Jid, TransportClient};
use crate::Result;

/// A rendered pairing code with its validity window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedCode {
    /// Base64 PNG of the QR image.
    pub code: String,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedCode {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// In-memory binding of a transport client to its persisted session.
pub struct ConnectionHandle {
    session_id: Uuid,
    key: HandleKey,
    client: Arc<dyn TransportClient>,
    lifetime: CancellationToken,
    pairing: Mutex<Option<CancellationToken>>,
    pairing_task: Mutex<Option<JoinHandle<()>>>,
    code: RwLock<Option<CachedCode>>,
    code_ready: Notify,
    state: RwLock<PairingState>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionHandle {
    pub fn new(session_id: Uuid, key: HandleKey, client: Arc<dyn TransportClient>) -> Self {
        Self {
            session_id,
            key,
            client,
            lifetime: CancellationToken::new(),
            pairing: Mutex::new(None),
            pairing_task: Mutex::new(None),
            code: RwLock::new(None),
            code_ready: Notify::new(),
            state: RwLock::new(PairingState::New),
            consumer: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn key(&self) -> &HandleKey {
        &self.key
    }

    pub fn client(&self) -> &Arc<dyn TransportClient> {
        &self.client
    }

    /// Stable device identity, once the transport has one.
    pub fn identity(&self) -> Option<Jid> {
        self.client.device()
    }

    /// Token cancelled when the handle is torn down.
    pub fn lifetime(&self) -> CancellationToken {
        self.lifetime.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lifetime.is_cancelled()
    }

    /// Start a new pairing flow, cancelling the previous one. The returned
    /// token is a child of the handle lifetime.
    pub fn begin_pairing(&self) -> Result<CancellationToken> {
        let token = self.lifetime.child_token();
        let mut pairing = self
            .pairing
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?;
        if let Some(previous) = pairing.replace(token.clone()) {
            previous.cancel();
        }
        Ok(token)
    }

    /// Cancel the active pairing flow, if any.
    pub fn cancel_pairing(&self) -> Result<()> {
        let mut pairing = self
            .pairing
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?;
        if let Some(token) = pairing.take() {
            token.cancel();
        }
        Ok(())
    }

    /// Record the task driving the current pairing flow, returning the one
    /// it replaces.
    pub fn set_pairing_task(&self, task: JoinHandle<()>) -> Result<Option<JoinHandle<()>>> {
        let mut slot = self
            .pairing_task
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?;
        Ok(slot.replace(task))
    }

    /// Cancel the current pairing flow and wait for its task to exit.
    ///
    /// Once this returns, the flow can no longer touch the cached code or
    /// the session record.
    pub async fn stop_pairing(&self) -> Result<()> {
        self.cancel_pairing()?;
        let task = self
            .pairing_task
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?
            .take();
        if let Some(task) = task {
            join_quietly(&self.key, task, "pairing monitor").await;
        }
        Ok(())
    }

    pub fn is_pairing(&self) -> bool {
        self.pairing
            .lock()
            .map(|p| p.as_ref().is_some_and(|t| !t.is_cancelled()))
            .unwrap_or(false)
    }

    /// Cache a freshly rendered code and wake anyone waiting for one.
    pub fn set_code(&self, code: CachedCode) -> Result<()> {
        {
            let mut slot = self.code.write().map_err(|_| GatewayError::LockPoisoned)?;
            *slot = Some(code);
        }
        self.code_ready.notify_waiters();
        Ok(())
    }

    pub fn code(&self) -> Result<Option<CachedCode>> {
        let slot = self.code.read().map_err(|_| GatewayError::LockPoisoned)?;
        Ok(slot.clone())
    }

    /// The cached code, unless it has expired at `now`.
    pub fn valid_code(&self, now: DateTime<Utc>) -> Result<Option<CachedCode>> {
        Ok(self.code()?.filter(|c| !c.is_expired(now)))
    }

    pub fn clear_code(&self) -> Result<()> {
        let mut slot = self.code.write().map_err(|_| GatewayError::LockPoisoned)?;
        *slot = None;
        Ok(())
    }

    /// Future resolved by the next [`set_code`](Self::set_code) or
    /// [`notify`](Self::notify). Create it before checking state to avoid
    /// missing a wake-up.
    pub fn changed(&self) -> Notified<'_> {
        self.code_ready.notified()
    }

    /// Wake waiters without caching a code, e.g. when pairing completes.
    pub fn notify(&self) {
        self.code_ready.notify_waiters();
    }

    pub fn state(&self) -> Result<PairingState> {
        let state = self.state.read().map_err(|_| GatewayError::LockPoisoned)?;
        Ok(*state)
    }

    /// Apply a pairing state transition. Returns `false` when it is not
    /// allowed from the current state.
    pub fn transition(&self, target: PairingState) -> Result<bool> {
        let mut state = self.state.write().map_err(|_| GatewayError::LockPoisoned)?;
        Ok(state.transition_to(target))
    }

    /// Put the pairing state back to `New` for a refresh.
    pub fn reset_state(&self) -> Result<()> {
        let mut state = self.state.write().map_err(|_| GatewayError::LockPoisoned)?;
        *state = PairingState::New;
        Ok(())
    }

    /// Record the task draining this handle's connection events.
    pub fn set_consumer(&self, task: JoinHandle<()>) -> Result<()> {
        let mut consumer = self
            .consumer
            .lock()
            .map_err(|_| GatewayError::LockPoisoned)?;
        if let Some(previous) = consumer.replace(task) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop everything this handle owns: cancel pairing and the lifetime
    /// token, wait for the event consumer to exit, then disconnect.
    ///
    /// After this returns no event from the old client mutates session state.
    pub async fn teardown(&self) {
        self.lifetime.cancel();
        if let Err(e) = self.stop_pairing().await {
            warn!(key = %self.key, error = %e, "failed to stop pairing");
        }

        let consumer = self.consumer.lock().ok().and_then(|mut c| c.take());
        if let Some(task) = consumer {
            join_quietly(&self.key, task, "event consumer").await;
        }

        self.client.disconnect().await;
        self.notify();
        debug!(key = %self.key, session_id = %self.session_id, "handle torn down");
    }
}

async fn join_quietly(key: &HandleKey, task: JoinHandle<()>, what: &str) {
    if let Err(e) = task.await {
        if !e.is_cancelled() {
            warn!(%key, error = %e, task = what, "task ended abnormally");
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("session_id", &self.session_id)
            .field("key", &self.key)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::LoopbackProvider;
    use crate::transport::DeviceProvider;
    use chrono::Duration;

    async fn handle() -> (LoopbackProvider, ConnectionHandle) {
        let provider = LoopbackProvider::new();
        let client = provider.new_device().await.unwrap();
        let h = ConnectionHandle::new(Uuid::new_v4(), HandleKey::new("t1", "alice"), client);
        (provider, h)
    }

    fn code(ttl_secs: i64) -> CachedCode {
        let now = Utc::now();
        CachedCode {
            code: "cG5n".into(),
            generated_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
        }
    }

    #[tokio::test]
    async fn test_code_cache() {
        let (_p, h) = handle().await;
        assert!(h.code().unwrap().is_none());

        h.set_code(code(60)).unwrap();
        assert!(h.valid_code(Utc::now()).unwrap().is_some());

        h.set_code(code(-1)).unwrap();
        assert!(h.code().unwrap().is_some());
        assert!(h.valid_code(Utc::now()).unwrap().is_none());

        h.clear_code().unwrap();
        assert!(h.code().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_set_code_wakes_waiter() {
        let (_p, h) = handle().await;
        let h = Arc::new(h);
        let notified = h.changed();

        let setter = Arc::clone(&h);
        tokio::spawn(async move {
            setter.set_code(code(60)).unwrap();
        });

        tokio::time::timeout(std::time::Duration::from_secs(1), notified)
            .await
            .unwrap();
        assert!(h.code().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_begin_pairing_cancels_previous() {
        let (_p, h) = handle().await;
        let first = h.begin_pairing().unwrap();
        let second = h.begin_pairing().unwrap();

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert!(h.is_pairing());

        h.cancel_pairing().unwrap();
        assert!(second.is_cancelled());
        assert!(!h.is_pairing());
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let (_p, h) = handle().await;
        assert_eq!(h.state().unwrap(), PairingState::New);
        assert!(h.transition(PairingState::AwaitingScan).unwrap());
        assert!(h.transition(PairingState::Connected).unwrap());
        assert!(!h.transition(PairingState::AwaitingScan).unwrap());

        h.reset_state().unwrap();
        assert_eq!(h.state().unwrap(), PairingState::New);
    }

    #[tokio::test]
    async fn test_teardown_cancels_and_disconnects() {
        let (provider, h) = handle().await;
        h.client().connect().await.unwrap();
        let pairing = h.begin_pairing().unwrap();

        let lifetime = h.lifetime();
        h.set_consumer(tokio::spawn(async move { lifetime.cancelled().await }))
            .unwrap();

        h.teardown().await;

        assert!(pairing.is_cancelled());
        assert!(h.is_closed());
        let client = provider.last_client().unwrap();
        assert!(!client.is_connected());
        assert_eq!(client.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_teardown_waits_for_pairing_task() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let (_p, h) = handle().await;
        let token = h.begin_pairing().unwrap();
        let finished = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&finished);
        let task = tokio::spawn(async move {
            token.cancelled().await;
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            flag.store(true, Ordering::SeqCst);
        });
        assert!(h.set_pairing_task(task).unwrap().is_none());

        h.teardown().await;
        assert!(finished.load(Ordering::SeqCst));
    }
}
