//! In-process transport that simulates pairing and delivery.
//!
//! Speaks no network protocol. Codes are issued as soon as a pairing stream
//! is open on a connected client, pairing is completed by calling
//! [`LoopbackClient::complete_pairing`], and sent messages are recorded for
//! inspection. Used by the test suite and for local development.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{
    ConnectionEvent, DeviceProvider, Jid, MediaKind, OutgoingMessage, PairingEvent,
    PairingStream, TransportClient, TransportError, UploadedMedia,
};

const PAIRING_BUFFER: usize = 8;

/// Behaviour knobs for the loopback network.
#[derive(Debug, Clone)]
pub struct LoopbackConfig {
    /// Issue a code whenever a pairing stream is open on a connected client.
    pub auto_code: bool,
    /// Validity attached to issued codes. `None` leaves it to the gateway
    /// default.
    pub code_ttl: Option<Duration>,
    /// Make every `connect` fail.
    pub fail_connect: bool,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            auto_code: true,
            code_ttl: Some(Duration::from_secs(60)),
            fail_connect: false,
        }
    }
}

#[derive(Default)]
struct Shared {
    devices: Mutex<BTreeMap<String, Jid>>,
    clients: Mutex<Vec<Arc<LoopbackClient>>>,
    config: Mutex<LoopbackConfig>,
    counter: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn config(&self) -> LoopbackConfig {
        lock(&self.config).clone()
    }
}

/// Device container of the loopback network.
#[derive(Clone, Default)]
pub struct LoopbackProvider {
    shared: Arc<Shared>,
}

impl LoopbackProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LoopbackConfig) -> Self {
        let provider = Self::default();
        *lock(&provider.shared.config) = config;
        provider
    }

    /// Change behaviour for clients created or connected from now on.
    pub fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut LoopbackConfig),
    {
        f(&mut lock(&self.shared.config));
    }

    /// Store a paired device credential for `account`, as if it had been
    /// linked in an earlier run.
    pub fn provision(&self, account: &str) -> Jid {
        let jid = Jid::device(account, 1);
        lock(&self.shared.devices).insert(jid.to_string(), jid.clone());
        jid
    }

    /// Every client handed out so far, oldest first.
    pub fn clients(&self) -> Vec<Arc<LoopbackClient>> {
        lock(&self.shared.clients).clone()
    }

    pub fn last_client(&self) -> Option<Arc<LoopbackClient>> {
        lock(&self.shared.clients).last().cloned()
    }

    fn spawn_client(&self, device: Option<Jid>) -> Arc<LoopbackClient> {
        let client = Arc::new(LoopbackClient {
            shared: Arc::clone(&self.shared),
            device: Mutex::new(device),
            connected: AtomicBool::new(false),
            pairing: Mutex::new(None),
            sink: Mutex::new(None),
            sent: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        });
        lock(&self.shared.clients).push(Arc::clone(&client));
        client
    }
}

#[async_trait]
impl DeviceProvider for LoopbackProvider {
    async fn new_device(&self) -> Result<Arc<dyn TransportClient>, TransportError> {
        Ok(self.spawn_client(None))
    }

    async fn all_devices(&self) -> Result<Vec<Jid>, TransportError> {
        Ok(lock(&self.shared.devices).values().cloned().collect())
    }

    async fn get_device(&self, jid: &Jid) -> Result<Option<Jid>, TransportError> {
        Ok(lock(&self.shared.devices).get(&jid.to_string()).cloned())
    }

    async fn client_for(&self, device: &Jid) -> Result<Arc<dyn TransportClient>, TransportError> {
        if !lock(&self.shared.devices).contains_key(&device.to_string()) {
            return Err(TransportError::Device(format!("unknown device {}", device)));
        }
        Ok(self.spawn_client(Some(device.clone())))
    }

    async fn delete_device(&self, device: &Jid) -> Result<(), TransportError> {
        lock(&self.shared.devices).remove(&device.to_string());
        Ok(())
    }
}

/// A simulated connection.
pub struct LoopbackClient {
    shared: Arc<Shared>,
    device: Mutex<Option<Jid>>,
    connected: AtomicBool,
    pairing: Mutex<Option<(mpsc::Sender<PairingEvent>, CancellationToken)>>,
    sink: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
    sent: Mutex<Vec<(Jid, OutgoingMessage)>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl LoopbackClient {
    /// Push a pairing event onto the open stream. Returns `false` when no
    /// live stream is open.
    pub fn push_pairing_event(&self, event: PairingEvent) -> bool {
        let mut pairing = lock(&self.pairing);
        let open = match pairing.as_ref() {
            Some((tx, cancel)) if !cancel.is_cancelled() => tx.try_send(event).is_ok(),
            _ => false,
        };
        if !open {
            *pairing = None;
        }
        open
    }

    /// Issue a new code on the open pairing stream.
    pub fn issue_code(&self) -> bool {
        let n = self.shared.next();
        let ttl = self.shared.config().code_ttl;
        self.push_pairing_event(PairingEvent::Code {
            code: format!("2@loopback-{n},pairing-payload"),
            timeout: ttl,
        })
    }

    /// Simulate the owner scanning the code: the device becomes linked to
    /// `account`, the pairing stream reports success and a `Connected`
    /// notification follows.
    pub fn complete_pairing(&self, account: &str) -> Jid {
        let index = (self.shared.next() % u64::from(u16::MAX)) as u16;
        let jid = Jid::device(account, index.max(1));
        lock(&self.shared.devices).insert(jid.to_string(), jid.clone());
        *lock(&self.device) = Some(jid.clone());
        self.push_pairing_event(PairingEvent::Success);
        self.connected.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::Connected);
        jid
    }

    /// Deliver a connection notification to the installed sink.
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        match lock(&self.sink).as_ref() {
            Some(sink) => sink.try_send(event).is_ok(),
            None => false,
        }
    }

    pub fn has_open_pairing_stream(&self) -> bool {
        matches!(lock(&self.pairing).as_ref(), Some((tx, cancel)) if !cancel.is_cancelled() && !tx.is_closed())
    }

    pub fn sent_messages(&self) -> Vec<(Jid, OutgoingMessage)> {
        lock(&self.sent).clone()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportClient for LoopbackClient {
    async fn connect(&self) -> Result<(), TransportError> {
        let config = self.shared.config();
        if config.fail_connect {
            return Err(TransportError::Connect("loopback refused connection".into()));
        }
        self.connected.store(true, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
        trace!("loopback client connected");

        if self.device().is_some() {
            self.emit(ConnectionEvent::Connected);
        } else if config.auto_code {
            self.issue_code();
        }
        Ok(())
    }

    async fn disconnect(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.emit(ConnectionEvent::Disconnected);
        }
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        *lock(&self.pairing) = None;
        debug!("loopback client disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn device(&self) -> Option<Jid> {
        lock(&self.device).clone()
    }

    async fn open_pairing_stream(
        &self,
        cancel: CancellationToken,
    ) -> Result<PairingStream, TransportError> {
        if self.device().is_some() {
            return Err(TransportError::Pairing("device already paired".into()));
        }
        let (tx, rx) = mpsc::channel(PAIRING_BUFFER);
        *lock(&self.pairing) = Some((tx, cancel));

        if self.is_connected() && self.shared.config().auto_code {
            self.issue_code();
        }
        Ok(rx)
    }

    async fn upload(
        &self,
        data: Vec<u8>,
        kind: MediaKind,
    ) -> Result<UploadedMedia, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        let n = self.shared.next();
        Ok(UploadedMedia {
            url: format!("loopback://media/{}/{}", kind.as_str(), n),
            direct_path: format!("/{}/{}", kind.as_str(), n),
            media_key: n.to_be_bytes().to_vec(),
            file_length: data.len() as u64,
            ..UploadedMedia::default()
        })
    }

    async fn send_message(
        &self,
        recipient: &Jid,
        message: OutgoingMessage,
    ) -> Result<String, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Closed);
        }
        lock(&self.sent).push((recipient.clone(), message));
        Ok(format!("LB{:016X}", self.shared.next()))
    }

    fn set_event_sink(&self, sink: mpsc::Sender<ConnectionEvent>) {
        *lock(&self.sink) = Some(sink);
    }
}
