//! Pairing flow controller.
//!
//! A flow opens a pairing stream on a handle's transport client and spawns a
//! monitor task that drains it: each code is rendered to a QR image, cached
//! on the handle and persisted best-effort. Callers block in
//! [`PairingController::wait`] until the client has a device identity or a
//! code is cached, bounded by [`PairingConfig::wait_timeout`].

pub mod qr;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::session::{CachedCode, ConnectionHandle, PairingState};
use crate::store::SessionRepository;
use crate::transport::{Jid, PairingEvent, PairingStream, TransportClient, TransportError};
use crate::Result;

/// Timing of pairing flows.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PairingConfig {
    /// Longest a register call waits for a code or identity.
    #[serde(with = "millis")]
    pub wait_timeout: Duration,
    /// Poll interval of the bounded wait.
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Code validity when the network does not state one.
    #[serde(with = "millis")]
    pub default_code_ttl: Duration,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(8),
            poll_interval: Duration::from_millis(200),
            default_code_ttl: Duration::from_secs(60),
        }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

/// What a bounded wait produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingOutcome {
    /// The client already holds a stable device identity.
    Connected(Jid),
    /// A valid code is ready to be scanned.
    Code(CachedCode),
}

/// Starts pairing flows and waits on them.
#[derive(Clone)]
pub struct PairingController {
    repo: Arc<dyn SessionRepository>,
    config: PairingConfig,
}

impl PairingController {
    pub fn new(repo: Arc<dyn SessionRepository>, config: PairingConfig) -> Self {
        Self { repo, config }
    }

    pub fn config(&self) -> &PairingConfig {
        &self.config
    }

    /// Open a pairing stream on the handle's client and spawn its monitor.
    ///
    /// Any earlier flow on the handle is stopped and its code dropped. The
    /// client should be connected afterwards for codes to start arriving.
    pub async fn start(&self, handle: &Arc<ConnectionHandle>) -> Result<()> {
        handle.stop_pairing().await?;
        let token = handle.begin_pairing()?;
        handle.clear_code()?;
        handle.reset_state()?;

        let stream = match handle.client().open_pairing_stream(token.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                token.cancel();
                return Err(GatewayError::transport("failed to open pairing stream", e));
            }
        };

        let monitor = Monitor {
            handle: Arc::clone(handle),
            repo: Arc::clone(&self.repo),
            default_ttl: self.config.default_code_ttl,
        };
        let task = tokio::spawn(monitor.run(stream, token));
        if let Some(stale) = handle.set_pairing_task(task)? {
            stale.abort();
        }
        debug!(key = %handle.key(), "pairing flow started");
        Ok(())
    }

    /// Wait until the handle's client has a device identity or a valid code
    /// is cached.
    ///
    /// Fails with [`GatewayError::PairingTimeout`] when neither happens
    /// within the configured deadline. The flow itself keeps running.
    pub async fn wait(&self, handle: &ConnectionHandle) -> Result<PairingOutcome> {
        let deadline = Instant::now() + self.config.wait_timeout;
        loop {
            let changed = handle.changed();

            if let Some(jid) = handle.identity() {
                return Ok(PairingOutcome::Connected(jid));
            }
            if let Some(code) = handle.valid_code(Utc::now())? {
                return Ok(PairingOutcome::Code(code));
            }
            if handle.is_closed() {
                return Err(GatewayError::transport(
                    "pairing flow ended",
                    TransportError::Closed,
                ));
            }
            match handle.state()? {
                PairingState::Error => {
                    return Err(GatewayError::transport(
                        "pairing flow ended",
                        TransportError::Pairing("pairing failed".into()),
                    ))
                }
                PairingState::Expired => return Err(GatewayError::PairingTimeout),
                _ => {}
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(GatewayError::PairingTimeout);
            }
            let nap = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                _ = changed => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    /// Replace an expired code: restart the flow, reconnect if needed, and
    /// wait again.
    pub async fn refresh(&self, handle: &Arc<ConnectionHandle>) -> Result<PairingOutcome> {
        info!(key = %handle.key(), "refreshing expired pairing code");
        self.start(handle).await?;

        if !handle.client().is_connected() {
            handle
                .client()
                .connect()
                .await
                .map_err(|e| GatewayError::transport("failed to reconnect for pairing", e))?;
        }
        self.wait(handle).await
    }
}

/// Background consumer of one pairing stream.
struct Monitor {
    handle: Arc<ConnectionHandle>,
    repo: Arc<dyn SessionRepository>,
    default_ttl: Duration,
}

impl Monitor {
    async fn run(self, mut stream: PairingStream, token: CancellationToken) {
        let key = self.handle.key().clone();
        loop {
            let event = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(%key, "pairing flow cancelled");
                    break;
                }
                event = stream.recv() => event,
            };

            match event {
                Some(PairingEvent::Code { code, timeout }) => {
                    if let Err(e) = self.cache_code(&code, timeout, &token).await {
                        warn!(%key, error = %e, "failed to cache pairing code");
                    }
                }
                Some(PairingEvent::Success) => {
                    info!(%key, "pairing succeeded");
                    token.cancel();
                    self.finish(PairingState::Connected);
                    break;
                }
                Some(PairingEvent::Timeout) => {
                    info!(%key, "pairing timed out");
                    if let Err(e) = self.handle.clear_code() {
                        warn!(%key, error = %e, "failed to clear pairing code");
                    }
                    self.finish(PairingState::Expired);
                    break;
                }
                Some(PairingEvent::Error(message)) => {
                    warn!(%key, error = %message, "pairing failed");
                    self.finish(PairingState::Error);
                    break;
                }
                None => {
                    debug!(%key, "pairing stream closed");
                    break;
                }
            }
        }
    }

    async fn cache_code(
        &self,
        raw: &str,
        timeout: Option<Duration>,
        token: &CancellationToken,
    ) -> Result<()> {
        let image = qr::render_base64_png(raw)?;
        let ttl = timeout.unwrap_or(self.default_ttl);
        let generated_at = Utc::now();
        let expires_at = generated_at
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::seconds(60));

        if token.is_cancelled() {
            return Ok(());
        }
        self.handle.set_code(CachedCode {
            code: image.clone(),
            generated_at,
            expires_at,
        })?;
        self.handle.transition(PairingState::AwaitingScan)?;
        debug!(key = %self.handle.key(), %expires_at, "pairing code cached");

        let persist = self
            .repo
            .update_pairing_code(self.handle.session_id(), &image, expires_at);
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                debug!(key = %self.handle.key(), "pairing flow cancelled before code was persisted");
            }
            result = persist => {
                if let Err(e) = result {
                    warn!(key = %self.handle.key(), error = %e, "failed to persist pairing code");
                }
            }
        }
        Ok(())
    }

    fn finish(&self, state: PairingState) {
        if let Err(e) = self.handle.transition(state) {
            warn!(key = %self.handle.key(), error = %e, "failed to record pairing state");
        }
        self.handle.notify();
    }
}
