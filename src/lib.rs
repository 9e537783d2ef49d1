//! # pairgate
//!
//! Multi-tenant messaging session gateway.
//!
//! Each tenant owns named sessions. Registering a session opens a device
//! pairing flow and returns a scannable QR code; once the owner scans it the
//! session stays connected, survives restarts through startup
//! reconciliation, and can send text and media messages.
//!
//! ## Features
//!
//! - **Sharded registry**: at most one live connection per (tenant, session key)
//! - **Bounded pairing wait**: registration answers with a code or a timeout
//! - **Reconciliation**: sessions paired before a restart reconnect on startup
//! - **Pluggable collaborators**: session store, device store and transport are traits
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pairgate::manager::{ManagerConfig, SessionManager};
//! use pairgate::session::SessionProfile;
//! use pairgate::store::MemorySessionRepository;
//! use pairgate::transport::loopback::LoopbackProvider;
//!
//! #[tokio::main]
//! async fn main() -> pairgate::Result<()> {
//!     pairgate::logging::try_init().ok();
//!
//!     let manager = SessionManager::new(
//!         Arc::new(MemorySessionRepository::new()),
//!         Arc::new(LoopbackProvider::new()),
//!         ManagerConfig::default(),
//!     )?;
//!     manager.reconcile().await?;
//!
//!     let registration = manager
//!         .register("acme", "alice", SessionProfile::new("Alice", "alice@acme.test"))
//!         .await?;
//!     println!("scan this: {:?}", registration.qr_code_base64);
//!
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod error;
pub mod logging;
pub mod manager;
pub mod media;
pub mod pairing;
pub mod security;
pub mod session;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use error::{GatewayError, Result};
pub use manager::{ManagerConfig, SessionManager};
pub use session::{Session, SessionProfile, SessionStatus};
