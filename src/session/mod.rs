//! Session records and their live connection state.
//!
//! [`Session`] is the persisted record. [`ConnectionHandle`] is the
//! in-memory binding of one transport client to a session, and
//! [`SessionRegistry`] holds at most one handle per (tenant, key).

mod handle;
mod model;
mod registry;
mod state;

pub use handle::{CachedCode, ConnectionHandle};
pub use model::{Session, SessionProfile, SessionStatus};
pub use registry::{HandleKey, SessionRegistry, SHARD_COUNT};
pub use state::PairingState;
