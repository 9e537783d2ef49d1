//! HTTP API for pairgate.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check (no authentication)
//!
//! All session routes need the `apitoken` and `SESSIONKEY` headers.
//!
//! - `GET /api/v1/sessions` - List the tenant's sessions
//! - `POST /api/v1/sessions` - Register a session and get its pairing code
//! - `GET /api/v1/sessions/{key}` - Get a session
//! - `DELETE /api/v1/sessions/{key}` - Delete a session
//! - `GET /api/v1/sessions/{key}/qr` - Current pairing code
//! - `POST /api/v1/sessions/{key}/disconnect` - Close the live connection
//! - `POST /api/v1/sessions/{key}/messages/text` - Send a text message
//! - `POST /api/v1/sessions/{key}/messages/media` - Send a media message

pub mod handlers;
pub mod router;
pub mod types;

pub use handlers::AppState;
pub use router::{create_router, serve, ServerConfig};
pub use types::{api_error, ApiError, ErrorResponse};
