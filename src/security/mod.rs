//! Request authentication for the API layer.
//!
//! Every route except `/health` needs the shared token in the `apitoken`
//! header. Session routes also need a `SESSIONKEY` header naming the tenant;
//! sessions of other tenants are invisible to the request.

pub mod auth;

pub use auth::{auth_middleware, ApiAuth, Tenant, TENANT_HEADER, TOKEN_HEADER};
