//! REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::types::{
    api_error, ApiError, DisconnectResponse, ListSessionsResponse, QrResponse, RegisterRequest,
    SendMediaRequest, SendTextRequest, SessionResponse,
};
use crate::manager::{DisconnectOutcome, Registration, SentMessage, SessionManager};
use crate::security::Tenant;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SessionManager>,
}

impl AppState {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    fn is_live(&self, tenant: &Tenant, session_key: &str) -> bool {
        matches!(self.manager.handle(tenant.as_str(), session_key), Ok(Some(_)))
    }
}

/// Health check endpoint.
pub async fn health(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ApiError> {
    let live = state.manager.registry().len().map_err(api_error)?;
    Ok(Json(serde_json::json!({
        "status": "ok",
        "name": "pairgate",
        "version": env!("CARGO_PKG_VERSION"),
        "live_connections": live,
    })))
}

/// List the tenant's sessions, newest first.
pub async fn list_sessions(
    State(state): State<AppState>,
    tenant: Tenant,
) -> Result<Json<ListSessionsResponse>, ApiError> {
    let sessions = state
        .manager
        .list(tenant.as_str())
        .await
        .map_err(api_error)?;

    let sessions: Vec<_> = sessions
        .into_iter()
        .map(|s| {
            let live = state.is_live(&tenant, &s.session_key);
            SessionResponse::from_session(s, live)
        })
        .collect();

    Ok(Json(ListSessionsResponse {
        count: sessions.len(),
        sessions,
    }))
}

/// Register a session and return its first pairing code.
pub async fn register_session(
    State(state): State<AppState>,
    tenant: Tenant,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Registration>), ApiError> {
    let profile = req.validate()?;
    let registration = state
        .manager
        .register(tenant.as_str(), req.session_key.trim(), profile)
        .await
        .map_err(api_error)?;

    Ok((StatusCode::CREATED, Json(registration)))
}

/// Get one session.
pub async fn get_session(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(session_key): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let session = state
        .manager
        .session(tenant.as_str(), &session_key)
        .await
        .map_err(api_error)?;
    let live = state.is_live(&tenant, &session_key);

    Ok(Json(SessionResponse::from_session(session, live)))
}

/// Delete a session, disconnecting it first.
pub async fn delete_session(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(session_key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state
        .manager
        .delete(tenant.as_str(), &session_key)
        .await
        .map_err(api_error)?;

    Ok(StatusCode::NO_CONTENT)
}

/// Current pairing code of a session.
pub async fn get_qr(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(session_key): Path<String>,
) -> Result<Json<QrResponse>, ApiError> {
    let code = state
        .manager
        .pairing_code(tenant.as_str(), &session_key)
        .await
        .map_err(api_error)?;

    Ok(Json(code.into()))
}

/// Close a session's live connection, keeping its record.
pub async fn disconnect_session(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(session_key): Path<String>,
) -> Result<Json<DisconnectResponse>, ApiError> {
    let outcome = state
        .manager
        .disconnect(tenant.as_str(), &session_key)
        .await
        .map_err(api_error)?;

    Ok(Json(DisconnectResponse {
        disconnected: outcome == DisconnectOutcome::Disconnected,
    }))
}

pub async fn send_text(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(session_key): Path<String>,
    Json(req): Json<SendTextRequest>,
) -> Result<Json<SentMessage>, ApiError> {
    let sent = state
        .manager
        .send_text(tenant.as_str(), &session_key, &req.number, &req.text)
        .await
        .map_err(api_error)?;

    Ok(Json(sent))
}

pub async fn send_media(
    State(state): State<AppState>,
    tenant: Tenant,
    Path(session_key): Path<String>,
    Json(req): Json<SendMediaRequest>,
) -> Result<Json<SentMessage>, ApiError> {
    let message = req.into_message()?;
    let sent = state
        .manager
        .send_media(tenant.as_str(), &session_key, message)
        .await
        .map_err(api_error)?;

    Ok(Json(sent))
}
