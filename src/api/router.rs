//! API router configuration.

use std::future::{Future, IntoFuture};
use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    delete_session, disconnect_session, get_qr, get_session, health, list_sessions,
    register_session, send_media, send_text, AppState,
};
use crate::security::{auth_middleware, ApiAuth};

/// Create the API router with token authentication.
pub fn create_router(state: AppState, auth: ApiAuth) -> Router {
    let session_routes = Router::new()
        .route("/", get(list_sessions).post(register_session))
        .route("/{key}", get(get_session).delete(delete_session))
        .route("/{key}/qr", get(get_qr))
        .route("/{key}/disconnect", post(disconnect_session))
        .route("/{key}/messages/text", post(send_text))
        .route("/{key}/messages/media", post(send_media));

    let api_v1 = Router::new().nest("/sessions", session_routes);

    // CORS sits outside auth so preflight requests are answered without a token.
    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_v1)
        .layer(middleware::from_fn_with_state(Arc::new(auth), auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    pub auth: ApiAuth,
    /// Stop accepting and drain in-flight requests when the shutdown signal fires.
    pub graceful_shutdown: bool,
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            auth: ApiAuth::disabled(),
            graceful_shutdown: true,
        }
    }

    pub fn with_auth(mut self, auth: ApiAuth) -> Self {
        self.auth = auth;
        self
    }

    pub fn without_graceful_shutdown(mut self) -> Self {
        self.graceful_shutdown = false;
        self
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("127.0.0.1", 8080)
    }
}

/// Start the API server and run until `shutdown` resolves.
pub async fn serve<F>(config: ServerConfig, state: AppState, shutdown: F) -> crate::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = config.bind_address();
    let graceful = config.graceful_shutdown;
    let router = create_router(state, config.auth);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Starting pairgate API server on {}", addr);

    if graceful {
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
    } else {
        tokio::select! {
            result = axum::serve(listener, router).into_future() => result?,
            _ = shutdown => {}
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.bind_address(), "127.0.0.1:8080");
        assert!(!config.auth.is_enabled());
        assert!(config.graceful_shutdown);
    }

    #[test]
    fn test_server_config_custom() {
        let config = ServerConfig::new("0.0.0.0", 9000)
            .with_auth(ApiAuth::token("secret"))
            .without_graceful_shutdown();
        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert!(config.auth.is_enabled());
        assert!(!config.graceful_shutdown);
    }
}
