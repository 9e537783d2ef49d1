//! Configuration management for pairgate.
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. Command-line arguments
//! 2. Environment variables
//! 3. Configuration file (JSON)
//! 4. Default values

use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::api::ServerConfig;
use crate::cli::Args;
use crate::manager::{ManagerConfig, MessagingConfig};
use crate::pairing::PairingConfig;
use crate::security::ApiAuth;

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub auth: AuthSection,
    pub database: DatabaseSection,
    pub pairing: PairingConfig,
    pub messaging: MessagingConfig,
    pub logging: LoggingSection,
}

/// Server configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Host address to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Drain in-flight requests and disconnect sessions on Ctrl+C.
    pub graceful_shutdown: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            graceful_shutdown: true,
        }
    }
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSection {
    /// Require the `apitoken` header on API routes.
    pub enabled: bool,
    /// Expected value of the `apitoken` header.
    pub api_token: Option<String>,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            enabled: true,
            api_token: None,
        }
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSection {
    /// SQLite URL, e.g. `sqlite://pairgate.db` or `sqlite::memory:`.
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            url: "sqlite://pairgate.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level (error, warn, info, debug, trace) or a full filter directive.
    pub level: String,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    fn apply_env_from<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = var("PAIRGATE_HOST") {
            self.server.host = host;
        }

        if let Some(port) = var("PAIRGATE_PORT").and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }

        if let Some(token) = var("PAIRGATE_API_TOKEN").filter(|t| !t.is_empty()) {
            self.auth.enabled = true;
            self.auth.api_token = Some(token);
        }

        if let Some(url) = var("PAIRGATE_DATABASE_URL").filter(|u| !u.is_empty()) {
            self.database.url = url;
        }

        if let Some(code) = var("PAIRGATE_DEFAULT_COUNTRY").filter(|c| !c.is_empty()) {
            self.messaging.default_country_code = code;
        }

        if let Some(level) = var("PAIRGATE_LOG_LEVEL") {
            self.logging.level = level;
        } else if let Some(level) = var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Apply CLI argument overrides.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(host) = args.host {
            self.server.host = host.to_string();
        }
        if let Some(port) = args.port {
            self.server.port = port;
        }

        if let Some(ref token) = args.api_token {
            self.auth.enabled = true;
            self.auth.api_token = Some(token.clone());
        }

        if args.no_auth {
            self.auth.enabled = false;
        }

        if let Some(ref url) = args.database {
            self.database.url = url.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }
    }

    /// Load configuration with full priority chain.
    ///
    /// Priority: CLI args > env vars > config file > defaults
    pub fn load(args: &Args) -> Result<Self, ConfigError> {
        let mut config = match args.config {
            Some(ref path) => Config::from_file(path)?,
            None => Config::default(),
        };

        config.apply_env();
        config.apply_args(args);
        config.validate()?;

        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.enabled && self.auth.api_token.as_deref().map_or(true, str::is_empty) {
            return Err(ConfigError::MissingToken);
        }
        if self.pairing.poll_interval.is_zero() || self.pairing.wait_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "pairing wait_timeout and poll_interval must be positive".into(),
            ));
        }
        if self.messaging.default_country_code.chars().any(|c| !c.is_ascii_digit()) {
            return Err(ConfigError::Invalid(format!(
                "default_country_code must be digits, got '{}'",
                self.messaging.default_country_code
            )));
        }
        Ok(())
    }

    /// Convert to ServerConfig for the API server.
    pub fn to_server_config(&self) -> Result<ServerConfig, ConfigError> {
        let host: IpAddr = self
            .server
            .host
            .parse()
            .map_err(|_| ConfigError::InvalidHost(self.server.host.clone()))?;

        let auth = match (self.auth.enabled, &self.auth.api_token) {
            (true, Some(token)) => ApiAuth::token(token),
            (true, None) => return Err(ConfigError::MissingToken),
            (false, _) => ApiAuth::disabled(),
        };

        let mut server_config = ServerConfig::new(host.to_string(), self.server.port).with_auth(auth);
        if !self.server.graceful_shutdown {
            server_config = server_config.without_graceful_shutdown();
        }

        Ok(server_config)
    }

    /// Tunables for the session manager.
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            pairing: self.pairing.clone(),
            messaging: self.messaging.clone(),
        }
    }

    /// Get the log level filter string.
    pub fn log_filter(&self) -> &str {
        &self.logging.level
    }
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// IO error reading config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("failed to parse config file: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid host address.
    #[error("invalid host address: {0}")]
    InvalidHost(String),

    /// Authentication is on but no token was configured.
    #[error("an API token is required (set PAIRGATE_API_TOKEN, --api-token, or disable auth with --no-auth)")]
    MissingToken,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
