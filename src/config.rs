//! Configuration management
//!
//! Loads configuration from:
//! 1. Default values
//! 2. Configuration files (config/default.toml, config/local.toml)
//! 3. Environment variables (override)

use serde::Deserialize;
use std::{net::IpAddr, path::PathBuf, time::Duration};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    pub admin: AdminConfig,
    #[serde(default)]
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    pub host: String,
    /// Port number (e.g., 8080)
    pub port: u16,
    /// Public domain (e.g., "photos.example.com")
    pub domain: String,
    /// Protocol ("http" or "https")
    pub protocol: String,
}

impl ServerConfig {
    /// Get the base URL for the instance
    ///
    /// # Returns
    /// Full URL like "https://photos.example.com"
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.protocol, self.domain)
    }

    /// ActivityPub id of a local actor
    pub fn actor_uri(&self, username: &str) -> String {
        format!("{}/actors/{}", self.base_url(), username)
    }

    /// Shared inbox endpoint of this instance
    pub fn shared_inbox_uri(&self) -> String {
        format!("{}/shared/inbox", self.base_url())
    }
}

/// Database configuration (SQLite only)
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    pub path: PathBuf,
}

/// Instance metadata
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceConfig {
    pub title: String,
    /// Username of the instance application actor
    #[serde(default = "default_actor_username")]
    pub actor_username: String,
}

fn default_actor_username() -> String {
    "instance".to_string()
}

/// Operator API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AdminConfig {
    /// Bearer token required on every /admin route
    pub api_token: String,
}

/// Federation settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// User-Agent sent on outgoing requests
    pub user_agent: String,
    /// Timeout for each outgoing HTTP request
    pub request_timeout_secs: u64,
    /// RSA modulus size for generated actor keys
    pub key_bits: usize,
    pub delivery: DeliveryConfig,
    pub inbound: InboundConfig,
    pub key_cache: KeyCacheConfig,
    pub domain_blocks: DomainBlocksConfig,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("Aperture/{}", env!("CARGO_PKG_VERSION")),
            request_timeout_secs: 10,
            key_bits: 2048,
            delivery: DeliveryConfig::default(),
            inbound: InboundConfig::default(),
            key_cache: KeyCacheConfig::default(),
            domain_blocks: DomainBlocksConfig::default(),
        }
    }
}

impl FederationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Outbound delivery retry settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Attempts per destination, including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Destinations delivered in parallel
    pub concurrency: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
            concurrency: 10,
        }
    }
}

/// Inbound queue and worker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InboundConfig {
    /// Worker tasks claiming jobs
    pub workers: usize,
    /// Processing attempts per job, including the first
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Idle poll interval when no enqueue notification arrives
    pub poll_interval_ms: u64,
    /// Largest accepted request body
    pub max_body_bytes: usize,
    /// Allowed distance between the Date header and receipt time
    pub signature_max_age_secs: i64,
}

impl Default for InboundConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_attempts: 5,
            base_backoff_ms: 2_000,
            max_backoff_ms: 300_000,
            poll_interval_ms: 1_000,
            max_body_bytes: 1024 * 1024,
            signature_max_age_secs: 300,
        }
    }
}

/// Remote public key cache settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KeyCacheConfig {
    pub ttl_secs: u64,
}

impl Default for KeyCacheConfig {
    fn default() -> Self {
        Self { ttl_secs: 3600 }
    }
}

/// Blocked-domain snapshot settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DomainBlocksConfig {
    pub refresh_interval_secs: u64,
}

impl Default for DomainBlocksConfig {
    fn default() -> Self {
        Self {
            refresh_interval_secs: 60,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Log format: "pretty" or "json"
    pub format: String,
}

impl AppConfig {
    /// Load configuration from file and environment
    ///
    /// # Loading Order
    /// 1. Default values
    /// 2. config/default.toml (if exists)
    /// 3. config/local.toml (if exists)
    /// 4. Environment variables (APERTURE__*)
    ///
    /// # Errors
    /// Returns error if configuration is invalid
    pub fn load() -> Result<Self, crate::error::AppError> {
        use config::{Config, Environment, File};

        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.protocol", "http")?
            .set_default("database.path", "data/aperture.db")?
            .set_default("instance.title", "Aperture")?
            .set_default("instance.actor_username", "instance")?
            .set_default("logging.level", "info")?
            .set_default("logging.format", "pretty")?
            // Load from config/default.toml if it exists
            .add_source(File::with_name("config/default").required(false))
            // Load from config/local.toml if it exists (overrides default)
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables (APERTURE__*)
            .add_source(
                Environment::with_prefix("APERTURE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;

        let app_config: Self = config
            .try_deserialize()
            .map_err(|e| crate::error::AppError::Config(e.to_string()))?;
        app_config.validate()?;
        Ok(app_config)
    }

    pub fn validate(&self) -> Result<(), crate::error::AppError> {
        use crate::error::AppError;
        const MIN_ADMIN_TOKEN_BYTES: usize = 16;

        if self.admin.api_token.as_bytes().len() < MIN_ADMIN_TOKEN_BYTES {
            return Err(AppError::Config(format!(
                "admin.api_token must be at least {} bytes",
                MIN_ADMIN_TOKEN_BYTES
            )));
        }

        let federation = &self.federation;
        if federation.delivery.max_attempts == 0 || federation.inbound.max_attempts == 0 {
            return Err(AppError::Config(
                "federation max_attempts must be greater than 0".to_string(),
            ));
        }
        if federation.inbound.workers == 0 || federation.delivery.concurrency == 0 {
            return Err(AppError::Config(
                "federation workers and delivery concurrency must be greater than 0".to_string(),
            ));
        }
        if federation.delivery.base_backoff_ms > federation.delivery.max_backoff_ms
            || federation.inbound.base_backoff_ms > federation.inbound.max_backoff_ms
        {
            return Err(AppError::Config(
                "federation base_backoff_ms must not exceed max_backoff_ms".to_string(),
            ));
        }

        if is_local_server_domain(&self.server.domain) {
            if !self.server.protocol.eq_ignore_ascii_case("https") {
                let host = normalized_server_host(&self.server.domain);
                tracing::warn!(
                    host = %host,
                    protocol = %self.server.protocol,
                    "Serving federation over plain http for local development"
                );
            }
        } else if !self.server.protocol.eq_ignore_ascii_case("https") {
            return Err(AppError::Config(
                "server.protocol must be https for non-local server domains".to_string(),
            ));
        }

        Ok(())
    }
}

fn normalized_server_host(domain: &str) -> String {
    let trimmed = domain.trim();
    let parsed_host = url::Url::parse(&format!("http://{trimmed}"))
        .ok()
        .and_then(|url| url.host_str().map(|host| host.to_string()));
    let host = parsed_host.unwrap_or_else(|| trimmed.to_string());
    host.trim_end_matches('.').to_ascii_lowercase()
}

fn is_local_server_domain(domain: &str) -> bool {
    let host = normalized_server_host(domain);
    if host == "localhost" || host.ends_with(".localhost") {
        return true;
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        return ip.is_loopback() || ip.is_unspecified();
    }

    false
}
