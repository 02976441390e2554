//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub read_receipts: ReadReceiptsConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Origins allowed by CORS. Empty allows any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "playzy_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Token signing settings.
///
/// There is no default secret. A deployment that does not set
/// `auth.jwt_secret` (or `PLAYZY_JWT_SECRET`) fails validation.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,

    #[serde(default = "default_token_ttl_secs")]
    pub token_ttl_secs: u64,
}

/// Where the gateway takes the connecting user's identity from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    /// The `userID` query parameter, trusted as-is.
    Query,
    /// A bearer token in the `token` query parameter or `Authorization` header.
    Token,
}

/// Real-time gateway and per-connection tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_identity_source")]
    pub identity_source: IdentitySource,

    /// Minimum spacing between connection attempts from one identity.
    #[serde(default = "default_connect_cooldown_ms")]
    pub connect_cooldown_ms: u64,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Largest inbound frame that is processed; bigger frames are dropped.
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Hard transport ceiling; bigger frames terminate the connection.
    #[serde(default = "default_max_transport_bytes")]
    pub max_transport_bytes: usize,

    #[serde(default = "default_write_wait_secs")]
    pub write_wait_secs: u64,

    #[serde(default = "default_pong_wait_secs")]
    pub pong_wait_secs: u64,

    #[serde(default = "default_ping_period_secs")]
    pub ping_period_secs: u64,
}

/// Capacities of the registry's control-loop inputs.
#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_register_capacity")]
    pub register_capacity: usize,

    #[serde(default = "default_register_capacity")]
    pub unregister_capacity: usize,

    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Requests per minute per client IP on `/users` and `/auth`.
    #[serde(default = "default_auth_requests_per_minute")]
    pub auth_requests_per_minute: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadReceiptsConfig {
    #[serde(default = "default_read_receipt_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "playzy.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5_000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_token_ttl_secs() -> u64 {
    24 * 60 * 60
}

fn default_identity_source() -> IdentitySource {
    IdentitySource::Query
}

fn default_connect_cooldown_ms() -> u64 {
    1_000
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_max_frame_bytes() -> usize {
    512 * 1024
}

fn default_max_transport_bytes() -> usize {
    2 * 1024 * 1024
}

fn default_write_wait_secs() -> u64 {
    10
}

fn default_pong_wait_secs() -> u64 {
    60
}

fn default_ping_period_secs() -> u64 {
    default_pong_wait_secs() * 9 / 10
}

fn default_register_capacity() -> usize {
    100
}

fn default_broadcast_capacity() -> usize {
    1_000
}

fn default_auth_requests_per_minute() -> u32 {
    20
}

fn default_read_receipt_queue_capacity() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: Vec::new(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            token_ttl_secs: default_token_ttl_secs(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            identity_source: default_identity_source(),
            connect_cooldown_ms: default_connect_cooldown_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_frame_bytes: default_max_frame_bytes(),
            max_transport_bytes: default_max_transport_bytes(),
            write_wait_secs: default_write_wait_secs(),
            pong_wait_secs: default_pong_wait_secs(),
            ping_period_secs: default_ping_period_secs(),
        }
    }
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            register_capacity: default_register_capacity(),
            unregister_capacity: default_register_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            auth_requests_per_minute: default_auth_requests_per_minute(),
        }
    }
}

impl Default for ReadReceiptsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_read_receipt_queue_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn connect_cooldown(&self) -> Duration {
        Duration::from_millis(self.connect_cooldown_ms)
    }

    pub fn write_wait(&self) -> Duration {
        Duration::from_secs(self.write_wait_secs)
    }

    pub fn pong_wait(&self) -> Duration {
        Duration::from_secs(self.pong_wait_secs)
    }

    pub fn ping_period(&self) -> Duration {
        Duration::from_secs(self.ping_period_secs)
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("auth.jwt_secret is required (set it in the config file or PLAYZY_JWT_SECRET)")]
    MissingJwtSecret,

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl Config {
    /// Rejects configurations the server cannot run safely with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.auth.jwt_secret.trim().is_empty() {
            return Err(ConfigError::MissingJwtSecret);
        }
        if self.auth.jwt_secret.len() < 32 {
            tracing::warn!("auth.jwt_secret is shorter than 32 bytes");
        }

        let gateway = &self.gateway;
        if gateway.ping_period_secs == 0 || gateway.ping_period_secs >= gateway.pong_wait_secs {
            return Err(ConfigError::Invalid(format!(
                "gateway.ping_period_secs ({}) must be non-zero and shorter than gateway.pong_wait_secs ({})",
                gateway.ping_period_secs, gateway.pong_wait_secs
            )));
        }
        if gateway.write_wait_secs == 0 {
            return Err(ConfigError::Invalid(
                "gateway.write_wait_secs must be non-zero".to_string(),
            ));
        }
        if gateway.max_frame_bytes == 0 || gateway.max_frame_bytes > gateway.max_transport_bytes {
            return Err(ConfigError::Invalid(format!(
                "gateway.max_frame_bytes ({}) must be non-zero and at most gateway.max_transport_bytes ({})",
                gateway.max_frame_bytes, gateway.max_transport_bytes
            )));
        }

        let capacities = [
            ("gateway.outbound_queue_capacity", gateway.outbound_queue_capacity),
            ("registry.register_capacity", self.registry.register_capacity),
            ("registry.unregister_capacity", self.registry.unregister_capacity),
            ("registry.broadcast_capacity", self.registry.broadcast_capacity),
            ("read_receipts.queue_capacity", self.read_receipts.queue_capacity),
        ];
        if let Some((name, _)) = capacities.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
        }

        Ok(())
    }
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PLAYZY_HOST` overrides `server.host`
/// - `PLAYZY_PORT` overrides `server.port`
/// - `PLAYZY_DB_PATH` overrides `database.path`
/// - `PLAYZY_LOG_LEVEL` overrides `logging.level`
/// - `PLAYZY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PLAYZY_JWT_SECRET` overrides `auth.jwt_secret`
/// - `PLAYZY_IDENTITY_SOURCE` overrides `gateway.identity_source` ("query" or "token")
///
/// The result is not validated; call [`Config::validate`] before serving.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    if let Ok(host) = std::env::var("PLAYZY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("PLAYZY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("PLAYZY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("PLAYZY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("PLAYZY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(secret) = std::env::var("PLAYZY_JWT_SECRET") {
        config.auth.jwt_secret = secret;
    }
    if let Ok(source) = std::env::var("PLAYZY_IDENTITY_SOURCE") {
        match source.to_ascii_lowercase().as_str() {
            "query" => config.gateway.identity_source = IdentitySource::Query,
            "token" => config.gateway.identity_source = IdentitySource::Token,
            other => tracing::warn!(value = other, "ignoring unknown PLAYZY_IDENTITY_SOURCE"),
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        let mut config = Config::default();
        config.auth.jwt_secret = "a-test-secret-that-is-long-enough!!".to_string();
        config
    }

    #[test]
    fn defaults_follow_connection_timing() {
        let gateway = GatewayConfig::default();
        assert_eq!(gateway.pong_wait(), Duration::from_secs(60));
        assert_eq!(gateway.ping_period(), Duration::from_secs(54));
        assert_eq!(gateway.write_wait(), Duration::from_secs(10));
        assert_eq!(gateway.max_frame_bytes, 512 * 1024);
        assert_eq!(gateway.outbound_queue_capacity, 256);
        assert_eq!(gateway.identity_source, IdentitySource::Query);
    }

    #[test]
    fn missing_secret_fails_validation() {
        assert!(matches!(
            Config::default().validate(),
            Err(ConfigError::MissingJwtSecret)
        ));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn ping_must_be_shorter_than_pong() {
        let mut config = valid();
        config.gateway.ping_period_secs = 60;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let mut config = valid();
        config.registry.broadcast_capacity = 0;
        match config.validate() {
            Err(ConfigError::Invalid(msg)) => assert!(msg.contains("registry.broadcast_capacity")),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            jwt_secret = "from-file"

            [gateway]
            identity_source = "token"
            connect_cooldown_ms = 250
            "#,
        )
        .expect("toml should parse");

        assert_eq!(config.auth.jwt_secret, "from-file");
        assert_eq!(config.auth.token_ttl_secs, 86_400);
        assert_eq!(config.gateway.identity_source, IdentitySource::Token);
        assert_eq!(config.gateway.connect_cooldown(), Duration::from_millis(250));
        assert_eq!(config.registry.register_capacity, 100);
        assert_eq!(config.database.path, "playzy.db");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = load_config(Some("/definitely/not/here/playzy.toml"))
            .expect("missing file should not be an error");
        assert_eq!(config.server.port, 8080);
    }
}
