//! Layered client configuration.
//!
//! Values are resolved in order: the bundled defaults (`conduit.toml` shipped
//! with this crate), an optional user file, then `CONDUIT_*` environment
//! variables. Every field also has a serde default, so partial files are fine.

use conduit_error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, instrument};

const DEFAULT_CONFIG: &str = include_str!("../conduit.toml");
const ENV_PREFIX: &str = "CONDUIT";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConduitConfig {
    /// REST dispatcher settings
    #[serde(default)]
    pub rest: RestConfig,
    /// Gateway session settings
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl ConduitConfig {
    /// Load defaults, then `./conduit.toml` if present, then the environment.
    ///
    /// # Errors
    ///
    /// Returns error if a source is malformed or the merged values fail validation.
    #[instrument]
    pub fn load() -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::with_name("conduit").required(false))
            .add_source(environment());
        Self::build(builder)
    }

    /// Load defaults, then the given TOML file, then the environment.
    ///
    /// # Errors
    ///
    /// Returns error if the file is missing or malformed, or validation fails.
    #[instrument(skip(path))]
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::from(path.as_ref()).required(true))
            .add_source(environment());
        Self::build(builder)
    }

    /// Load defaults overlaid with a TOML string. The environment is not consulted.
    ///
    /// # Errors
    ///
    /// Returns error if the string is malformed or validation fails.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::from_str(DEFAULT_CONFIG, config::FileFormat::Toml))
            .add_source(config::File::from_str(toml, config::FileFormat::Toml));
        Self::build(builder)
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let settings = builder
            .build()
            .map_err(|e| ConfigError::new(format!("Failed to read configuration: {}", e)))?;
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConfigError::new(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        debug!(
            shard_count = config.gateway.shard_count,
            max_retries = config.rest.max_retries,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rest.global_requests_per_second == 0 {
            return Err(ConfigError::new("rest.global_requests_per_second must be at least 1"));
        }
        if self.gateway.identify_max_concurrency == 0 {
            return Err(ConfigError::new("gateway.identify_max_concurrency must be at least 1"));
        }
        if self.gateway.commands_per_minute == 0 {
            return Err(ConfigError::new("gateway.commands_per_minute must be at least 1"));
        }
        if self.gateway.shard_count > u32::from(u16::MAX) {
            return Err(ConfigError::new(format!(
                "gateway.shard_count {} is out of range",
                self.gateway.shard_count
            )));
        }
        if self.rest.retry_base_delay_ms > self.rest.retry_max_delay_ms {
            return Err(ConfigError::new(
                "rest.retry_base_delay_ms must not exceed rest.retry_max_delay_ms",
            ));
        }
        Ok(())
    }
}

fn environment() -> config::Environment {
    config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// REST dispatcher settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestConfig {
    /// Base URL all route paths are appended to
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// User-Agent header sent with every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Retries for 5xx responses and transport errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff delay for 5xx/transport retries
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling for 5xx/transport retries
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// How many 429 responses a single call may absorb before surfacing
    #[serde(default = "default_max_rate_limit_retries")]
    pub max_rate_limit_retries: u32,
    /// Deadline applied by `Dispatcher::send`
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Gate first-seen routes through the shared Default Bucket
    #[serde(default = "default_true")]
    pub default_bucket_enabled: bool,
    /// Account-wide request budget per second
    #[serde(default = "default_global_requests_per_second")]
    pub global_requests_per_second: u32,
}

impl RestConfig {
    /// Request deadline as a duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// First retry backoff as a duration.
    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    /// Retry backoff ceiling as a duration.
    pub fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            user_agent: default_user_agent(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_rate_limit_retries: default_max_rate_limit_retries(),
            request_timeout_ms: default_request_timeout_ms(),
            default_bucket_enabled: true,
            global_requests_per_second: default_global_requests_per_second(),
        }
    }
}

/// Transport compression negotiated on the gateway URL.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Compression {
    /// Plain JSON text frames
    None,
    /// One zlib inflate context for the whole connection
    #[default]
    ZlibStream,
}

/// Gateway session settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Gateway base URL (used until READY supplies a resume URL)
    #[serde(default = "default_gateway_url")]
    pub url: String,
    /// Gateway protocol version
    #[serde(default = "default_api_version")]
    pub api_version: u8,
    /// Transport compression
    #[serde(default)]
    pub compression: Compression,
    /// Number of shards; 0 asks the server for its recommendation
    #[serde(default = "default_shard_count")]
    pub shard_count: u32,
    /// Missed heartbeat acks tolerated before the connection is declared dead
    #[serde(default = "default_heartbeat_miss_tolerance")]
    pub heartbeat_miss_tolerance: u32,
    /// Delay the first heartbeat by a random fraction of the interval
    #[serde(default = "default_true")]
    pub heartbeat_jitter: bool,
    /// Deadline for `connect` to reach READY/RESUMED
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// How long to wait for Hello after the socket opens
    #[serde(default = "default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,
    /// Spacing between identifies across all shards
    #[serde(default = "default_identify_interval_ms")]
    pub identify_interval_ms: u64,
    /// Identifies allowed per interval
    #[serde(default = "default_identify_max_concurrency")]
    pub identify_max_concurrency: u32,
    /// First reconnect backoff delay
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    /// Reconnect backoff ceiling
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Member count above which guilds are sent without offline members
    #[serde(default = "default_large_threshold")]
    pub large_threshold: u32,
    /// Outbound user commands allowed per minute per connection
    #[serde(default = "default_commands_per_minute")]
    pub commands_per_minute: u32,
    /// Identify again automatically after an unresumable invalid session
    #[serde(default)]
    pub reidentify_on_invalid_session: bool,
    /// Pause before acting on an invalid session
    #[serde(default = "default_invalid_session_delay_ms")]
    pub invalid_session_delay_ms: u64,
}

impl GatewayConfig {
    /// Build the connection URL with version, encoding and compression query.
    ///
    /// `base` overrides the configured URL (used for resume URLs).
    pub fn connection_url(&self, base: Option<&str>) -> String {
        let base = base.unwrap_or(&self.url).trim_end_matches('/');
        let mut url = format!("{}/?v={}&encoding=json", base, self.api_version);
        if self.compression == Compression::ZlibStream {
            url.push_str("&compress=zlib-stream");
        }
        url
    }

    /// Connect deadline as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Hello deadline as a duration.
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    /// Identify spacing as a duration.
    pub fn identify_interval(&self) -> Duration {
        Duration::from_millis(self.identify_interval_ms)
    }

    /// First reconnect delay as a duration.
    pub fn reconnect_base_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_base_delay_ms)
    }

    /// Reconnect ceiling as a duration.
    pub fn reconnect_max_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_max_delay_ms)
    }

    /// Invalid-session pause as a duration.
    pub fn invalid_session_delay(&self) -> Duration {
        Duration::from_millis(self.invalid_session_delay_ms)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            api_version: default_api_version(),
            compression: Compression::default(),
            shard_count: default_shard_count(),
            heartbeat_miss_tolerance: default_heartbeat_miss_tolerance(),
            heartbeat_jitter: true,
            connect_timeout_ms: default_connect_timeout_ms(),
            hello_timeout_ms: default_hello_timeout_ms(),
            identify_interval_ms: default_identify_interval_ms(),
            identify_max_concurrency: default_identify_max_concurrency(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            large_threshold: default_large_threshold(),
            commands_per_minute: default_commands_per_minute(),
            reidentify_on_invalid_session: false,
            invalid_session_delay_ms: default_invalid_session_delay_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_api_base() -> String {
    "https://discord.com/api/v10".to_string()
}

fn default_user_agent() -> String {
    format!(
        "DiscordBot (https://github.com/crumplecup/conduit, {})",
        env!("CARGO_PKG_VERSION")
    )
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    30_000
}

fn default_max_rate_limit_retries() -> u32 {
    5
}

fn default_request_timeout_ms() -> u64 {
    15_000
}

fn default_global_requests_per_second() -> u32 {
    50
}

fn default_gateway_url() -> String {
    "wss://gateway.discord.gg".to_string()
}

fn default_api_version() -> u8 {
    10
}

fn default_shard_count() -> u32 {
    1
}

fn default_heartbeat_miss_tolerance() -> u32 {
    1
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_hello_timeout_ms() -> u64 {
    20_000
}

fn default_identify_interval_ms() -> u64 {
    5_000
}

fn default_identify_max_concurrency() -> u32 {
    1
}

fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_large_threshold() -> u32 {
    50
}

fn default_commands_per_minute() -> u32 {
    110
}

fn default_invalid_session_delay_ms() -> u64 {
    1_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_bundled_defaults_match_serde_defaults() {
        let config = ConduitConfig::from_toml_str("").expect("defaults parse");
        assert_eq!(config.rest.max_retries, 3);
        assert_eq!(config.rest.max_rate_limit_retries, 5);
        assert!(config.rest.default_bucket_enabled);
        assert_eq!(config.gateway.heartbeat_miss_tolerance, 1);
        assert_eq!(config.gateway.compression, Compression::ZlibStream);
        assert_eq!(config.gateway, GatewayConfig::default());
    }

    #[test]
    fn test_overlay_overrides_selected_fields() {
        let config = ConduitConfig::from_toml_str(
            r#"
            [rest]
            max_retries = 7
            default_bucket_enabled = false

            [gateway]
            shard_count = 4
            compression = "none"
            "#,
        )
        .expect("overlay parses");

        assert_eq!(config.rest.max_retries, 7);
        assert!(!config.rest.default_bucket_enabled);
        assert_eq!(config.rest.request_timeout(), Duration::from_secs(15));
        assert_eq!(config.gateway.shard_count, 4);
        assert_eq!(config.gateway.compression, Compression::None);
    }

    #[test]
    fn test_from_file_reads_toml() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(file, "[gateway]\nidentify_interval_ms = 250").expect("write");

        let config = ConduitConfig::from_file(file.path()).expect("file parses");
        assert_eq!(config.gateway.identify_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation_rejects_zero_global_budget() {
        let err = ConduitConfig::from_toml_str("[rest]\nglobal_requests_per_second = 0")
            .expect_err("zero budget is invalid");
        assert!(err.message.contains("global_requests_per_second"));
    }

    #[test]
    fn test_connection_url_includes_compression() {
        let mut gateway = GatewayConfig::default();
        assert_eq!(
            gateway.connection_url(None),
            "wss://gateway.discord.gg/?v=10&encoding=json&compress=zlib-stream"
        );

        gateway.compression = Compression::None;
        assert_eq!(
            gateway.connection_url(Some("wss://resume.example/")),
            "wss://resume.example/?v=10&encoding=json"
        );
    }
}
