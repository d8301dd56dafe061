use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the callbacks service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
    /// Database configuration
    pub database: DatabaseConfig,
    /// Callback signature configuration
    #[serde(default)]
    pub signature: SignatureConfig,
    /// Object key grammar configuration
    #[serde(default)]
    pub uploads: UploadsConfig,
    /// Event bus configuration
    #[serde(default)]
    pub events: EventsConfig,
    /// Kafka publisher for object uploaded events
    #[serde(default)]
    pub kafka: KafkaConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// HTTP API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default)]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default)]
    pub run_migrations: bool,
}

/// Shared secrets used to sign callbacks.
///
/// Several secrets may be active at once so that the calling pipeline can
/// rotate its secret without downtime.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SignatureConfig {
    #[serde(default)]
    pub shared_secrets: Vec<String>,
}

/// Object key grammar configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadsConfig {
    /// Timed text track modes allowed in object key suffixes
    #[serde(default = "default_track_modes")]
    pub track_modes: Vec<String>,
}

/// Event bus configuration
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    /// Capacity of the channel between request handlers and the dispatcher
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// How long the dispatcher may take to drain on shutdown, in seconds
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

/// Kafka producer configuration.
///
/// The Kafka subscriber is only attached when `bootstrap_servers` is set.
#[derive(Debug, Clone, Deserialize)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers
    pub bootstrap_servers: Option<String>,
    /// Topic receiving object uploaded events
    #[serde(default = "default_uploaded_topic")]
    pub uploaded_topic: String,
    /// Client ID reported to the brokers
    #[serde(default = "default_service_name")]
    pub client_id: String,
    /// Enable SSL
    #[serde(default)]
    pub ssl_enabled: bool,
    /// SSL CA certificate path
    pub ssl_ca_location: Option<String>,
    /// SASL username
    pub sasl_username: Option<String>,
    /// SASL password
    pub sasl_password: Option<String>,
    /// Delivery timeout in milliseconds
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,
}

// Default value functions
fn default_service_name() -> String {
    "marsha-callbacks".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_track_modes() -> Vec<String> {
    // subtitles, transcript, closed captions
    vec!["st".to_string(), "ts".to_string(), "cc".to_string()]
}

fn default_channel_capacity() -> usize {
    1024
}

fn default_drain_timeout_secs() -> u64 {
    5
}

fn default_uploaded_topic() -> String {
    "marsha.uploads.completed".to_string()
}

fn default_message_timeout_ms() -> u64 {
    5000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Add config file if present
            .add_source(config::File::with_name("config/callbacks").required(false))
            .add_source(config::File::with_name("/etc/marsha/callbacks").required(false))
            // Override with environment variables
            // CALLBACKS__DATABASE__URL -> database.url
            // CALLBACKS__SIGNATURE__SHARED_SECRETS=old,new -> signature.shared_secrets
            .add_source(
                config::Environment::with_prefix("CALLBACKS")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("signature.shared_secrets")
                    .with_list_parse_key("uploads.track_modes")
                    .with_list_parse_key("api.cors_origins"),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the dispatcher drain timeout as Duration
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.events.drain_timeout_secs)
    }
}

impl KafkaConfig {
    /// Get delivery timeout as Duration
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: false,
            cors_origins: Vec::new(),
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            track_modes: default_track_modes(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: None,
            uploaded_topic: default_uploaded_topic(),
            client_id: default_service_name(),
            ssl_enabled: false,
            ssl_ca_location: None,
            sasl_username: None,
            sasl_password: None,
            message_timeout_ms: default_message_timeout_ms(),
        }
    }
}
