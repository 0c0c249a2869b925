//! Application configuration loaded from environment variables.
//!
//! All configuration is loaded from environment variables with defaults that
//! work against a local broker on `localhost:1883`. A `.env` file is honoured
//! if present.
//!
//! # Broker
//!
//! - `BROKER_KIND`: `mqtt` (default) or `memory` for an in-process broker
//! - `MQTT_HOST` / `MQTT_PORT`: broker TCP endpoint (default: `localhost:1883`)
//! - `RELAY_TOPIC`: topic used by `/sendMessage` and `/messages`
//! - `CONSUMER_TOPIC`: topic used by `/publish/{message}` and the background consumer
//!
//! # Background Consumer
//!
//! - `CONSUMER_ENABLED`: start the long-lived subscriber (default: true)
//! - `CONSUMER_MAX_ATTEMPTS`: consecutive connect failures before giving up (default: 5)
//! - `CONSUMER_RETRY_DELAY_MS`: delay between attempts (default: 2000)
//! - `CONSUMER_BACKOFF`: `fixed` (default) or `exponential`

use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{AppError, AppResult};
use crate::validation::validate_topic_name;

/// Upper bound for `MAX_MESSAGE_LENGTH`. The worst-case JSON envelope of a
/// message this long still fits in one MQTT packet.
pub const MAX_MESSAGE_LENGTH_LIMIT: usize = 32 * 1024 * 1024;

/// Which broker implementation the gateway talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    /// A real MQTT broker over TCP.
    Mqtt,
    /// The in-process broker, for local development without infrastructure.
    Memory,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mqtt" => Ok(Self::Mqtt),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown broker kind '{other}' (expected mqtt or memory)")),
        }
    }
}

/// How the consumer spaces its reconnection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

impl FromStr for BackoffKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!(
                "unknown backoff '{other}' (expected fixed or exponential)"
            )),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}' (expected pretty or json)")),
        }
    }
}

/// Application configuration loaded from environment variables.
///
/// # Example
///
/// ```rust,ignore
/// let config = Config::from_env()?;
/// println!("Relaying {} via {}", config.relay_topic, config.broker_addr());
/// ```
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    // =========================================================================
    // Broker Configuration
    // =========================================================================
    /// Broker implementation to use
    pub broker_kind: BrokerKind,

    /// MQTT broker host (default: "localhost")
    pub mqtt_host: String,

    /// MQTT broker port (default: 1883)
    pub mqtt_port: u16,

    /// Prefix for generated MQTT client ids; a random suffix is appended per connection
    pub mqtt_client_id_prefix: String,

    /// MQTT keep-alive interval
    pub mqtt_keep_alive: Duration,

    /// Upper bound for the CONNECT/CONNACK handshake
    pub connect_timeout: Duration,

    /// Upper bound for a single publish or subscribe acknowledgement
    pub operation_timeout: Duration,

    // =========================================================================
    // Channels
    // =========================================================================
    /// Topic for the request-scoped relay (`/sendMessage`, `/messages`)
    pub relay_topic: String,

    /// Topic for the publisher variant and the background consumer
    pub consumer_topic: String,

    /// Source tag stamped on messages published by `/sendMessage`
    pub message_source: String,

    /// Source tag stamped on messages published by `/publish/{message}`
    pub publisher_source: String,

    /// Maximum message text length in bytes
    pub max_message_length: usize,

    /// Interval between SSE keep-alive comments on idle streams
    pub sse_keep_alive: Duration,

    // =========================================================================
    // Background Consumer
    // =========================================================================
    /// Whether the long-lived subscriber is started at all
    pub consumer_enabled: bool,

    /// Consecutive failed connects before the consumer gives up for good
    pub consumer_max_attempts: u32,

    /// Delay between attempts (base delay for exponential backoff)
    pub consumer_retry_delay: Duration,

    /// Backoff shape
    pub consumer_backoff: BackoffKind,

    /// Cap for exponential backoff
    pub consumer_retry_max_delay: Duration,

    /// Maximum buffered entries (0 = unbounded); oldest entries are dropped first
    pub consumer_buffer_capacity: usize,

    // =========================================================================
    // HTTP Limits & Security
    // =========================================================================
    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    /// Allowed CORS origins; "*" allows all
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Log level (e.g., "info", "debug", "trace")
    pub log_level: String,

    /// Log output format
    pub log_format: LogFormat,

    /// Port for Prometheus metrics endpoint (default: 9090, 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if a value cannot be parsed or the
    /// resulting configuration is inconsistent.
    pub fn from_env() -> AppResult<Self> {
        let _ = dotenvy::dotenv();

        let config = Self {
            // Server
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: Self::parse_env("PORT", 3000)?,

            // Broker
            broker_kind: Self::parse_env("BROKER_KIND", BrokerKind::Mqtt)?,
            mqtt_host: env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            mqtt_port: Self::parse_env("MQTT_PORT", 1883)?,
            mqtt_client_id_prefix: env::var("MQTT_CLIENT_ID_PREFIX")
                .unwrap_or_else(|_| "mqtt-relay".to_string()),
            mqtt_keep_alive: Duration::from_secs(Self::parse_env("MQTT_KEEP_ALIVE_SECS", 30)?),
            connect_timeout: Duration::from_secs(Self::parse_env(
                "MQTT_CONNECT_TIMEOUT_SECS",
                10,
            )?),
            operation_timeout: Duration::from_secs(Self::parse_env("OPERATION_TIMEOUT_SECS", 10)?),

            // Channels
            relay_topic: env::var("RELAY_TOPIC").unwrap_or_else(|_| "demo/messages".to_string()),
            consumer_topic: env::var("CONSUMER_TOPIC")
                .unwrap_or_else(|_| "aspire/demo/messages".to_string()),
            message_source: env::var("MESSAGE_SOURCE")
                .unwrap_or_else(|_| "mqtt-relay".to_string()),
            publisher_source: env::var("PUBLISHER_SOURCE")
                .unwrap_or_else(|_| "MqttPublisher".to_string()),
            max_message_length: Self::parse_env("MAX_MESSAGE_LENGTH", 64 * 1024)?,
            sse_keep_alive: Duration::from_secs(Self::parse_env("SSE_KEEP_ALIVE_SECS", 15)?),

            // Background consumer
            consumer_enabled: Self::parse_env("CONSUMER_ENABLED", true)?,
            consumer_max_attempts: Self::parse_env("CONSUMER_MAX_ATTEMPTS", 5)?,
            consumer_retry_delay: Duration::from_millis(Self::parse_env(
                "CONSUMER_RETRY_DELAY_MS",
                2000,
            )?),
            consumer_backoff: Self::parse_env("CONSUMER_BACKOFF", BackoffKind::Fixed)?,
            consumer_retry_max_delay: Duration::from_millis(Self::parse_env(
                "CONSUMER_RETRY_MAX_DELAY_MS",
                30000,
            )?),
            consumer_buffer_capacity: Self::parse_env("CONSUMER_BUFFER_CAPACITY", 0)?,

            // HTTP limits
            max_request_body_size: Self::parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,
            cors_allowed_origins: Self::parse_cors_origins(),

            // Observability
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            log_format: Self::parse_env("LOG_FORMAT", LogFormat::Pretty)?,
            metrics_port: Self::parse_env("METRICS_PORT", 9090)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ConfigError` if validation fails.
    pub fn validate(&self) -> AppResult<()> {
        validate_topic_name(&self.relay_topic)
            .map_err(|e| AppError::ConfigError(format!("RELAY_TOPIC: {e}")))?;
        validate_topic_name(&self.consumer_topic)
            .map_err(|e| AppError::ConfigError(format!("CONSUMER_TOPIC: {e}")))?;

        if self.mqtt_host.trim().is_empty() {
            return Err(AppError::ConfigError("MQTT_HOST must not be empty".to_string()));
        }

        if self.mqtt_client_id_prefix.starts_with(' ') {
            return Err(AppError::ConfigError(
                "MQTT_CLIENT_ID_PREFIX must not start with a space".to_string(),
            ));
        }

        if self.mqtt_keep_alive < Duration::from_secs(1) {
            return Err(AppError::ConfigError(
                "MQTT_KEEP_ALIVE_SECS must be at least 1".to_string(),
            ));
        }

        if self.consumer_max_attempts == 0 {
            return Err(AppError::ConfigError(
                "CONSUMER_MAX_ATTEMPTS must be greater than 0".to_string(),
            ));
        }

        if self.consumer_backoff == BackoffKind::Exponential
            && self.consumer_retry_delay > self.consumer_retry_max_delay
        {
            return Err(AppError::ConfigError(format!(
                "CONSUMER_RETRY_DELAY_MS ({:?}) must be <= CONSUMER_RETRY_MAX_DELAY_MS ({:?})",
                self.consumer_retry_delay, self.consumer_retry_max_delay
            )));
        }

        if self.max_message_length == 0 {
            return Err(AppError::ConfigError(
                "MAX_MESSAGE_LENGTH must be greater than 0".to_string(),
            ));
        }

        if self.max_message_length > MAX_MESSAGE_LENGTH_LIMIT {
            return Err(AppError::ConfigError(format!(
                "MAX_MESSAGE_LENGTH must be at most {MAX_MESSAGE_LENGTH_LIMIT}"
            )));
        }

        if self.max_request_body_size == 0 {
            return Err(AppError::ConfigError(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.sse_keep_alive.is_zero() {
            return Err(AppError::ConfigError(
                "SSE_KEEP_ALIVE_SECS must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Broker endpoint as `host:port`, for logging.
    pub fn broker_addr(&self) -> String {
        format!("{}:{}", self.mqtt_host, self.mqtt_port)
    }

    /// Check if Prometheus metrics export is enabled.
    pub fn metrics_enabled(&self) -> bool {
        self.metrics_port > 0
    }

    /// Get the metrics endpoint address, or `None` if metrics are disabled.
    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        self.metrics_enabled()
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }

    /// Parse an environment variable into the specified type with a default value.
    fn parse_env<T>(name: &str, default: T) -> AppResult<T>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match env::var(name) {
            Ok(val) => val
                .trim()
                .parse()
                .map_err(|e| AppError::ConfigError(format!("Invalid {name}: {e}"))),
            Err(_) => Ok(default),
        }
    }

    /// Parse CORS allowed origins from environment variable.
    fn parse_cors_origins() -> Vec<String> {
        env::var("CORS_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

/// Default configuration for testing and development.
///
/// Production deployments should use `Config::from_env()` instead.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            broker_kind: BrokerKind::Mqtt,
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_client_id_prefix: "mqtt-relay".to_string(),
            mqtt_keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            operation_timeout: Duration::from_secs(10),
            relay_topic: "demo/messages".to_string(),
            consumer_topic: "aspire/demo/messages".to_string(),
            message_source: "mqtt-relay".to_string(),
            publisher_source: "MqttPublisher".to_string(),
            max_message_length: 64 * 1024,
            sse_keep_alive: Duration::from_secs(15),
            consumer_enabled: true,
            consumer_max_attempts: 5,
            consumer_retry_delay: Duration::from_secs(2),
            consumer_backoff: BackoffKind::Fixed,
            consumer_retry_max_delay: Duration::from_secs(30),
            consumer_buffer_capacity: 0,
            max_request_body_size: 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_port: 9090,
        }
    }
}
