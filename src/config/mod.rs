//! Configuration Module
//!
//! Provides TOML-based configuration for the session engine with support for:
//! - Session parameters (keep alive, expiry)
//! - Flow control and size limits
//! - MQTT feature flags
//! - Persistence
//! - Environment variable overrides (VIBEMQ_SESSION__* prefix)

use std::path::Path;
use std::time::Duration;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::broker::{BrokerConfig, OversizedDelivery};
use crate::protocol::{QoS, MAX_VARIABLE_INT};

pub use persistence::{BackendType, PersistenceConfig};

mod persistence;

/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> Result<String, ConfigError> {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    Ok(re
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            std::env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .to_string())
}


/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// TOML parsing error
    Parse(toml::de::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// Session configuration
    pub session: SessionConfig,
    /// Flow control and size limits
    pub limits: LimitsConfig,
    /// MQTT feature configuration
    pub mqtt: MqttConfig,
    /// Persistence configuration
    pub persistence: PersistenceConfig,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Maximum keep alive in seconds; longer requests are clamped
    #[serde(default = "default_max_keep_alive")]
    pub max_keep_alive: u16,
    /// Session expiry reaper period (e.g., "1s")
    #[serde(default = "default_expiry_check_interval", with = "humantime_serde")]
    pub expiry_check_interval: Duration,
    /// Cap on the session expiry interval in seconds (0 = no cap)
    #[serde(default)]
    pub max_session_expiry: u32,
    /// Time allowed for CONNECT after the link opens
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,
}

fn default_max_keep_alive() -> u16 {
    60
}
fn default_expiry_check_interval() -> Duration {
    Duration::from_secs(1)
}
fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_keep_alive: default_max_keep_alive(),
            expiry_check_interval: default_expiry_check_interval(),
            max_session_expiry: 0,
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Flow control and size limits
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Receive maximum announced to clients (inbound QoS 2 window)
    #[serde(default = "default_receive_maximum")]
    pub receive_maximum: u16,
    /// Maximum packet size in bytes
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: u32,
    /// Maximum topic alias accepted from clients
    #[serde(default = "default_max_topic_alias")]
    pub max_topic_alias: u16,
    /// Maximum queued messages per session (oldest dropped)
    #[serde(default = "default_max_queued_messages")]
    pub max_queued_messages: usize,
    /// Retransmission interval for unacknowledged messages ("0s" = on reconnect only)
    #[serde(default, with = "humantime_serde")]
    pub retry_interval: Duration,
}

fn default_receive_maximum() -> u16 {
    65535
}
fn default_max_packet_size() -> u32 {
    MAX_VARIABLE_INT
}
fn default_max_topic_alias() -> u16 {
    65535
}
fn default_max_queued_messages() -> usize {
    1000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            receive_maximum: default_receive_maximum(),
            max_packet_size: default_max_packet_size(),
            max_topic_alias: default_max_topic_alias(),
            max_queued_messages: default_max_queued_messages(),
            retry_interval: Duration::ZERO,
        }
    }
}

/// MQTT feature configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Maximum QoS level (0, 1, or 2)
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
    /// Whether retained messages are available
    #[serde(default = "default_true")]
    pub retain_available: bool,
    /// Whether wildcard subscriptions are available
    #[serde(default = "default_true")]
    pub wildcard_subscriptions: bool,
    /// Whether subscription identifiers are available
    #[serde(default = "default_true")]
    pub subscription_identifiers: bool,
    /// Whether shared subscriptions are available
    #[serde(default = "default_true")]
    pub shared_subscriptions: bool,
    /// Filters refused with "unspecified error"
    #[serde(default)]
    pub disallowed_filters: Vec<String>,
    /// "disconnect" or "discard" for messages above the client's maximum packet size
    #[serde(default)]
    pub oversized_delivery: OversizedDelivery,
}

fn default_max_qos() -> u8 {
    2
}
fn default_true() -> bool {
    true
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            max_qos: default_max_qos(),
            retain_available: true,
            wildcard_subscriptions: true,
            subscription_identifiers: true,
            shared_subscriptions: true,
            disallowed_filters: Vec::new(),
            oversized_delivery: OversizedDelivery::Disconnect,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file with environment variable overrides.
    ///
    /// Supports two forms of environment variable usage:
    /// 1. In-file substitution: `${VAR}` or `${VAR:-default}` syntax in the TOML file
    /// 2. Override via env vars: `VIBEMQ_SESSION__` prefix with double underscores for nesting:
    ///    - `VIBEMQ_SESSION__SESSION__MAX_KEEP_ALIVE=120` overrides `session.max_keep_alive`
    ///    - `VIBEMQ_SESSION__LIMITS__RECEIVE_MAXIMUM=10` overrides `limits.receive_maximum`
    ///    - `VIBEMQ_SESSION__MQTT__RETAIN_AVAILABLE=false` overrides `mqtt.retain_available`
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            // Start with defaults
            .set_default("log.level", "info")?
            .set_default("session.max_keep_alive", 60)?
            .set_default("session.expiry_check_interval", "1s")?
            .set_default("session.max_session_expiry", 0)?
            .set_default("session.connect_timeout", "30s")?
            .set_default("limits.receive_maximum", 65535)?
            .set_default("limits.max_packet_size", i64::from(MAX_VARIABLE_INT))?
            .set_default("limits.max_topic_alias", 65535)?
            .set_default("limits.max_queued_messages", 1000)?
            .set_default("limits.retry_interval", "0s")?
            .set_default("mqtt.max_qos", 2)?
            .set_default("mqtt.retain_available", true)?
            .set_default("mqtt.wildcard_subscriptions", true)?
            .set_default("mqtt.subscription_identifiers", true)?
            .set_default("mqtt.shared_subscriptions", true)?
            .set_default("mqtt.oversized_delivery", "disconnect")?
            .set_default("persistence.enabled", false)?
            .set_default("persistence.backend", "memory")?
            .set_default("persistence.flush_interval", "100ms")?
            .set_default("persistence.max_batch_size", 100)?;

        // Load from file with env var substitution
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => {
                let substituted = substitute_env_vars(&content)?;
                builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // File doesn't exist, use defaults
            }
            Err(e) => return Err(ConfigError::Io(e)),
        }

        // Double underscore separates nested keys, single underscore preserved in field names
        let cfg = builder
            .add_source(
                Environment::with_prefix("VIBEMQ_SESSION")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a string (no env var support)
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.max_qos > 2 {
            return Err(ConfigError::Validation(
                "max_qos must be 0, 1, or 2".to_string(),
            ));
        }
        if self.limits.receive_maximum == 0 {
            return Err(ConfigError::Validation(
                "receive_maximum must be greater than 0".to_string(),
            ));
        }
        if self.limits.max_packet_size == 0 || self.limits.max_packet_size > MAX_VARIABLE_INT {
            return Err(ConfigError::Validation(format!(
                "max_packet_size must be between 1 and {}",
                MAX_VARIABLE_INT
            )));
        }
        if self.session.expiry_check_interval.is_zero() {
            return Err(ConfigError::Validation(
                "expiry_check_interval must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Runtime configuration for [`Broker`](crate::Broker)
    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            max_keep_alive: self.session.max_keep_alive,
            expiry_check_interval: self.session.expiry_check_interval,
            max_session_expiry: self.session.max_session_expiry,
            connect_timeout: self.session.connect_timeout,
            receive_maximum: self.limits.receive_maximum,
            max_packet_size: self.limits.max_packet_size,
            max_topic_alias: self.limits.max_topic_alias,
            max_queued_messages: self.limits.max_queued_messages,
            retry_interval: self.limits.retry_interval,
            max_qos: QoS::from_u8(self.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce),
            retain_available: self.mqtt.retain_available,
            wildcard_subscription_available: self.mqtt.wildcard_subscriptions,
            subscription_identifiers_available: self.mqtt.subscription_identifiers,
            shared_subscriptions_available: self.mqtt.shared_subscriptions,
            disallowed_filters: self.mqtt.disallowed_filters.clone(),
            oversized_delivery: self.mqtt.oversized_delivery,
        }
    }
}
