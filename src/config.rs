//! Configuration management for moneystream
//!
//! Configuration can be built in code, read from a `.json` / `.yaml` file or
//! taken from `MONEYSTREAM_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use crate::asset::AssetDetails;
use crate::retry::RetryPolicy;
use crate::{Result, StreamError};

/// Environment variable prefix
pub const ENV_PREFIX: &str = "MONEYSTREAM_";

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

/// Settings fixed at connection construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Asset the local side pays in
    pub source_asset: AssetDetails,
    /// Asset the peer receives
    pub destination_asset: AssetDetails,
    /// Policy for retriable signer failures
    pub retry: RetryPolicy,
    /// Upper bound for a single signer call, `None` waits indefinitely
    pub signer_timeout_ms: Option<u64>,
    /// Consecutive link establishment attempts before the connection is destroyed
    pub max_link_attempts: usize,
    /// Capacity of the connection and stream event channels
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            source_asset: AssetDetails::default(),
            destination_asset: AssetDetails::default(),
            retry: RetryPolicy::default(),
            signer_timeout_ms: Some(30_000),
            max_link_attempts: 3,
            event_buffer: 64,
        }
    }
}

impl ConnectionConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.source_asset.is_valid() {
            return Err(StreamError::configuration(format!(
                "invalid source asset: {}",
                self.source_asset
            )));
        }
        if !self.destination_asset.is_valid() {
            return Err(StreamError::configuration(format!(
                "invalid destination asset: {}",
                self.destination_asset
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(StreamError::configuration("retry.max_attempts must be at least 1"));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(StreamError::configuration("retry.backoff_multiplier must be >= 1.0"));
        }
        if self.max_link_attempts == 0 {
            return Err(StreamError::configuration("max_link_attempts must be at least 1"));
        }
        if self.event_buffer == 0 {
            return Err(StreamError::configuration("event_buffer must be at least 1"));
        }
        if self.signer_timeout_ms == Some(0) {
            return Err(StreamError::configuration("signer_timeout_ms must be positive"));
        }
        Ok(())
    }
}

/// Logging output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(StreamError::configuration(format!("unknown log format: {}", other))),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;

        let config: Config = match path.extension().and_then(|s| s.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => {
                return Err(StreamError::configuration(
                    "Unsupported config file format. Use .yaml or .json",
                ))
            }
        };
        config.connection.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, defaults fill the gaps
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(&format!("{}{}", ENV_PREFIX, name));
        let mut config = Config::default();
        let connection = &mut config.connection;

        if let Some(code) = var("SOURCE_ASSET_CODE") {
            connection.source_asset.code = code;
        }
        if let Some(scale) = var("SOURCE_ASSET_SCALE") {
            connection.source_asset.scale = parse_var("SOURCE_ASSET_SCALE", &scale)?;
        }
        if let Some(code) = var("DESTINATION_ASSET_CODE") {
            connection.destination_asset.code = code;
        }
        if let Some(scale) = var("DESTINATION_ASSET_SCALE") {
            connection.destination_asset.scale = parse_var("DESTINATION_ASSET_SCALE", &scale)?;
        }
        if let Some(timeout) = var("SIGNER_TIMEOUT_MS") {
            let timeout: u64 = parse_var("SIGNER_TIMEOUT_MS", &timeout)?;
            // 0 disables the timeout
            connection.signer_timeout_ms = (timeout > 0).then_some(timeout);
        }
        if let Some(attempts) = var("MAX_LINK_ATTEMPTS") {
            connection.max_link_attempts = parse_var("MAX_LINK_ATTEMPTS", &attempts)?;
        }
        if let Some(buffer) = var("EVENT_BUFFER") {
            connection.event_buffer = parse_var("EVENT_BUFFER", &buffer)?;
        }
        if let Some(attempts) = var("RETRY_MAX_ATTEMPTS") {
            connection.retry.max_attempts = parse_var("RETRY_MAX_ATTEMPTS", &attempts)?;
        }
        if let Some(delay) = var("RETRY_INITIAL_DELAY_MS") {
            connection.retry.initial_delay_ms = parse_var("RETRY_INITIAL_DELAY_MS", &delay)?;
        }
        if let Some(delay) = var("RETRY_MAX_DELAY_MS") {
            connection.retry.max_delay_ms = parse_var("RETRY_MAX_DELAY_MS", &delay)?;
        }
        if let Some(jitter) = var("RETRY_JITTER") {
            connection.retry.jitter = parse_var("RETRY_JITTER", &jitter)?;
        }

        if let Some(level) = var("LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = var("LOG_FORMAT") {
            config.logging.format = format.parse()?;
        }

        config.connection.validate()?;
        Ok(config)
    }
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        StreamError::configuration(format!("{}{} has invalid value '{}'", ENV_PREFIX, name, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.connection.validate().is_ok());
        assert_eq!(config.connection.source_asset.code, "BSV");
        assert_eq!(config.connection.destination_asset.scale, 8);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("MONEYSTREAM_SOURCE_ASSET_CODE", "USD"),
            ("MONEYSTREAM_SOURCE_ASSET_SCALE", "2"),
            ("MONEYSTREAM_SIGNER_TIMEOUT_MS", "0"),
            ("MONEYSTREAM_RETRY_MAX_ATTEMPTS", "5"),
            ("MONEYSTREAM_RETRY_JITTER", "false"),
            ("MONEYSTREAM_LOG_FORMAT", "json"),
        ]))
        .unwrap();

        assert_eq!(config.connection.source_asset, AssetDetails::new("USD", 2));
        assert_eq!(config.connection.signer_timeout_ms, None);
        assert_eq!(config.connection.retry.max_attempts, 5);
        assert!(!config.connection.retry.jitter);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_from_lookup_rejects_bad_values() {
        let err = Config::from_lookup(lookup(&[("MONEYSTREAM_MAX_LINK_ATTEMPTS", "many")]))
            .unwrap_err();
        assert!(matches!(err, StreamError::Configuration(_)));

        let err = Config::from_lookup(lookup(&[("MONEYSTREAM_DESTINATION_ASSET_SCALE", "40")]))
            .unwrap_err();
        assert!(matches!(err, StreamError::Configuration(_)));
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = std::env::temp_dir().join(format!("moneystream-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("config.yaml");
        std::fs::write(
            &path,
            "connection:\n  source_asset:\n    code: XRP\n    scale: 6\n  max_link_attempts: 7\nlogging:\n  level: debug\n",
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.connection.source_asset, AssetDetails::new("XRP", 6));
        assert_eq!(config.connection.max_link_attempts, 7);
        assert_eq!(config.connection.event_buffer, 64);
        assert_eq!(config.logging.level, "debug");

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        let path = std::env::temp_dir().join(format!("moneystream-{}.ini", uuid::Uuid::new_v4()));
        std::fs::write(&path, "level = debug\n").unwrap();

        let err = Config::from_file(&path).unwrap_err();
        assert!(matches!(err, StreamError::Configuration(_)));

        std::fs::remove_file(&path).unwrap();
        assert!(matches!(Config::from_file(&path).unwrap_err(), StreamError::Io(_)));
    }
}
