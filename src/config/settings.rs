//! Application settings and configuration

use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;

use crate::error::{ErrorCategory, ErrorClassification};

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Database configuration
    pub database: DatabaseSettings,
    /// MQTT broker configuration
    pub mqtt: MqttSettings,
    /// Index / option universe configuration
    pub app: AppSettings,
    /// Batch writer configuration
    #[serde(default)]
    pub batch: BatchSettings,
    /// Option token lookup service
    #[serde(default)]
    pub token_service: TokenServiceSettings,
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    2
}

/// MQTT broker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttSettings {
    /// Broker host
    pub host: String,
    /// Broker port
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Client identifier; a random one is generated when absent
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Keep-alive interval in seconds
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    /// Capacity of the inbound message channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_keep_alive() -> u64 {
    30
}

fn default_channel_capacity() -> usize {
    10_000
}

/// Index and option universe settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSettings {
    /// Topic prefix of the index family (`<prefix>/<INDEX>`)
    #[serde(default = "default_index_prefix")]
    pub index_prefix: String,
    /// Topic prefix of the derivative family (`<prefix><token>`)
    #[serde(default = "default_option_topic_prefix")]
    pub option_topic_prefix: String,
    /// Indices to track
    #[serde(default = "default_indices")]
    pub indices: Vec<String>,
    /// Strike increment per index
    #[serde(default = "default_strike_increments")]
    pub strike_increments: HashMap<String, Decimal>,
    /// Option expiry date per index (as expected by the token service)
    #[serde(default)]
    pub expiry_dates: HashMap<String, String>,
    /// Half-width of the strike window around the ATM strike
    #[serde(default = "default_strike_range")]
    pub strike_range: u32,
}

fn default_index_prefix() -> String {
    "index".to_string()
}

fn default_option_topic_prefix() -> String {
    "NSE_FO|".to_string()
}

fn default_indices() -> Vec<String> {
    vec![
        "NIFTY".to_string(),
        "BANKNIFTY".to_string(),
        "FINNIFTY".to_string(),
        "MIDCPNIFTY".to_string(),
    ]
}

fn default_strike_increments() -> HashMap<String, Decimal> {
    HashMap::from([
        ("NIFTY".to_string(), Decimal::from(50)),
        ("BANKNIFTY".to_string(), Decimal::from(100)),
        ("FINNIFTY".to_string(), Decimal::from(50)),
        ("MIDCPNIFTY".to_string(), Decimal::from(25)),
    ])
}

fn default_strike_range() -> u32 {
    5
}

impl AppSettings {
    /// Strike increment configured for an index
    pub fn strike_increment(&self, index: &str) -> Option<Decimal> {
        per_index(&self.strike_increments, index).copied()
    }

    /// Expiry date configured for an index
    pub fn expiry_date(&self, index: &str) -> Option<&str> {
        per_index(&self.expiry_dates, index).map(String::as_str)
    }

    /// Topic carrying the price of an index
    pub fn index_topic(&self, index: &str) -> String {
        format!("{}/{}", self.index_prefix, index)
    }

    /// Topic carrying the price of an option identified by its token
    pub fn option_topic(&self, token: &str) -> String {
        format!("{}{}", self.option_topic_prefix, token)
    }

    pub fn is_tracked_index(&self, index: &str) -> bool {
        self.indices.iter().any(|i| i == index)
    }
}

// Table keys may come back lowercased from the config sources
fn per_index<'a, V>(map: &'a HashMap<String, V>, index: &str) -> Option<&'a V> {
    map.get(index).or_else(|| {
        map.iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(index))
            .map(|(_, value)| value)
    })
}

/// Batch writer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// Number of buffered readings that triggers an immediate flush
    #[serde(default = "default_batch_size")]
    pub size: usize,
    /// Maximum time a reading waits in the buffer, in milliseconds
    #[serde(default = "default_batch_interval")]
    pub interval_ms: u64,
    /// Attempts per flush transaction (1 = no retry)
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    /// Delay between transaction attempts, in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
    /// Total digits of the stored value column; scale is fixed at 2
    #[serde(default = "default_value_precision")]
    pub value_precision: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_batch_interval() -> u64 {
    5000
}

fn default_max_retry_attempts() -> u32 {
    1
}

fn default_retry_delay() -> u64 {
    500
}

fn default_value_precision() -> u32 {
    10
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            size: default_batch_size(),
            interval_ms: default_batch_interval(),
            max_retry_attempts: default_max_retry_attempts(),
            retry_delay_ms: default_retry_delay(),
            value_precision: default_value_precision(),
        }
    }
}

impl BatchSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Option token lookup service settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenServiceSettings {
    /// Base URL; requests go to `<base_url>/token`
    #[serde(default = "default_token_base_url")]
    pub base_url: String,
    /// Per-request timeout in milliseconds
    #[serde(default = "default_token_timeout")]
    pub timeout_ms: u64,
}

fn default_token_base_url() -> String {
    "https://api.trado.trade".to_string()
}

fn default_token_timeout() -> u64 {
    5000
}

impl Default for TokenServiceSettings {
    fn default() -> Self {
        Self {
            base_url: default_token_base_url(),
            timeout_ms: default_token_timeout(),
        }
    }
}

impl TokenServiceSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Semantic problems in otherwise well-formed settings
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SettingsError {
    #[error("No indices configured")]
    NoIndices,

    #[error("Index {0} has no strike increment")]
    MissingStrikeIncrement(String),

    #[error("Index {0} has a non-positive strike increment")]
    InvalidStrikeIncrement(String),

    #[error("Index {0} has no expiry date")]
    MissingExpiryDate(String),

    #[error("Invalid batch settings: {0}")]
    InvalidBatch(String),
}

impl ErrorClassification for SettingsError {
    fn category(&self) -> ErrorCategory {
        ErrorCategory::Configuration
    }
}

impl Settings {
    /// Load settings from configuration files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_prefix("LTP_INGEST")
    }

    /// Load settings with a custom environment variable prefix
    pub fn load_with_prefix(env_prefix: &str) -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());
        let config_dir = Self::config_dir();

        let mut builder = Config::builder()
            .add_source(File::with_name(&format!("{}/default", config_dir)).required(false))
            .add_source(File::with_name(&format!("{}/{}", config_dir, run_mode)).required(false))
            .add_source(File::with_name(&format!("{}/local", config_dir)).required(false))
            // e.g. LTP_INGEST__DATABASE__URL
            .add_source(
                Environment::with_prefix(env_prefix)
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", database_url)?;
        }

        builder.build()?.try_deserialize()
    }

    /// Load settings from a single explicit file plus environment overrides
    pub fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .add_source(File::with_name(path).required(true))
            .add_source(
                Environment::with_prefix("LTP_INGEST")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(database_url) = std::env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", database_url)?;
        }

        builder.build()?.try_deserialize()
    }

    fn config_dir() -> String {
        std::env::var("LTP_INGEST_CONFIG_DIR").unwrap_or_else(|_| "config".into())
    }

    /// Check cross-field consistency that serde cannot express
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.app.indices.is_empty() {
            return Err(SettingsError::NoIndices);
        }

        for index in &self.app.indices {
            match self.app.strike_increment(index) {
                None => return Err(SettingsError::MissingStrikeIncrement(index.clone())),
                Some(inc) if inc <= Decimal::ZERO => {
                    return Err(SettingsError::InvalidStrikeIncrement(index.clone()))
                }
                Some(_) => {}
            }
            if self.app.expiry_date(index).is_none() {
                return Err(SettingsError::MissingExpiryDate(index.clone()));
            }
        }

        if self.batch.size == 0 {
            return Err(SettingsError::InvalidBatch("size must be > 0".into()));
        }
        if self.batch.interval_ms == 0 {
            return Err(SettingsError::InvalidBatch("interval_ms must be > 0".into()));
        }
        if self.batch.max_retry_attempts == 0 {
            return Err(SettingsError::InvalidBatch(
                "max_retry_attempts must be >= 1".into(),
            ));
        }
        if !(3..=28).contains(&self.batch.value_precision) {
            return Err(SettingsError::InvalidBatch(
                "value_precision must be between 3 and 28".into(),
            ));
        }

        Ok(())
    }

    /// Create default settings (useful for testing)
    pub fn default_settings() -> Self {
        Settings {
            database: DatabaseSettings {
                url: std::env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "postgresql://localhost/ltp_ingest".into()),
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
            },
            mqtt: MqttSettings {
                host: "localhost".to_string(),
                port: default_mqtt_port(),
                client_id: None,
                username: None,
                password: None,
                keep_alive_secs: default_keep_alive(),
                channel_capacity: default_channel_capacity(),
            },
            app: AppSettings {
                index_prefix: default_index_prefix(),
                option_topic_prefix: default_option_topic_prefix(),
                indices: default_indices(),
                strike_increments: default_strike_increments(),
                expiry_dates: HashMap::new(),
                strike_range: default_strike_range(),
            },
            batch: BatchSettings::default(),
            token_service: TokenServiceSettings::default(),
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self::default_settings()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_expiries(mut settings: Settings) -> Settings {
        for index in settings.app.indices.clone() {
            settings
                .app
                .expiry_dates
                .insert(index, "2025-05-29".to_string());
        }
        settings
    }

    #[test]
    fn test_default_settings() {
        let settings = Settings::default_settings();
        assert_eq!(settings.database.max_connections, 10);
        assert_eq!(settings.batch.size, 100);
        assert_eq!(settings.batch.interval(), Duration::from_secs(5));
        assert_eq!(settings.app.strike_range, 5);
        assert_eq!(
            settings.app.strike_increment("BANKNIFTY"),
            Some(Decimal::from(100))
        );
    }

    #[test]
    fn test_topics() {
        let app = Settings::default_settings().app;
        assert_eq!(app.index_topic("NIFTY"), "index/NIFTY");
        assert_eq!(app.option_topic("43210"), "NSE_FO|43210");
        assert!(app.is_tracked_index("FINNIFTY"));
        assert!(!app.is_tracked_index("SENSEX"));
    }

    #[test]
    fn test_validate_requires_expiry_dates() {
        let settings = Settings::default_settings();
        assert_eq!(
            settings.validate(),
            Err(SettingsError::MissingExpiryDate("NIFTY".to_string()))
        );

        assert_eq!(with_expiries(settings).validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_bad_increment() {
        let mut settings = with_expiries(Settings::default_settings());
        settings
            .app
            .strike_increments
            .insert("NIFTY".to_string(), Decimal::ZERO);
        assert_eq!(
            settings.validate(),
            Err(SettingsError::InvalidStrikeIncrement("NIFTY".to_string()))
        );

        settings.app.strike_increments.remove("NIFTY");
        assert_eq!(
            settings.validate(),
            Err(SettingsError::MissingStrikeIncrement("NIFTY".to_string()))
        );
    }

    #[test]
    fn test_per_index_lookup_ignores_case() {
        let mut app = Settings::default_settings().app;
        app.expiry_dates
            .insert("nifty".to_string(), "2025-05-29".to_string());
        assert_eq!(app.expiry_date("NIFTY"), Some("2025-05-29"));
        assert_eq!(app.strike_increment("banknifty"), Some(Decimal::from(100)));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("ltp-ingest-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            r#"
            [database]
            url = "postgresql://db/ltp"

            [mqtt]
            host = "broker"

            [app]
            indices = ["NIFTY"]
            strike_range = 3

            [app.strike_increments]
            NIFTY = 50

            [app.expiry_dates]
            NIFTY = "2025-05-29"
            "#,
        )
        .unwrap();

        let settings = Settings::load_from_file(path.to_str().unwrap()).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.mqtt.port, 1883);
        assert_eq!(settings.app.strike_range, 3);
        assert_eq!(settings.app.strike_increment("NIFTY"), Some(Decimal::from(50)));
        assert_eq!(settings.batch.size, 100);
        assert_eq!(settings.token_service.timeout_ms, 5000);
        assert_eq!(settings.validate(), Ok(()));
    }

    #[test]
    fn test_validate_rejects_zero_batch() {
        let mut settings = with_expiries(Settings::default_settings());
        settings.batch.size = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidBatch(_))
        ));
    }
}
