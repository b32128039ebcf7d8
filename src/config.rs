//! Daemon configuration, read from an optional TOML file.
//!
//! ```toml
//! [platform]
//! host = "broker.local"
//! node_id = "Greenhouse Node"
//!
//! [watchdog]
//! reconnect_interval_ms = 5000
//!
//! [sensor]
//! device = "/dev/i2c-1"
//! address = 0x77
//!
//! [sensor.settings]
//! mode = "normal"
//! oversampling_pressure = 2
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_derive::Deserialize;

use crate::bme280::{Settings, BME280_DEFAULT_ADDRESS};
use crate::platform::mqtt::MqttSettings;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub platform: PlatformConfig,
    pub watchdog: WatchdogConfig,
    pub sensor: SensorConfig,
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlatformConfig {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub connect_timeout_ms: u64,
    pub topic_prefix: String,
    pub node_id: String,
    pub temperature_thing: String,
    pub pressure_thing: String,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: None,
            username: None,
            password: None,
            keep_alive_secs: 30,
            connect_timeout_ms: 5000,
            topic_prefix: "ignite".to_string(),
            node_id: "Android Things Node".to_string(),
            temperature_thing: "BME280 TEMPERATURE".to_string(),
            pressure_thing: "BME280 PRESSURE".to_string(),
        }
    }
}

impl PlatformConfig {
    /// Broker settings; `default_client_id` is used unless one is configured.
    pub fn mqtt(&self, default_client_id: &str) -> MqttSettings {
        MqttSettings {
            host: self.host.clone(),
            port: self.port,
            client_id: self
                .client_id
                .clone()
                .unwrap_or_else(|| default_client_id.to_string()),
            username: self.username.clone(),
            password: self.password.clone(),
            keep_alive: Duration::from_secs(self.keep_alive_secs),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            topic_prefix: self.topic_prefix.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WatchdogConfig {
    pub reconnect_interval_ms: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        WatchdogConfig {
            reconnect_interval_ms: 10_000,
        }
    }
}

impl WatchdogConfig {
    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub device: String,
    pub address: u16,
    pub settings: Settings,
}

impl Default for SensorConfig {
    fn default() -> Self {
        SensorConfig {
            device: "/dev/i2c-1".to_string(),
            address: BME280_DEFAULT_ADDRESS,
            settings: Settings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` wins when set.
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Config::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}
