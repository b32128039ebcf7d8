//! # bme280-ignite
//!
//! Samples a BME280 over Linux I2C and republishes temperature and pressure
//! to an IoT management platform, reconnecting whenever the platform goes
//! away and retuning each stream's publish period from remote configuration.
//!
//! # Examples
//! ```no_run
//! use std::sync::Arc;
//! use bme280_ignite::{App, BME280, CachedSensor, Config, MqttPlatform, SensorError};
//! use i2cdev::linux::LinuxI2CDevice;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default();
//! let (events, rx) = tokio::sync::mpsc::unbounded_channel();
//! let mqtt = config.platform.mqtt("demo");
//! let platform = Arc::new(MqttPlatform::new(mqtt, &config.platform.node_id, events)?);
//! let sensor_config = config.sensor.clone();
//! let sensor = Arc::new(CachedSensor::new(move || {
//!     let dev = LinuxI2CDevice::new(&sensor_config.device, sensor_config.address)
//!         .map_err(|e| SensorError::Bus(Box::new(e)))?;
//!     BME280::new(dev, sensor_config.settings.clone())
//! }));
//! let mut app = App::new(&config, platform, sensor, rx);
//! app.run(async { let _ = tokio::signal::ctrl_c().await; }).await;
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod bme280;
pub mod config;
pub mod platform;
pub mod scheduler;
pub mod sensor;
mod utils;
pub mod watchdog;

pub use app::App;
pub use bme280::{Settings, BME280};
pub use config::Config;
pub use platform::mqtt::MqttPlatform;
pub use platform::{PlatformError, PlatformEvent, PlatformFacade};
pub use scheduler::{Metric, Period, PublishScheduler};
pub use sensor::{CachedSensor, SensorError, SensorSource};
pub use watchdog::{ConnectionState, ConnectionWatchdog};
