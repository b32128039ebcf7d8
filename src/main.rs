#[cfg(target_os = "linux")]
use std::sync::Arc;

#[cfg(target_os = "linux")]
use docopt::Docopt;
#[cfg(target_os = "linux")]
use i2cdev::linux::*;
#[cfg(target_os = "linux")]
use serde_derive::Deserialize;
#[cfg(target_os = "linux")]
use tracing::{info, warn};

#[cfg(target_os = "linux")]
use bme280_ignite::config::Config;
#[cfg(target_os = "linux")]
use bme280_ignite::{App, CachedSensor, MqttPlatform, SensorError, SensorSource, BME280};

#[cfg(target_os = "linux")]
const USAGE: &str = "
Publish BME280 temperature and pressure to an IoT management platform

Usage:
  bme280-ignite [<device>] [--address <addr>] [--config <file>]
  bme280-ignite (-h | --help)
  bme280-ignite (-v | --version)

Options:
  -h --help           Show this help text.
  --address <addr>    I2C device address (default 118 = 0x76).
  --config <file>     TOML configuration file.
  -v --version        Show version.
";

#[cfg(target_os = "linux")]
#[derive(Debug, Deserialize)]
struct Args {
    arg_device: Option<String>,
    flag_address: Option<u16>,
    flag_config: Option<String>,
    flag_version: bool,
}

#[cfg(target_os = "linux")]
impl Args {
    /// Command-line values take precedence over the configuration file.
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.flag_config {
            Some(path) => Config::load(path)?,
            None => Config::default(),
        };
        if let Some(device) = self.arg_device {
            config.sensor.device = device;
        }
        if let Some(address) = self.flag_address {
            config.sensor.address = address;
        }
        Ok(config)
    }
}

#[cfg(target_os = "linux")]
fn init_tracing(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[cfg(not(target_os = "linux"))]
fn main() {
    println!("This program can run only on Linux")
}

#[cfg(target_os = "linux")]
fn main() -> anyhow::Result<()> {
    let args: Args = Docopt::new(USAGE)
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    if args.flag_version {
        println!("bme280-ignite {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = args.into_config()?;
    init_tracing(&config.log.level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(run(config))
}

#[cfg(target_os = "linux")]
async fn run(config: Config) -> anyhow::Result<()> {
    let (events, events_rx) = tokio::sync::mpsc::unbounded_channel();
    let client_id = default_client_id(&config.platform.node_id);
    let platform = Arc::new(MqttPlatform::new(
        config.platform.mqtt(&client_id),
        &config.platform.node_id,
        events,
    )?);

    let sensor_config = config.sensor.clone();
    let sensor: Arc<dyn SensorSource> = Arc::new(CachedSensor::new(move || {
        let dev = LinuxI2CDevice::new(&sensor_config.device, sensor_config.address)
            .map_err(|e| SensorError::Bus(Box::new(e)))?;
        BME280::new(dev, sensor_config.settings.clone())
    }));

    info!(
        device = %config.sensor.device,
        address = config.sensor.address,
        broker = %config.platform.host,
        "bme280-ignite starting"
    );
    let mut app = App::new(&config, platform, sensor, events_rx);
    app.run(shutdown_signal()).await;
    Ok(())
}

/// `<node>-<hostname>` with spaces removed, so each board gets its own session.
#[cfg(target_os = "linux")]
fn default_client_id(node_id: &str) -> String {
    let host = nix::unistd::gethostname()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{node_id}-{host}").replace(char::is_whitespace, "-")
}

#[cfg(target_os = "linux")]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!("cannot listen for SIGTERM: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
}
