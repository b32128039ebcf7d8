//! Fault-tolerant access to the barometric sensor.
//!
//! Callers never see an I/O error from here: a failed read is logged and the
//! last good value (0.0 before any success) is handed back instead.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("i2c bus error: {0}")]
    Bus(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("unsupported chip id 0x{0:02x}")]
    UnsupportedChip(u8),
    #[error("pressure compensation failed")]
    CompensationFailed,
}

/// A device that can be sampled for temperature (°C) and pressure (hPa).
pub trait Barometer: Send {
    fn temperature(&mut self) -> Result<f32, SensorError>;
    fn pressure(&mut self) -> Result<f32, SensorError>;
}

/// The capability the publish loops sample from.
pub trait SensorSource: Send + Sync {
    fn start(&self);
    fn read_temperature(&self) -> f32;
    fn read_pressure(&self) -> f32;
    fn stop(&self);
}

type Opener<B> = Box<dyn Fn() -> Result<B, SensorError> + Send + Sync>;

struct Cache<B> {
    device: Option<B>,
    temperature: f32,
    pressure: f32,
}

/// Wraps a [`Barometer`] that is opened on `start` and dropped on `stop`.
pub struct CachedSensor<B> {
    open: Opener<B>,
    cache: Mutex<Cache<B>>,
}

impl<B: Barometer> CachedSensor<B> {
    pub fn new<F>(open: F) -> Self
    where
        F: Fn() -> Result<B, SensorError> + Send + Sync + 'static,
    {
        CachedSensor {
            open: Box::new(open),
            cache: Mutex::new(Cache {
                device: None,
                temperature: 0.0,
                pressure: 0.0,
            }),
        }
    }

    pub fn is_started(&self) -> bool {
        self.lock().device.is_some()
    }

    fn lock(&self) -> MutexGuard<'_, Cache<B>> {
        // a panic mid-read leaves the cached floats intact
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<B: Barometer> SensorSource for CachedSensor<B> {
    fn start(&self) {
        let mut cache = self.lock();
        if cache.device.is_some() {
            return;
        }
        match (self.open)() {
            Ok(device) => {
                info!("sensor started");
                cache.device = Some(device);
            }
            Err(e) => warn!("sensor start failed: {e}"),
        }
    }

    fn read_temperature(&self) -> f32 {
        let mut cache = self.lock();
        if let Some(device) = cache.device.as_mut() {
            match device.temperature() {
                Ok(value) => cache.temperature = value,
                Err(e) => warn!("temperature read failed, reusing {}: {e}", cache.temperature),
            }
        }
        cache.temperature
    }

    fn read_pressure(&self) -> f32 {
        let mut cache = self.lock();
        if let Some(device) = cache.device.as_mut() {
            match device.pressure() {
                Ok(value) => cache.pressure = value,
                Err(e) => warn!("pressure read failed, reusing {}: {e}", cache.pressure),
            }
        }
        cache.pressure
    }

    fn stop(&self) {
        if self.lock().device.take().is_some() {
            info!("sensor stopped");
        }
    }
}

/// Stops the sensor when dropped, however the owning scope is left.
pub struct StopOnDrop(pub Arc<dyn SensorSource>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted barometer: pops one result per read, repeating the last
    /// success once the script runs dry.
    #[derive(Default)]
    pub struct ScriptedBarometer {
        pub temperatures: VecDeque<Result<f32, ()>>,
        pub pressures: VecDeque<Result<f32, ()>>,
    }

    impl ScriptedBarometer {
        pub fn new(temperatures: Vec<Result<f32, ()>>, pressures: Vec<Result<f32, ()>>) -> Self {
            ScriptedBarometer {
                temperatures: temperatures.into(),
                pressures: pressures.into(),
            }
        }
    }

    fn next(script: &mut VecDeque<Result<f32, ()>>) -> Result<f32, SensorError> {
        let value = if script.len() > 1 {
            script.pop_front()
        } else {
            script.front().cloned()
        };
        match value {
            Some(Ok(v)) => Ok(v),
            _ => Err(SensorError::Bus("scripted fault".into())),
        }
    }

    impl Barometer for ScriptedBarometer {
        fn temperature(&mut self) -> Result<f32, SensorError> {
            next(&mut self.temperatures)
        }

        fn pressure(&mut self) -> Result<f32, SensorError> {
            next(&mut self.pressures)
        }
    }
}
