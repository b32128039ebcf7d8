use i2cdev::core::I2CDevice;
use serde_derive::Deserialize;
use tracing::{debug, info};

use crate::sensor::{Barometer, SensorError};
use crate::utils::*;

pub const BME280_DEFAULT_ADDRESS: u16 = 0x76;

const CHIP_ID_REGISTER: u8 = 0xD0;
const BME280_CHIP_ID: u8 = 0x60;
const BMP280_CHIP_ID: u8 = 0x58;

const CTRL_HUM_REGISTER: u8 = 0xF2;
const CTRL_MEAS_REGISTER: u8 = 0xF4;
const CONFIG_REGISTER: u8 = 0xF5;
const PRESSURE_DATA_REGISTER: u8 = 0xF7;
const TEMPERATURE_DATA_REGISTER: u8 = 0xFA;

const PASCALS_PER_HECTOPASCAL: f32 = 100.0;

/// Factory trimming parameters burned into the chip's NVM.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CompensationParams {
    pub t1: u16,
    pub t2: i16,
    pub t3: i16,
    pub p1: u16,
    pub p2: i16,
    pub p3: i16,
    pub p4: i16,
    pub p5: i16,
    pub p6: i16,
    pub p7: i16,
    pub p8: i16,
    pub p9: i16,
}

impl CompensationParams {
    pub fn load<D: I2CDevice>(&mut self, dev: &mut D) -> Result<(), D::Error> {
        self.t1 = read_unsigned_short(dev, 0x88)?;
        self.t2 = read_signed_short(dev, 0x8A)?;
        self.t3 = read_signed_short(dev, 0x8C)?;
        self.p1 = read_unsigned_short(dev, 0x8E)?;
        self.p2 = read_signed_short(dev, 0x90)?;
        self.p3 = read_signed_short(dev, 0x92)?;
        self.p4 = read_signed_short(dev, 0x94)?;
        self.p5 = read_signed_short(dev, 0x96)?;
        self.p6 = read_signed_short(dev, 0x98)?;
        self.p7 = read_signed_short(dev, 0x9A)?;
        self.p8 = read_signed_short(dev, 0x9C)?;
        self.p9 = read_signed_short(dev, 0x9E)?;
        Ok(())
    }

    pub fn fine_resolution_temp(&self, uncomp_t: u32) -> i32 {
        let uncomp_ = uncomp_t as i32;
        let t1_ = self.t1 as i32;
        let t2_ = self.t2 as i32;
        let t3_ = self.t3 as i32;

        let x1 = (((uncomp_ >> 3) - (t1_ << 1)) * t2_) >> 11;
        let x2 = (((((uncomp_ >> 4) - t1_) * ((uncomp_ >> 4) - t1_)) >> 12) * t3_) >> 14;
        x1 + x2
    }

    pub fn compensated_temp(&self, uncomp_t: u32) -> f32 {
        let tf = ((self.fine_resolution_temp(uncomp_t) * 5 + 128) >> 8) as f32;
        tf / 100.0
    }

    /// Pressure in pascals, or `None` when the trimming data would divide by zero.
    pub fn compensated_pressure(&self, uncomp_p: u32, t_fine: i32) -> Option<f32> {
        let mut var1 = t_fine as i64 - 128000;
        let mut var2 = var1 * var1 * self.p6 as i64;
        var2 += (var1 * self.p5 as i64) << 17;
        var2 += (self.p4 as i64) << 35;
        var1 = ((var1 * var1 * self.p3 as i64) >> 8) + ((var1 * self.p2 as i64) << 12);
        var1 = (((1i64 << 47) + var1) * self.p1 as i64) >> 33;
        if var1 == 0 {
            return None;
        }

        let mut p = 1048576 - uncomp_p as i64;
        p = (((p << 31) - var2) * 3125) / var1;
        let var1 = (self.p9 as i64 * (p >> 13) * (p >> 13)) >> 25;
        let var2 = (self.p8 as i64 * p) >> 19;
        p = ((p + var1 + var2) >> 8) + ((self.p7 as i64) << 4);

        // Q24.8 fixed point
        Some(p as f32 / 256.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sleep,
    Force,
    Normal,
}

impl Mode {
    fn bits(self) -> u8 {
        match self {
            Mode::Sleep => 0,
            Mode::Force => 1,
            Mode::Normal => 3,
        }
    }
}

/// Measurement setup written to the control registers on initialization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub mode: Mode,
    pub oversampling_temperature: u8,
    pub oversampling_pressure: u8,
    pub oversampling_humidity: u8,
    pub standby_time: u8,
    pub iir_filter: u8,
    pub spi3w_enabled: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            mode: Mode::Normal,
            oversampling_temperature: 1,
            oversampling_pressure: 1,
            oversampling_humidity: 1,
            standby_time: 5,
            iir_filter: 0,
            spi3w_enabled: false,
        }
    }
}

impl Settings {
    fn ctrl_meas(&self) -> u8 {
        (self.oversampling_temperature << 5) | (self.oversampling_pressure << 2) | self.mode.bits()
    }

    fn config(&self) -> u8 {
        (self.standby_time << 5) | (self.iir_filter << 2) | (self.spi3w_enabled as u8)
    }
}

pub struct BME280<D> {
    device: D,
    settings: Settings,
    params: CompensationParams,
    chip_id: u8,
}

impl<D> BME280<D>
where
    D: I2CDevice,
    D::Error: std::error::Error + Send + Sync + 'static,
{
    pub fn new(dev: D, settings: Settings) -> Result<BME280<D>, SensorError> {
        let mut bme280 = BME280 {
            device: dev,
            settings,
            params: CompensationParams::default(),
            chip_id: 0,
        };
        bme280.chip_id = bme280.verify_chip_id()?;
        info!(chip_id = %format!("0x{:02x}", bme280.chip_id), "bme280 detected");
        bme280.params.load(&mut bme280.device).map_err(bus)?;
        debug!(params = ?bme280.params, "compensation parameters loaded");
        bme280.initialize()?;
        Ok(bme280)
    }

    pub fn chip_id(&self) -> u8 {
        self.chip_id
    }

    fn verify_chip_id(&mut self) -> Result<u8, SensorError> {
        let id = self
            .device
            .smbus_read_byte_data(CHIP_ID_REGISTER)
            .map_err(bus)?;
        match id {
            BME280_CHIP_ID | BMP280_CHIP_ID => Ok(id),
            other => Err(SensorError::UnsupportedChip(other)),
        }
    }

    fn initialize(&mut self) -> Result<(), SensorError> {
        let ctrl_meas = self.settings.ctrl_meas();
        let config = self.settings.config();

        // ctrl_hum only takes effect after a write to ctrl_meas
        if self.chip_id == BME280_CHIP_ID {
            self.device
                .smbus_write_byte_data(CTRL_HUM_REGISTER, self.settings.oversampling_humidity)
                .map_err(bus)?;
        }
        self.device
            .smbus_write_byte_data(CTRL_MEAS_REGISTER, ctrl_meas)
            .map_err(bus)?;
        self.device
            .smbus_write_byte_data(CONFIG_REGISTER, config)
            .map_err(bus)
    }

    pub fn raw_pressure(&mut self) -> Result<u32, SensorError> {
        read_20bit(&mut self.device, PRESSURE_DATA_REGISTER).map_err(bus)
    }

    pub fn raw_temperature(&mut self) -> Result<u32, SensorError> {
        read_20bit(&mut self.device, TEMPERATURE_DATA_REGISTER).map_err(bus)
    }

    pub fn temperature(&mut self) -> Result<f32, SensorError> {
        let raw_value = self.raw_temperature()?;
        Ok(self.params.compensated_temp(raw_value))
    }

    /// Compensated pressure in pascals.
    pub fn pressure(&mut self) -> Result<f32, SensorError> {
        let raw_t = self.raw_temperature()?;
        let t_fine = self.params.fine_resolution_temp(raw_t);
        let raw_value = self.raw_pressure()?;
        self.params
            .compensated_pressure(raw_value, t_fine)
            .ok_or(SensorError::CompensationFailed)
    }
}

impl<D> Barometer for BME280<D>
where
    D: I2CDevice + Send,
    D::Error: std::error::Error + Send + Sync + 'static,
{
    fn temperature(&mut self) -> Result<f32, SensorError> {
        BME280::temperature(self)
    }

    fn pressure(&mut self) -> Result<f32, SensorError> {
        Ok(BME280::pressure(self)? / PASCALS_PER_HECTOPASCAL)
    }
}

fn bus<E>(err: E) -> SensorError
where
    E: std::error::Error + Send + Sync + 'static,
{
    SensorError::Bus(Box::new(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::{CachedSensor, SensorSource};

    // Reference sample from the Bosch BMP280 datasheet, section 8.2.
    fn datasheet_params() -> CompensationParams {
        CompensationParams {
            t1: 27504,
            t2: 26435,
            t3: -1000,
            p1: 36477,
            p2: -10685,
            p3: 3024,
            p4: 2855,
            p5: 140,
            p6: -7,
            p7: 15500,
            p8: -14600,
            p9: 6000,
        }
    }

    #[test]
    fn compensates_reference_temperature() {
        let params = datasheet_params();
        assert_eq!(params.fine_resolution_temp(519888), 128422);
        assert_eq!(params.compensated_temp(519888), 25.08);
    }

    #[test]
    fn compensates_reference_pressure() {
        let params = datasheet_params();
        let pressure = params.compensated_pressure(415148, 128422).unwrap();
        assert!((pressure - 100653.25).abs() < 0.5, "got {pressure}");
    }

    #[test]
    fn zero_p1_cannot_be_compensated() {
        let params = CompensationParams {
            p1: 0,
            ..datasheet_params()
        };
        assert!(params.compensated_pressure(415148, 128422).is_none());
    }

    /// Register file answering the SMBus calls the driver makes.
    struct RegisterFile {
        registers: [u8; 256],
        pointer: usize,
    }

    impl RegisterFile {
        fn datasheet_sample() -> Self {
            let mut file = RegisterFile {
                registers: [0; 256],
                pointer: 0,
            };
            let p = datasheet_params();
            let words = [
                p.t1.to_le_bytes(),
                p.t2.to_le_bytes(),
                p.t3.to_le_bytes(),
                p.p1.to_le_bytes(),
                p.p2.to_le_bytes(),
                p.p3.to_le_bytes(),
                p.p4.to_le_bytes(),
                p.p5.to_le_bytes(),
                p.p6.to_le_bytes(),
                p.p7.to_le_bytes(),
                p.p8.to_le_bytes(),
                p.p9.to_le_bytes(),
            ];
            for (i, word) in words.iter().enumerate() {
                file.set(0x88 + 2 * i as u8, word);
            }
            file.set(CHIP_ID_REGISTER, &[BME280_CHIP_ID]);
            // raw pressure 415148, raw temperature 519888
            file.set(PRESSURE_DATA_REGISTER, &[0x65, 0x5A, 0xC0]);
            file.set(TEMPERATURE_DATA_REGISTER, &[0x7E, 0xED, 0x00]);
            file
        }

        fn set(&mut self, register: u8, values: &[u8]) {
            let start = register as usize;
            self.registers[start..start + values.len()].copy_from_slice(values);
        }
    }

    impl I2CDevice for RegisterFile {
        type Error = std::io::Error;

        fn read(&mut self, data: &mut [u8]) -> Result<(), Self::Error> {
            let end = self.pointer + data.len();
            data.copy_from_slice(&self.registers[self.pointer..end]);
            self.pointer = end;
            Ok(())
        }

        fn write(&mut self, data: &[u8]) -> Result<(), Self::Error> {
            if let Some((&register, values)) = data.split_first() {
                self.set(register, values);
                self.pointer = register as usize + values.len();
            }
            Ok(())
        }

        fn smbus_write_quick(&mut self, _bit: bool) -> Result<(), Self::Error> {
            Ok(())
        }

        fn smbus_read_block_data(&mut self, _register: u8) -> Result<Vec<u8>, Self::Error> {
            Err(std::io::ErrorKind::Unsupported.into())
        }

        fn smbus_read_i2c_block_data(
            &mut self,
            register: u8,
            len: u8,
        ) -> Result<Vec<u8>, Self::Error> {
            let start = register as usize;
            Ok(self.registers[start..start + len as usize].to_vec())
        }

        fn smbus_write_block_data(
            &mut self,
            _register: u8,
            _values: &[u8],
        ) -> Result<(), Self::Error> {
            Err(std::io::ErrorKind::Unsupported.into())
        }

        fn smbus_write_i2c_block_data(
            &mut self,
            register: u8,
            values: &[u8],
        ) -> Result<(), Self::Error> {
            self.set(register, values);
            Ok(())
        }

        fn smbus_process_block(
            &mut self,
            _register: u8,
            _values: &[u8],
        ) -> Result<Vec<u8>, Self::Error> {
            Err(std::io::ErrorKind::Unsupported.into())
        }
    }

    #[test]
    fn reads_datasheet_sample_through_the_bus() {
        let mut bme280 = BME280::new(RegisterFile::datasheet_sample(), Settings::default()).unwrap();
        assert_eq!(bme280.chip_id(), BME280_CHIP_ID);
        assert_eq!(bme280.device.registers[CTRL_MEAS_REGISTER as usize], 0b001_001_11);
        assert_eq!(bme280.device.registers[CONFIG_REGISTER as usize], 0b101_000_0_0);
        assert_eq!(bme280.device.registers[CTRL_HUM_REGISTER as usize], 1);

        assert_eq!(bme280.temperature().unwrap(), 25.08);
        let pascals = bme280.pressure().unwrap();
        assert!((pascals - 100653.25).abs() < 0.5, "got {pascals}");
    }

    #[test]
    fn sensor_publishes_pressure_in_hectopascals() {
        let sensor =
            CachedSensor::new(|| BME280::new(RegisterFile::datasheet_sample(), Settings::default()));
        sensor.start();
        let hectopascals = sensor.read_pressure();
        assert!((hectopascals - 1006.53).abs() < 0.01, "got {hectopascals}");
        assert_eq!(sensor.read_temperature(), 25.08);
    }

    #[test]
    fn rejects_unknown_chip() {
        let mut file = RegisterFile::datasheet_sample();
        file.set(CHIP_ID_REGISTER, &[0x55]);
        assert!(matches!(
            BME280::new(file, Settings::default()),
            Err(SensorError::UnsupportedChip(0x55))
        ));
    }

    #[test]
    fn default_settings_pack_control_registers() {
        let settings = Settings::default();
        assert_eq!(settings.ctrl_meas(), 0b001_001_11);
        assert_eq!(settings.config(), 0b101_000_0_0);
    }
}
