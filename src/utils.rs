use i2cdev::core::I2CDevice;

/// Little-endian 16-bit word, as the trimming registers are laid out.
pub fn read_unsigned_short<D: I2CDevice>(dev: &mut D, address: u8) -> Result<u16, D::Error> {
    let values = dev.smbus_read_i2c_block_data(address, 2)?;
    Ok(le_u16(&values))
}

pub fn read_signed_short<D: I2CDevice>(dev: &mut D, address: u8) -> Result<i16, D::Error> {
    Ok(read_unsigned_short(dev, address)? as i16)
}

/// Big-endian msb/lsb/xlsb triple holding a 20-bit ADC value.
pub fn read_20bit<D: I2CDevice>(dev: &mut D, address: u8) -> Result<u32, D::Error> {
    let values = dev.smbus_read_i2c_block_data(address, 3)?;
    Ok(be_u20(&values))
}

fn le_u16(values: &[u8]) -> u16 {
    let v0 = values.first().copied().unwrap_or(0) as u16;
    let v1 = values.get(1).copied().unwrap_or(0) as u16;
    v0 + (v1 << 8)
}

fn be_u20(values: &[u8]) -> u32 {
    let b0 = values.first().copied().unwrap_or(0) as u32;
    let b1 = values.get(1).copied().unwrap_or(0) as u32;
    let b2 = values.get(2).copied().unwrap_or(0) as u32;
    (b0 << 12) + (b1 << 4) + (b2 >> 4)
}
