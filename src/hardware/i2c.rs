use super::{Bus, BusError};
use i2cdev::core::I2CDevice;
use i2cdev::linux::LinuxI2CDevice;
use std::collections::HashMap;
use tracing::debug;

/// SMBus access through `/dev/i2c-N`, one device handle per address.
pub struct LinuxI2cBus {
    path: String,
    devices: HashMap<u8, LinuxI2CDevice>,
}

impl LinuxI2cBus {
    pub fn new(bus_number: u8) -> Self {
        Self {
            path: format!("/dev/i2c-{bus_number}"),
            devices: HashMap::new(),
        }
    }

    fn device(&mut self, address: u8) -> Result<&mut LinuxI2CDevice, BusError> {
        if !self.devices.contains_key(&address) {
            debug!("Opening {} at {:#04x}", self.path, address);
            let device = LinuxI2CDevice::new(&self.path, u16::from(address))
                .map_err(|e| BusError::Io(e.to_string()))?;
            self.devices.insert(address, device);
        }
        self.devices
            .get_mut(&address)
            .ok_or(BusError::NoDevice(address))
    }
}

impl Bus for LinuxI2cBus {
    fn read_word(&mut self, address: u8, register: u8) -> Result<u16, BusError> {
        self.device(address)?
            .smbus_read_word_data(register)
            .map_err(|e| BusError::Io(e.to_string()))
    }

    fn write_word(&mut self, address: u8, register: u8, value: u16) -> Result<(), BusError> {
        self.device(address)?
            .smbus_write_word_data(register, value)
            .map_err(|e| BusError::Io(e.to_string()))
    }

    fn write_byte(&mut self, address: u8, value: u8) -> Result<(), BusError> {
        self.device(address)?
            .smbus_write_byte(value)
            .map_err(|e| BusError::Io(e.to_string()))
    }
}
