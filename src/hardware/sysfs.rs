use super::{Actuator, ActuatorError, Line};
use crate::config::HardwareConfig;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Actuator lines driven through the Linux sysfs GPIO interface.
/// Relays are active-high.
#[derive(Debug, Clone)]
pub struct SysfsActuator {
    base_path: PathBuf,
    relay_pins: Vec<u32>,
    converter_pin: u32,
    alarm_pin: u32,
    fan_pin: u32,
}

impl SysfsActuator {
    pub fn new(config: &HardwareConfig) -> Self {
        Self {
            base_path: PathBuf::from(&config.gpio_base),
            relay_pins: config.relay_pins.clone(),
            converter_pin: config.converter_pin,
            alarm_pin: config.alarm_pin,
            fan_pin: config.fan_pin,
        }
    }

    pub fn is_available(&self) -> bool {
        self.base_path.exists()
    }

    /// Exports every pin and configures it as a low output.
    pub fn setup(&mut self) -> Result<(), ActuatorError> {
        let pins: Vec<u32> = self
            .relay_pins
            .iter()
            .copied()
            .chain([self.converter_pin, self.alarm_pin, self.fan_pin])
            .collect();
        for pin in pins {
            let gpio_path = self.base_path.join(format!("gpio{pin}"));
            if !gpio_path.exists() {
                if let Err(e) = std::fs::write(self.base_path.join("export"), pin.to_string()) {
                    // Already-exported pins report EBUSY.
                    if !e.to_string().contains("Device or resource busy") {
                        warn!("Failed to export GPIO {}: {}", pin, e);
                    }
                }
            }
            std::fs::write(gpio_path.join("direction"), "low").map_err(|e| ActuatorError::Gpio {
                pin,
                reason: e.to_string(),
            })?;
        }
        info!("GPIO lines configured under {}", self.base_path.display());
        Ok(())
    }

    fn pin_for(&self, line: Line) -> Result<u32, ActuatorError> {
        match line {
            Line::Relay(index) => self
                .relay_pins
                .get(usize::from(index))
                .copied()
                .ok_or(ActuatorError::Unmapped { line }),
            Line::Converter => Ok(self.converter_pin),
            Line::Alarm => Ok(self.alarm_pin),
            Line::Fan => Ok(self.fan_pin),
        }
    }

    fn write_pin(base: &Path, pin: u32, asserted: bool) -> Result<(), ActuatorError> {
        let path = base.join(format!("gpio{pin}")).join("value");
        std::fs::write(&path, if asserted { "1" } else { "0" }).map_err(|e| {
            warn!("Failed to write GPIO {}: {}", pin, e);
            ActuatorError::Gpio {
                pin,
                reason: e.to_string(),
            }
        })
    }
}

impl Actuator for SysfsActuator {
    fn set_line(&mut self, line: Line, asserted: bool) -> Result<(), ActuatorError> {
        let pin = self.pin_for(line)?;
        debug!("{:?} (GPIO {}) -> {}", line, pin, if asserted { "on" } else { "off" });
        Self::write_pin(&self.base_path, pin, asserted)
    }

    fn reset_all(&mut self) -> Result<(), ActuatorError> {
        for &pin in &self.relay_pins {
            Self::write_pin(&self.base_path, pin, false)?;
        }
        Ok(())
    }
}
