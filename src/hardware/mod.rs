//! Capabilities the supervisor drives: the temperature byte stream, the
//! voltage front-end bus, the actuator lines and time itself.
//!
//! Every capability has a real adapter and a deterministic simulated one
//! in [`sim`]; the supervisor never asks which one it was given.

pub mod sim;
pub mod sysfs;
pub mod tcp;

#[cfg(feature = "hardware")]
pub mod i2c;

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

pub use sim::{RecordingActuator, Reply, ScriptedConnector, SimClock, SimPack};
pub use sysfs::SysfsActuator;
pub use tcp::TcpConnector;

/// Outputs on the one-hot voltage multiplexer, one per series bank.
pub const MUX_CHANNELS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BusError {
    #[error("no response from device {0:#04x}")]
    NoDevice(u8),
    #[error("bus i/o error: {0}")]
    Io(String),
    #[error("multiplexer has no output {0}")]
    NoChannel(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActuatorError {
    #[error("line {line:?} has no output pin")]
    Unmapped { line: Line },
    #[error("gpio {pin}: {reason}")]
    Gpio { pin: u32, reason: String },
}

/// A physical output the supervisor switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Line {
    /// Balancing relay, indexed from 0.
    Relay(u8),
    /// DC-DC converter enable.
    Converter,
    Alarm,
    Fan,
}

/// One open connection to the temperature bus bridge.
pub trait ByteStream: Send {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads up to `max_bytes`. An empty vector means the peer closed.
    fn recv_with_timeout(&mut self, max_bytes: usize, timeout: Duration)
        -> Result<Vec<u8>, TransportError>;
}

pub trait Connector: Send {
    fn connect(
        &mut self,
        host: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, TransportError>;
}

/// Register-level access to the voltage front end.
pub trait Bus: Send {
    fn read_word(&mut self, address: u8, register: u8) -> Result<u16, BusError>;
    fn write_word(&mut self, address: u8, register: u8, value: u16) -> Result<(), BusError>;
    fn write_byte(&mut self, address: u8, value: u8) -> Result<(), BusError>;

    /// Routes multiplexer output `channel` (0-based) to the converter.
    fn select_channel(&mut self, mux_address: u8, channel: u8) -> Result<(), BusError> {
        if usize::from(channel) >= MUX_CHANNELS {
            return Err(BusError::NoChannel(channel));
        }
        self.write_byte(mux_address, 1u8 << channel)
    }
}

pub trait Actuator: Send {
    fn set_line(&mut self, line: Line, asserted: bool) -> Result<(), ActuatorError>;

    /// Deasserts every balancing relay.
    fn reset_all(&mut self) -> Result<(), ActuatorError>;
}

pub trait Clock: Send + Sync {
    /// Monotonic time since the clock was created.
    fn now(&self) -> Duration;
    fn sleep(&self, duration: Duration);
    /// Wall-clock seconds since the Unix epoch, for snapshots and events.
    fn unix_time(&self) -> u64;
}

#[derive(Debug, Clone)]
pub struct SystemClock {
    start: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }

    fn unix_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}
