//! Temperature bus client.
//!
//! The bus is a slow half-duplex multidrop line behind a serial-to-TCP
//! bridge. Each request gets its own connection; after sending, the client
//! waits for the line to turn around before reading, then accumulates the
//! reply in bursts until the expected length arrives or a short budget
//! runs out. Failed attempts are classified with an independent
//! connect-only probe: a reachable bridge means the device or frame was at
//! fault, an unreachable one means the network is down. Each class has
//! its own retry budget.

use crate::config::TemperatureConfig;
use crate::frame::{FrameError, ReadRequest, EXCEPTION_FLAG};
use crate::hardware::{Clock, Connector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const RECV_CHUNK: usize = 256;
const EXCEPTION_FRAME_LEN: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("timed out")]
    Timeout,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("i/o error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => TransportError::Timeout,
            ErrorKind::ConnectionRefused => TransportError::ConnectionRefused,
            ErrorKind::AddrNotAvailable => TransportError::NetworkUnreachable,
            _ => TransportError::Io(e.to_string()),
        }
    }
}

/// Why a single request attempt failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// Terminal outcome of a unit read once retries are spent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReadError {
    #[error("Failed after {attempts} attempts for unit {unit_id}: {last}")]
    RetriesExhausted {
        unit_id: u8,
        attempts: u32,
        last: AttemptError,
    },
    #[error("Network unreachable for unit {unit_id} after {attempts} attempts")]
    NetworkUnreachable { unit_id: u8, attempts: u32 },
    #[error("Device exception {code:#04x} from unit {unit_id}")]
    DeviceException { unit_id: u8, code: u8 },
}

impl ReadError {
    pub fn unit_id(&self) -> u8 {
        match self {
            ReadError::RetriesExhausted { unit_id, .. }
            | ReadError::NetworkUnreachable { unit_id, .. }
            | ReadError::DeviceException { unit_id, .. } => *unit_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub host: String,
    pub connect_timeout: Duration,
    pub query_delay: Duration,
    pub response_budget: Duration,
    pub read_poll: Duration,
    pub failure_settle: Duration,
    pub probe_timeout: Duration,
    pub inter_unit_delay: Duration,
    pub max_retries: u32,
    pub network_retries: u32,
    pub retry_backoff_base: u32,
    pub start_register: u16,
    pub scaling_factor: f64,
}

impl TransportSettings {
    pub fn from_config(config: &TemperatureConfig) -> Self {
        Self {
            host: config.host.clone(),
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            query_delay: Duration::from_millis(config.query_delay_ms),
            response_budget: Duration::from_millis(config.response_budget_ms),
            read_poll: Duration::from_millis(config.read_poll_ms),
            failure_settle: Duration::from_millis(config.failure_settle_ms),
            probe_timeout: Duration::from_millis(config.probe_timeout_ms),
            inter_unit_delay: Duration::from_millis(config.inter_unit_delay_ms),
            max_retries: config.max_retries,
            network_retries: config.network_retries,
            retry_backoff_base: config.retry_backoff_base,
            start_register: config.start_register,
            scaling_factor: config.scaling_factor,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base^attempt` seconds.
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(u64::from(self.retry_backoff_base.saturating_pow(attempt)))
    }
}

/// One unit on the multidrop bus and the bridge port that reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTarget {
    pub unit_id: u8,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct UnitReading {
    pub unit_id: u8,
    pub result: Result<Vec<f64>, ReadError>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LinkStats {
    pub requests_sent: u32,
    pub responses_ok: u32,
    pub frame_errors: u32,
    pub transport_errors: u32,
    pub reads_failed: u32,
}

pub struct TemperatureClient {
    connector: Box<dyn Connector>,
    clock: Arc<dyn Clock>,
    settings: TransportSettings,
    stats: LinkStats,
}

impl TemperatureClient {
    pub fn new(
        connector: Box<dyn Connector>,
        clock: Arc<dyn Clock>,
        settings: TransportSettings,
    ) -> Self {
        Self {
            connector,
            clock,
            settings,
            stats: LinkStats::default(),
        }
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.settings
    }

    pub fn get_stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Connect-only reachability check against the bridge.
    pub fn probe(&mut self, port: u16) -> bool {
        let host = self.settings.host.clone();
        match self.connector.connect(&host, port, self.settings.probe_timeout) {
            Ok(_) => true,
            Err(e) => {
                debug!("Probe of {}:{} failed: {}", host, port, e);
                false
            }
        }
    }

    /// Reads `count` channels from one unit and scales them to degrees.
    pub fn read_unit(&mut self, target: UnitTarget, count: u16) -> Result<Vec<f64>, ReadError> {
        let request =
            ReadRequest::holding_registers(target.unit_id, self.settings.start_register, count);
        let scale = self.settings.scaling_factor;
        let registers = self.read_registers(target.port, &request)?;
        Ok(registers.into_iter().map(|r| f64::from(r) / scale).collect())
    }

    /// Reads the same channel count from every unit in turn, pausing
    /// between units so their bus turnarounds never overlap.
    pub fn read_units(&mut self, targets: &[UnitTarget], count: u16) -> Vec<UnitReading> {
        let mut readings = Vec::with_capacity(targets.len());
        for (i, target) in targets.iter().enumerate() {
            if i > 0 {
                debug!("Inter-unit delay {:?} before unit {}", self.settings.inter_unit_delay, target.unit_id);
                self.clock.sleep(self.settings.inter_unit_delay);
            }
            readings.push(UnitReading {
                unit_id: target.unit_id,
                result: self.read_unit(*target, count),
            });
        }
        readings
    }

    pub fn read_registers(&mut self, port: u16, request: &ReadRequest) -> Result<Vec<i16>, ReadError> {
        let unit_id = request.unit_id;
        let max_retries = self.settings.max_retries.max(1);
        let network_retries = self.settings.network_retries.max(1);
        let mut device_failures = 0u32;
        let mut network_failures = 0u32;

        info!("Starting temperature read for unit {}", unit_id);
        loop {
            debug!(
                "Read attempt {} for unit {} at {}:{}",
                device_failures + network_failures + 1,
                unit_id,
                self.settings.host,
                port
            );
            let last = match self.attempt(port, request) {
                Ok(registers) => {
                    self.stats.responses_ok = self.stats.responses_ok.wrapping_add(1);
                    info!("Temperature read successful for unit {}: {} values", unit_id, registers.len());
                    return Ok(registers);
                }
                Err(AttemptError::Frame(FrameError::DeviceException(code))) => {
                    self.stats.reads_failed = self.stats.reads_failed.wrapping_add(1);
                    error!("Unit {} answered with exception code {:#04x}", unit_id, code);
                    return Err(ReadError::DeviceException { unit_id, code });
                }
                Err(e) => e,
            };

            match &last {
                AttemptError::Frame(_) => self.stats.frame_errors = self.stats.frame_errors.wrapping_add(1),
                AttemptError::Transport(_) => {
                    self.stats.transport_errors = self.stats.transport_errors.wrapping_add(1);
                }
            }
            warn!("Read attempt for unit {} failed: {}", unit_id, last);
            self.clock.sleep(self.settings.failure_settle);

            let network_up = self.probe(port);
            if network_up {
                device_failures += 1;
            } else {
                network_failures += 1;
            }
            let attempts = device_failures + network_failures;

            // Both failure kinds draw on the one attempt budget; the network
            // budget can only end the read sooner.
            if !network_up && (network_failures >= network_retries || attempts >= max_retries) {
                self.stats.reads_failed = self.stats.reads_failed.wrapping_add(1);
                error!("Network down after {} attempts for unit {}", attempts, unit_id);
                return Err(ReadError::NetworkUnreachable { unit_id, attempts });
            }
            if attempts >= max_retries {
                self.stats.reads_failed = self.stats.reads_failed.wrapping_add(1);
                error!("Temperature read failed after {} attempts for unit {}", attempts, unit_id);
                return Err(ReadError::RetriesExhausted {
                    unit_id,
                    attempts,
                    last,
                });
            }

            if network_up {
                let backoff = self.settings.backoff(device_failures - 1);
                warn!(
                    "Network up, retry {}/{} for unit {} ({}ms)",
                    attempts,
                    max_retries,
                    unit_id,
                    backoff.as_millis()
                );
                self.clock.sleep(backoff);
            } else {
                warn!("Network down, retry {}/{} for unit {}", attempts, max_retries, unit_id);
            }
        }
    }

    fn attempt(&mut self, port: u16, request: &ReadRequest) -> Result<Vec<i16>, AttemptError> {
        let host = self.settings.host.clone();
        let mut stream = self
            .connector
            .connect(&host, port, self.settings.connect_timeout)?;
        stream.send(&request.encode())?;
        self.stats.requests_sent = self.stats.requests_sent.wrapping_add(1);

        // Half-duplex turnaround: reading early truncates the frame.
        self.clock.sleep(self.settings.query_delay);

        let expected = request.expected_response_len();
        let mut response = stream.recv_with_timeout(RECV_CHUNK, self.settings.connect_timeout)?;
        let started = self.clock.now();
        while response.len() < expected
            && !is_exception_frame(&response)
            && self.clock.now().saturating_sub(started) < self.settings.response_budget
        {
            self.clock.sleep(self.settings.read_poll);
            match stream.recv_with_timeout(RECV_CHUNK, self.settings.read_poll) {
                Ok(chunk) if chunk.is_empty() => break,
                Ok(chunk) => response.extend_from_slice(&chunk),
                Err(TransportError::Timeout) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        if response.len() != expected && !is_exception_frame(&response) {
            warn!(
                "Response length mismatch for unit {}: got {}, expected {}",
                request.unit_id,
                response.len(),
                expected
            );
        }
        Ok(request.decode_response(&response)?)
    }
}

fn is_exception_frame(response: &[u8]) -> bool {
    response.len() >= EXCEPTION_FRAME_LEN && response[1] & EXCEPTION_FLAG != 0
}
