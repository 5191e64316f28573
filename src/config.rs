//! Supervisor configuration, loaded from TOML.
//!
//! Every section and field has a default, so a file only needs to name
//! what differs from a three-bank, single-unit pack. The relay mapping has
//! no sensible default and must always be supplied.

use crate::balance::{RelayMappingError, RelayTable};
use crate::hardware::MUX_CHANNELS;
use crate::topology::Topology;
use crate::transport::UnitTarget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const MAX_SERIES_BANKS: usize = MUX_CHANNELS;

// Pack shape
const DEFAULT_SERIES_BANKS: usize = 3;
const DEFAULT_SENSORS_PER_BANK: usize = 8;
const DEFAULT_PARALLEL_BATTERIES: usize = 1;

// Temperature bus timing, tuned for a 9600 baud half-duplex bridge
const DEFAULT_BUS_PORT: u16 = 10001;
const DEFAULT_QUERY_DELAY_MS: u64 = 250;
const DEFAULT_INTER_UNIT_DELAY_MS: u64 = 500;
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5000;
const DEFAULT_RESPONSE_BUDGET_MS: u64 = 2000;
const DEFAULT_READ_POLL_MS: u64 = 100;
const DEFAULT_FAILURE_SETTLE_MS: u64 = 3000;
const DEFAULT_PROBE_TIMEOUT_MS: u64 = 1000;

// Voltage front end (TCA9548A multiplexer + ADS1115 converter)
const DEFAULT_MUX_ADDRESS: u8 = 0x70;
const DEFAULT_METER_ADDRESS: u8 = 0x49;
const CONTINUOUS_MODE_CONFIG: u16 = 0x0100;
const SAMPLE_RATE_CONFIG: u16 = 0x0080;
const GAIN_CONFIG: u16 = 0x0400;

// GPIO (BCM numbering)
const DEFAULT_RELAY_PINS: [u32; 4] = [17, 18, 27, 22];
const DEFAULT_CONVERTER_PIN: u32 = 5;
const DEFAULT_ALARM_PIN: u32 = 6;
const DEFAULT_FAN_PIN: u32 = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PackConfig {
    pub num_series_banks: usize,
    pub sensors_per_bank: usize,
    pub number_of_parallel_batteries: usize,
}

impl Default for PackConfig {
    fn default() -> Self {
        Self {
            num_series_banks: DEFAULT_SERIES_BANKS,
            sensors_per_bank: DEFAULT_SENSORS_PER_BANK,
            number_of_parallel_batteries: DEFAULT_PARALLEL_BATTERIES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TemperatureConfig {
    pub host: String,
    pub port: u16,
    /// One bus unit id per parallel battery, in battery order.
    pub unit_ids: Vec<u8>,
    /// Per-unit bridge ports; empty means every unit uses `port`.
    pub unit_ports: Vec<u16>,
    pub start_register: u16,
    pub scaling_factor: f64,
    pub poll_interval_s: u64,
    pub query_delay_ms: u64,
    pub inter_unit_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub response_budget_ms: u64,
    pub read_poll_ms: u64,
    pub failure_settle_ms: u64,
    pub probe_timeout_ms: u64,
    pub max_retries: u32,
    pub network_retries: u32,
    pub retry_backoff_base: u32,
    pub valid_min: f64,
    pub high_threshold: f64,
    pub low_threshold: f64,
    pub abs_deviation_threshold: f64,
    pub deviation_threshold: f64,
    pub rise_threshold: f64,
    pub disconnection_lag_threshold: f64,
    pub cabinet_over_temp_threshold: f64,
    pub cold_threshold: f64,
}

impl Default for TemperatureConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: DEFAULT_BUS_PORT,
            unit_ids: vec![1],
            unit_ports: Vec::new(),
            start_register: 0,
            scaling_factor: 100.0,
            poll_interval_s: 10,
            query_delay_ms: DEFAULT_QUERY_DELAY_MS,
            inter_unit_delay_ms: DEFAULT_INTER_UNIT_DELAY_MS,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            response_budget_ms: DEFAULT_RESPONSE_BUDGET_MS,
            read_poll_ms: DEFAULT_READ_POLL_MS,
            failure_settle_ms: DEFAULT_FAILURE_SETTLE_MS,
            probe_timeout_ms: DEFAULT_PROBE_TIMEOUT_MS,
            max_retries: 3,
            network_retries: 3,
            retry_backoff_base: 1,
            valid_min: 0.0,
            high_threshold: 42.0,
            low_threshold: 0.0,
            abs_deviation_threshold: 2.0,
            deviation_threshold: 0.1,
            rise_threshold: 2.0,
            disconnection_lag_threshold: 0.5,
            cabinet_over_temp_threshold: 35.0,
            cold_threshold: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoltageConfig {
    pub multiplexer_address: u8,
    pub meter_address: u8,
    pub config_register: u8,
    pub conversion_register: u8,
    pub continuous_mode_config: u16,
    pub sample_rate_config: u16,
    pub gain_config: u16,
    pub full_scale_volts: f64,
    pub divider_ratio: f64,
    /// Per-bank multipliers; empty means 1.0 for every bank.
    pub calibration_factors: Vec<f64>,
    pub settle_ms: u64,
    pub read_attempts: u32,
    pub low_threshold: f64,
    pub high_threshold: f64,
}

impl Default for VoltageConfig {
    fn default() -> Self {
        Self {
            multiplexer_address: DEFAULT_MUX_ADDRESS,
            meter_address: DEFAULT_METER_ADDRESS,
            config_register: 0x01,
            conversion_register: 0x00,
            continuous_mode_config: CONTINUOUS_MODE_CONFIG,
            sample_rate_config: SAMPLE_RATE_CONFIG,
            gain_config: GAIN_CONFIG,
            full_scale_volts: 6.144,
            divider_ratio: 0.01592,
            calibration_factors: Vec::new(),
            settle_ms: 50,
            read_attempts: 2,
            low_threshold: 18.5,
            high_threshold: 21.0,
        }
    }
}

impl VoltageConfig {
    pub fn config_word(&self) -> u16 {
        self.continuous_mode_config | self.sample_rate_config | self.gain_config
    }

    pub fn calibration_factor(&self, bank: usize) -> f64 {
        bank.checked_sub(1)
            .and_then(|i| self.calibration_factors.get(i))
            .copied()
            .unwrap_or(1.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BalanceConfig {
    pub voltage_difference_to_balance: f64,
    pub duration_s: u64,
    pub rest_period_s: u64,
    pub sample_interval_ms: u64,
    pub min_voltage_delta: f64,
    pub drift_tolerance: f64,
    /// `"source-dest"` to the relay indices that connect that pair.
    pub relay_mapping: BTreeMap<String, Vec<u8>>,
}

impl Default for BalanceConfig {
    fn default() -> Self {
        Self {
            voltage_difference_to_balance: 0.1,
            duration_s: 5,
            rest_period_s: 60,
            sample_interval_ms: 2000,
            min_voltage_delta: 0.01,
            drift_tolerance: 0.0,
            relay_mapping: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub i2c_bus: u8,
    pub gpio_base: String,
    pub relay_pins: Vec<u32>,
    pub converter_pin: u32,
    pub alarm_pin: u32,
    pub fan_pin: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            i2c_bus: 1,
            gpio_base: "/sys/class/gpio".into(),
            relay_pins: DEFAULT_RELAY_PINS.to_vec(),
            converter_pin: DEFAULT_CONVERTER_PIN,
            alarm_pin: DEFAULT_ALARM_PIN,
            fan_pin: DEFAULT_FAN_PIN,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelfTestConfig {
    pub enabled: bool,
    pub attempts: u32,
    pub retry_wait_s: u64,
}

impl Default for SelfTestConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            attempts: 5,
            retry_wait_s: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub bind: String,
    pub event_log_size: usize,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".into(),
            event_log_size: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where calibration offsets are persisted.
    pub data_dir: PathBuf,
    pub pack: PackConfig,
    pub temperature: TemperatureConfig,
    pub voltage: VoltageConfig,
    pub balance: BalanceConfig,
    pub hardware: HardwareConfig,
    pub self_test: SelfTestConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            pack: PackConfig::default(),
            temperature: TemperatureConfig::default(),
            voltage: VoltageConfig::default(),
            balance: BalanceConfig::default(),
            hardware: HardwareConfig::default(),
            self_test: SelfTestConfig::default(),
            status: StatusConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn topology(&self) -> Result<Topology, ConfigError> {
        Topology::new(
            self.pack.num_series_banks,
            self.pack.sensors_per_bank,
            self.pack.number_of_parallel_batteries,
        )
        .map_err(|e| ConfigError::Invalid(vec![e.to_string()]))
    }

    pub fn relay_table(&self) -> Result<RelayTable, ConfigError> {
        RelayTable::from_mapping(
            &self.balance.relay_mapping,
            self.pack.num_series_banks,
            self.hardware.relay_pins.len(),
        )
        .map_err(|errors| ConfigError::Invalid(errors.iter().map(RelayMappingError::to_string).collect()))
    }

    /// Bus targets in battery order, pairing each unit id with its port.
    pub fn unit_targets(&self) -> Vec<UnitTarget> {
        self.temperature
            .unit_ids
            .iter()
            .enumerate()
            .map(|(i, &unit_id)| UnitTarget {
                unit_id,
                port: self
                    .temperature
                    .unit_ports
                    .get(i)
                    .copied()
                    .unwrap_or(self.temperature.port),
            })
            .collect()
    }

    /// Checks every constraint and reports all violations at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let pack = &self.pack;
        let temp = &self.temperature;
        let volt = &self.voltage;

        if pack.num_series_banks == 0 || pack.num_series_banks > MAX_SERIES_BANKS {
            problems.push(format!(
                "num_series_banks must be between 1 and {MAX_SERIES_BANKS}, got {}",
                pack.num_series_banks
            ));
        }
        if pack.sensors_per_bank == 0 {
            problems.push("sensors_per_bank must be at least 1".to_string());
        }
        if pack.number_of_parallel_batteries == 0 {
            problems.push("number_of_parallel_batteries must be at least 1".to_string());
        }
        if temp.unit_ids.len() != pack.number_of_parallel_batteries {
            problems.push(format!(
                "unit_ids has {} entries but number_of_parallel_batteries is {}",
                temp.unit_ids.len(),
                pack.number_of_parallel_batteries
            ));
        }
        if !temp.unit_ports.is_empty() && temp.unit_ports.len() != temp.unit_ids.len() {
            problems.push(format!(
                "unit_ports has {} entries for {} units",
                temp.unit_ports.len(),
                temp.unit_ids.len()
            ));
        }
        let sensors_per_battery = pack.num_series_banks * pack.sensors_per_bank;
        if sensors_per_battery > usize::from(u8::MAX / 2) {
            problems.push(format!(
                "{sensors_per_battery} sensors per battery exceed one register read"
            ));
        }
        if temp.max_retries == 0 || temp.network_retries == 0 {
            problems.push("retry budgets must be at least 1".to_string());
        }
        if temp.scaling_factor == 0.0 {
            problems.push("scaling_factor must be non-zero".to_string());
        }
        if temp.low_threshold >= temp.high_threshold {
            problems.push(format!(
                "temperature low_threshold {} must be below high_threshold {}",
                temp.low_threshold, temp.high_threshold
            ));
        }
        if volt.low_threshold >= volt.high_threshold {
            problems.push(format!(
                "voltage low_threshold {} must be below high_threshold {}",
                volt.low_threshold, volt.high_threshold
            ));
        }
        if volt.divider_ratio <= 0.0 {
            problems.push("divider_ratio must be positive".to_string());
        }
        if volt.read_attempts == 0 {
            problems.push("voltage read_attempts must be at least 1".to_string());
        }
        if !volt.calibration_factors.is_empty()
            && volt.calibration_factors.len() != pack.num_series_banks
        {
            problems.push(format!(
                "calibration_factors has {} entries for {} banks",
                volt.calibration_factors.len(),
                pack.num_series_banks
            ));
        }
        if self.balance.sample_interval_ms == 0 {
            problems.push("balance sample_interval_ms must be positive".to_string());
        }
        if self.status.event_log_size == 0 {
            problems.push("event_log_size must be at least 1".to_string());
        }
        if let Err(errors) = RelayTable::from_mapping(
            &self.balance.relay_mapping,
            pack.num_series_banks,
            self.hardware.relay_pins.len(),
        ) {
            problems.extend(errors.iter().map(RelayMappingError::to_string));
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}
