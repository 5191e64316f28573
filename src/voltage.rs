use crate::config::VoltageConfig;
use crate::hardware::{Bus, BusError, Clock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

const ADC_FULL_SCALE_CODE: f64 = 32767.0;
const START_CONVERSION: u8 = 0x01;
const SAMPLES_PER_ROUND: usize = 2;
const OUTLIER_TOLERANCE: f64 = 0.05; // 5% of the round mean

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AcquisitionFailure {
    #[error("bank {bank} out of range 1..={banks}")]
    BankOutOfRange { bank: usize, banks: usize },
    #[error("bank {bank} did not stabilise after {attempts} attempts")]
    Unstable { bank: usize, attempts: u32 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoltageSettings {
    pub multiplexer_address: u8,
    pub meter_address: u8,
    pub config_register: u8,
    pub conversion_register: u8,
    pub config_word: u16,
    pub full_scale_volts: f64,
    pub divider_ratio: f64,
    pub calibration_factors: Vec<f64>,
    pub settle: Duration,
    pub read_attempts: u32,
}

impl VoltageSettings {
    pub fn from_config(config: &VoltageConfig, banks: usize) -> Self {
        Self {
            multiplexer_address: config.multiplexer_address,
            meter_address: config.meter_address,
            config_register: config.config_register,
            conversion_register: config.conversion_register,
            config_word: config.config_word(),
            full_scale_volts: config.full_scale_volts,
            divider_ratio: config.divider_ratio,
            calibration_factors: (1..=banks).map(|b| config.calibration_factor(b)).collect(),
            settle: Duration::from_millis(config.settle_ms),
            read_attempts: config.read_attempts,
        }
    }

    pub fn code_to_volts(&self, raw: u16, bank: usize) -> f64 {
        let factor = self
            .calibration_factors
            .get(bank.saturating_sub(1))
            .copied()
            .unwrap_or(1.0);
        f64::from(raw) * (self.full_scale_volts / ADC_FULL_SCALE_CODE) / self.divider_ratio * factor
    }

    /// Inverse of [`code_to_volts`](Self::code_to_volts), used by the simulated front end.
    pub fn volts_to_code(&self, volts: f64, bank: usize) -> u16 {
        let factor = self
            .calibration_factors
            .get(bank.saturating_sub(1))
            .copied()
            .unwrap_or(1.0);
        let code = volts / factor * self.divider_ratio / (self.full_scale_volts / ADC_FULL_SCALE_CODE);
        code.round().clamp(0.0, f64::from(u16::MAX)) as u16
    }
}

/// Mean of the samples lying within 5% of the round mean, if any do.
/// A zero mean compares absolute differences instead.
pub fn stable_mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let mean = samples.iter().sum::<f64>() / samples.len() as f64;
    let scale = if mean == 0.0 { 1.0 } else { mean.abs() };
    let survivors: Vec<f64> = samples
        .iter()
        .copied()
        .filter(|s| (s - mean).abs() / scale <= OUTLIER_TOLERANCE)
        .collect();
    if survivors.is_empty() {
        None
    } else {
        Some(survivors.iter().sum::<f64>() / survivors.len() as f64)
    }
}

/// Sole owner of the front-end bus.
pub struct VoltageReader {
    bus: Box<dyn Bus>,
    clock: Arc<dyn Clock>,
    settings: VoltageSettings,
    banks: usize,
}

impl VoltageReader {
    pub fn new(bus: Box<dyn Bus>, clock: Arc<dyn Clock>, settings: VoltageSettings, banks: usize) -> Self {
        Self {
            bus,
            clock,
            settings,
            banks,
        }
    }

    pub fn settings(&self) -> &VoltageSettings {
        &self.settings
    }

    pub fn banks(&self) -> usize {
        self.banks
    }

    fn sample(&mut self, bank: usize) -> Result<u16, BusError> {
        let s = &self.settings;
        // Banks map one-to-one onto multiplexer outputs.
        let channel = u8::try_from(bank - 1).map_err(|_| BusError::NoChannel(u8::MAX))?;
        self.bus.select_channel(s.multiplexer_address, channel)?;
        self.bus.write_word(s.meter_address, s.config_register, s.config_word)?;
        self.bus.write_byte(s.meter_address, START_CONVERSION)?;
        self.clock.sleep(s.settle);
        let word = self.bus.read_word(s.meter_address, s.conversion_register)?;
        // SMBus words are little-endian, the converter answers big-endian.
        Ok(word.swap_bytes())
    }

    /// Averaged, outlier-filtered voltage of one bank.
    pub fn read_bank(&mut self, bank: usize) -> Result<f64, AcquisitionFailure> {
        if bank == 0 || bank > self.banks {
            return Err(AcquisitionFailure::BankOutOfRange {
                bank,
                banks: self.banks,
            });
        }

        let attempts = self.settings.read_attempts.max(1);
        for attempt in 1..=attempts {
            let mut samples = Vec::with_capacity(SAMPLES_PER_ROUND);
            for _ in 0..SAMPLES_PER_ROUND {
                match self.sample(bank) {
                    Ok(raw) => {
                        debug!("Raw ADC for bank {}: {}", bank, raw);
                        samples.push(self.settings.code_to_volts(raw, bank));
                    }
                    Err(e) => {
                        error!("Bus error reading bank {}: {}", bank, e);
                        break;
                    }
                }
            }
            if samples.len() == SAMPLES_PER_ROUND {
                if let Some(volts) = stable_mean(&samples) {
                    info!("Voltage read successful for bank {}: {:.2}V", bank, volts);
                    return Ok(volts);
                }
            }
            warn!("Readings for bank {} inconsistent (attempt {}/{})", bank, attempt, attempts);
        }

        error!("No stable voltage for bank {} after {} attempts", bank, attempts);
        Err(AcquisitionFailure::Unstable { bank, attempts })
    }

    /// Every bank in order; `None` marks a bank that never stabilised.
    pub fn read_all(&mut self) -> Vec<Option<f64>> {
        (1..=self.banks).map(|bank| self.read_bank(bank).ok()).collect()
    }
}
