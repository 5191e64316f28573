//! Per-channel temperature anomaly detection.
//!
//! Each poll runs the static checks (invalid, high, low, deviation from the
//! bank median) over every channel, then the history checks (abnormal rise,
//! lag from the bank group, sudden disconnection) against the previous
//! poll. History checks are skipped on the very first poll. Channels whose
//! unit failed outright are left to the unit failure alert and produce no
//! per-channel alerts.

use crate::alerts::{Alert, AlertKind, AnomalyKind};
use crate::calibration::{median, RawReading};
use crate::config::TemperatureConfig;
use crate::topology::Topology;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AnomalyThresholds {
    pub valid_min: f64,
    pub high: f64,
    pub low: f64,
    pub abs_deviation: f64,
    pub rel_deviation: f64,
    pub rise: f64,
    pub lag: f64,
    pub cabinet_over_temp: f64,
    pub poll_interval_s: u64,
}

impl AnomalyThresholds {
    pub fn from_config(config: &TemperatureConfig) -> Self {
        Self {
            valid_min: config.valid_min,
            high: config.high_threshold,
            low: config.low_threshold,
            abs_deviation: config.abs_deviation_threshold,
            rel_deviation: config.deviation_threshold,
            rise: config.rise_threshold,
            lag: config.disconnection_lag_threshold,
            cabinet_over_temp: config.cabinet_over_temp_threshold,
            poll_interval_s: config.poll_interval_s,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BankStats {
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub invalid_count: usize,
}

/// Median/min/max of the valid calibrated readings of each bank, across
/// every parallel battery. A bank with no valid reading reports zeros.
pub fn bank_stats(topology: &Topology, calibrated: &[Option<f64>]) -> Vec<BankStats> {
    (1..=topology.num_series_banks())
        .map(|bank| {
            let channels = topology.bank_channels(bank).unwrap_or_default();
            let valid: Vec<f64> = channels
                .iter()
                .filter_map(|&ch| calibrated.get(ch - 1).copied().flatten())
                .collect();
            let invalid_count = channels.len() - valid.len();
            match median(&valid) {
                Some(m) => BankStats {
                    median: m,
                    min: valid.iter().copied().fold(f64::INFINITY, f64::min),
                    max: valid.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                    invalid_count,
                },
                None => BankStats {
                    invalid_count,
                    ..BankStats::default()
                },
            }
        })
        .collect()
}

/// Median of every valid calibrated reading in the cabinet.
pub fn overall_median(calibrated: &[Option<f64>]) -> Option<f64> {
    let valid: Vec<f64> = calibrated.iter().filter_map(|v| *v).collect();
    median(&valid)
}

/// Which anomaly kinds were active on each channel last poll, so repeated
/// conditions can be told apart from new ones.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AlertState {
    active: Vec<u8>,
}

impl AlertState {
    pub fn new(channels: usize) -> Self {
        Self {
            active: vec![0; channels],
        }
    }

    pub fn is_active(&self, channel: usize, kind: AnomalyKind) -> bool {
        self.active
            .get(channel.wrapping_sub(1))
            .is_some_and(|mask| mask & kind.bit() != 0)
    }

    pub fn active_kinds(&self, channel: usize) -> Vec<AnomalyKind> {
        AnomalyKind::ALL
            .into_iter()
            .filter(|&k| self.is_active(channel, k))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.active.iter().map(|m| m.count_ones() as usize).sum()
    }

    fn replace(&mut self, next: Vec<u8>) -> Vec<u8> {
        std::mem::replace(&mut self.active, next)
    }
}

pub struct AnomalyEngine {
    topology: Topology,
    thresholds: AnomalyThresholds,
    previous: Option<Vec<Option<f64>>>,
    previous_bank_medians: Vec<f64>,
    state: AlertState,
}

impl AnomalyEngine {
    pub fn new(topology: Topology, thresholds: AnomalyThresholds) -> Self {
        Self {
            topology,
            thresholds,
            previous: None,
            previous_bank_medians: vec![0.0; topology.num_series_banks()],
            state: AlertState::new(topology.total_channels()),
        }
    }

    pub fn thresholds(&self) -> &AnomalyThresholds {
        &self.thresholds
    }

    pub fn alert_state(&self) -> &AlertState {
        &self.state
    }

    pub fn has_history(&self) -> bool {
        self.previous.is_some()
    }

    /// Runs every check for one poll and rolls the history forward.
    pub fn evaluate(
        &mut self,
        raw: &[RawReading],
        calibrated: &[Option<f64>],
        stats: &[BankStats],
    ) -> Vec<Alert> {
        let t = self.thresholds;
        let total = self.topology.total_channels().min(raw.len()).min(calibrated.len());
        let mut found: Vec<(usize, AnomalyKind, String)> = Vec::new();

        for ch in 1..=total {
            let reading = raw[ch - 1];
            let Some(value) = reading.value() else {
                continue;
            };
            if value <= t.valid_min {
                found.push((
                    ch,
                    AnomalyKind::Invalid,
                    format!("Invalid reading (≤ {}).", t.valid_min),
                ));
                continue;
            }
            let Some(calib) = calibrated[ch - 1] else {
                continue;
            };
            if calib > t.high {
                found.push((ch, AnomalyKind::High, format!("High temp ({calib:.1}°C > {}°C).", t.high)));
            }
            if calib < t.low {
                found.push((ch, AnomalyKind::Low, format!("Low temp ({calib:.1}°C < {}°C).", t.low)));
            }

            let bank_median = self
                .topology
                .bank_of(ch)
                .ok()
                .and_then(|b| stats.get(b - 1))
                .map_or(0.0, |s| s.median);
            let abs_dev = (calib - bank_median).abs();
            let rel_dev = if bank_median == 0.0 { 0.0 } else { abs_dev / bank_median.abs() };
            if abs_dev > t.abs_deviation || rel_dev > t.rel_deviation {
                found.push((
                    ch,
                    AnomalyKind::Deviation,
                    format!(
                        "Deviation from bank median (abs {abs_dev:.1}°C or {:.2}%).",
                        rel_dev * 100.0
                    ),
                ));
            }
        }

        let bank_medians: Vec<f64> = stats.iter().map(|s| s.median).collect();
        if let Some(previous) = &self.previous {
            for ch in 1..=total {
                if raw[ch - 1] == RawReading::UnitFailed {
                    continue;
                }
                let prev = previous.get(ch - 1).copied().flatten();
                match (calibrated[ch - 1], prev) {
                    (Some(current), Some(prev)) => {
                        let rise = current - prev;
                        if rise > t.rise {
                            found.push((
                                ch,
                                AnomalyKind::Rise,
                                format!("Abnormal rise ({rise:.1}°C in {}s).", t.poll_interval_s),
                            ));
                        }
                        let bank = self.topology.bank_of(ch).unwrap_or(1);
                        let bank_rise = bank_medians.get(bank - 1).copied().unwrap_or(0.0)
                            - self.previous_bank_medians.get(bank - 1).copied().unwrap_or(0.0);
                        if (rise - bank_rise).abs() > t.lag {
                            found.push((
                                ch,
                                AnomalyKind::Lag,
                                format!("Lag from bank group ({rise:.1}°C vs {bank_rise:.1}°C)."),
                            ));
                        }
                    }
                    (None, Some(_)) => {
                        found.push((ch, AnomalyKind::Disconnection, "Sudden disconnection.".to_string()));
                    }
                    _ => {}
                }
            }
        } else {
            debug!("First poll, history checks skipped");
        }

        let mut next_state = vec![0u8; self.topology.total_channels()];
        let mut alerts = Vec::with_capacity(found.len());
        for (ch, kind, detail) in found {
            let Ok(location) = self.topology.locate(ch) else {
                continue;
            };
            let mut alert = Alert::at(kind, location, &detail);
            alert.is_new = !self.state.is_active(ch, kind);
            if alert.is_new {
                warn!("{}", alert.message);
            }
            next_state[ch - 1] |= kind.bit();
            alerts.push(alert);
        }
        self.state.replace(next_state);
        self.previous = Some(calibrated.to_vec());
        self.previous_bank_medians = bank_medians;
        alerts
    }

    /// Cabinet-wide over-temperature check on the overall median.
    pub fn cabinet_check(&self, calibrated: &[Option<f64>]) -> Option<Alert> {
        let overall = overall_median(calibrated)?;
        if overall > self.thresholds.cabinet_over_temp {
            Some(Alert::new(
                AlertKind::CabinetOverTemp,
                format!(
                    "Cabinet over temp: {overall:.1}°C > {}°C. Fan on.",
                    self.thresholds.cabinet_over_temp
                ),
            ))
        } else {
            None
        }
    }
}
