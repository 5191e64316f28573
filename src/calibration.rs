//! One-shot sensor calibration.
//!
//! The first poll in which every channel reads above `valid_min` fixes a
//! per-channel additive offset that pulls each sensor onto the median of
//! that poll. Offsets are persisted and never recomputed while they exist.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{error, info, warn};

pub const OFFSETS_FILE: &str = "offsets.txt";

/// One channel's reading for a poll.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum RawReading {
    Value(f64),
    /// The unit serving this channel could not be read at all.
    UnitFailed,
}

impl RawReading {
    pub fn value(self) -> Option<f64> {
        match self {
            RawReading::Value(v) => Some(v),
            RawReading::UnitFailed => None,
        }
    }

    pub fn is_valid(self, valid_min: f64) -> bool {
        self.value().is_some_and(|v| v > valid_min)
    }
}

#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("calibration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("calibration file {path} line {line}: not a number")]
    Parse { path: PathBuf, line: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationRecord {
    pub median: f64,
    pub offsets: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CalibrationState {
    Uncalibrated,
    Calibrated { median: f64, offsets: Vec<f64> },
}

pub trait CalibrationStore: Send {
    /// Persisted record for `channels` channels. A record of any other
    /// length is treated as absent.
    fn load(&self, channels: usize) -> Result<Option<CalibrationRecord>, CalibrationError>;
    fn save(&mut self, median: f64, offsets: &[f64]) -> Result<(), CalibrationError>;
}

/// Plain-text store: the median on the first line, then one offset per line.
#[derive(Debug, Clone)]
pub struct FileCalibrationStore {
    path: PathBuf,
}

impl FileCalibrationStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(OFFSETS_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CalibrationStore for FileCalibrationStore {
    fn load(&self, channels: usize) -> Result<Option<CalibrationRecord>, CalibrationError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CalibrationError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut values = Vec::new();
        for (i, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: f64 = line.parse().map_err(|_| CalibrationError::Parse {
                path: self.path.clone(),
                line: i + 1,
            })?;
            values.push(value);
        }

        let Some((&median, offsets)) = values.split_first() else {
            return Ok(None);
        };
        if offsets.len() != channels {
            warn!(
                "Offset count mismatch in {}: {} offsets for {} channels, ignoring",
                self.path.display(),
                offsets.len(),
                channels
            );
            return Ok(None);
        }
        Ok(Some(CalibrationRecord {
            median,
            offsets: offsets.to_vec(),
        }))
    }

    fn save(&mut self, median: f64, offsets: &[f64]) -> Result<(), CalibrationError> {
        let mut text = format!("{median}\n");
        for offset in offsets {
            text.push_str(&format!("{offset}\n"));
        }
        std::fs::write(&self.path, text).map_err(|source| CalibrationError::Io {
            path: self.path.clone(),
            source,
        })?;
        info!("Saved {} offsets to {}", offsets.len(), self.path.display());
        Ok(())
    }
}

/// In-memory store for simulation and tests. Clones share one record.
#[derive(Debug, Clone, Default)]
pub struct MemoryCalibrationStore {
    inner: Arc<Mutex<Option<CalibrationRecord>>>,
}

impl MemoryCalibrationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(record: CalibrationRecord) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Some(record))),
        }
    }

    pub fn record(&self) -> Option<CalibrationRecord> {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl CalibrationStore for MemoryCalibrationStore {
    fn load(&self, channels: usize) -> Result<Option<CalibrationRecord>, CalibrationError> {
        Ok(self.record().filter(|r| r.offsets.len() == channels))
    }

    fn save(&mut self, median: f64, offsets: &[f64]) -> Result<(), CalibrationError> {
        let record = CalibrationRecord {
            median,
            offsets: offsets.to_vec(),
        };
        match self.inner.lock() {
            Ok(mut guard) => *guard = Some(record),
            Err(poisoned) => *poisoned.into_inner() = Some(record),
        }
        Ok(())
    }
}

/// Median of `values`; the mean of the middle pair for even counts.
pub fn median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

#[derive(Debug, Clone)]
pub struct Calibrator {
    state: CalibrationState,
    channels: usize,
    valid_min: f64,
}

impl Calibrator {
    pub fn new(channels: usize, valid_min: f64) -> Self {
        Self {
            state: CalibrationState::Uncalibrated,
            channels,
            valid_min,
        }
    }

    pub fn state(&self) -> &CalibrationState {
        &self.state
    }

    pub fn is_calibrated(&self) -> bool {
        matches!(self.state, CalibrationState::Calibrated { .. })
    }

    pub fn median(&self) -> Option<f64> {
        match &self.state {
            CalibrationState::Calibrated { median, .. } => Some(*median),
            CalibrationState::Uncalibrated => None,
        }
    }

    pub fn offsets(&self) -> Option<&[f64]> {
        match &self.state {
            CalibrationState::Calibrated { offsets, .. } => Some(offsets),
            CalibrationState::Uncalibrated => None,
        }
    }

    /// Adopts a persisted record, if the store has one of the right size.
    pub fn restore(&mut self, store: &dyn CalibrationStore) -> Result<bool, CalibrationError> {
        if self.is_calibrated() {
            return Ok(true);
        }
        match store.load(self.channels)? {
            Some(record) => {
                info!("Loaded calibration offsets, median {:.1}°C", record.median);
                self.state = CalibrationState::Calibrated {
                    median: record.median,
                    offsets: record.offsets,
                };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Calibrates from `raw` if not yet calibrated and every channel is
    /// valid. Returns true only on the poll that performs calibration.
    pub fn observe(&mut self, raw: &[RawReading], store: &mut dyn CalibrationStore) -> bool {
        if self.is_calibrated() || raw.len() != self.channels {
            return false;
        }
        let values: Vec<f64> = raw
            .iter()
            .filter(|r| r.is_valid(self.valid_min))
            .filter_map(|r| r.value())
            .collect();
        if values.len() != self.channels {
            return false;
        }
        let Some(median) = median(&values) else {
            return false;
        };
        let offsets: Vec<f64> = values.iter().map(|v| median - v).collect();
        if let Err(e) = store.save(median, &offsets) {
            error!("Failed to persist calibration: {}", e);
        }
        info!("Temperature calibration set, median {:.1}°C", median);
        self.state = CalibrationState::Calibrated { median, offsets };
        true
    }

    /// Calibrated value per channel; `None` for invalid or failed readings.
    pub fn apply(&self, raw: &[RawReading]) -> Vec<Option<f64>> {
        raw.iter()
            .enumerate()
            .map(|(i, r)| {
                let value = r.value().filter(|&v| v > self.valid_min)?;
                match &self.state {
                    CalibrationState::Calibrated { offsets, .. } => {
                        Some(value + offsets.get(i).copied().unwrap_or(0.0))
                    }
                    CalibrationState::Uncalibrated => Some(value),
                }
            })
            .collect()
    }
}
