//! Charge balancing between series banks.
//!
//! The controller never trusts its relays. Every operation records the
//! voltage trend of both banks while the converter runs and, once the
//! converter is off, checks that the source actually fell and the
//! destination actually rose. A failed check latches the balancer off
//! until an operator resets it.
//!
//! ```text
//! Idle -> Engaged -> Verifying -> Verified
//!                             \-> Failed (latched)
//! ```

use crate::config::BalanceConfig;
use crate::hardware::{Actuator, ActuatorError, Clock, Line};
use crate::voltage::VoltageReader;
use arrayvec::ArrayVec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MAX_RELAY_LINES: usize = 8;
pub const MIN_TREND_SAMPLES: usize = 3;

pub type LineSet = ArrayVec<u8, MAX_RELAY_LINES>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayMappingError {
    #[error("relay mapping key '{0}' is not of the form 'source-dest'")]
    MalformedKey(String),
    #[error("relay mapping key '{key}' names a bank outside 1..={banks}")]
    BankOutOfRange { key: String, banks: usize },
    #[error("relay mapping key '{0}' maps a bank onto itself")]
    SameBank(String),
    #[error("relay mapping '{key}' uses relay {line} but only {lines} relays exist")]
    LineOutOfRange { key: String, line: u8, lines: usize },
    #[error("relay mapping '{0}' lists too many relays")]
    TooManyLines(String),
    #[error("relay mapping '{0}' is empty")]
    EmptyLineSet(String),
    #[error("relay mapping missing pair {source_bank}-{dest_bank}")]
    MissingPair { source_bank: usize, dest_bank: usize },
}

/// Relay lines for every ordered pair of distinct banks, indexed by
/// `(source - 1, dest - 1)`. Built once from configuration; a table that
/// exists is complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTable {
    banks: usize,
    relay_lines: usize,
    table: Vec<LineSet>,
}

impl RelayTable {
    pub fn from_mapping(
        mapping: &BTreeMap<String, Vec<u8>>,
        banks: usize,
        relay_lines: usize,
    ) -> Result<Self, Vec<RelayMappingError>> {
        let mut errors = Vec::new();
        let mut table: Vec<Option<LineSet>> = vec![None; banks * banks];

        for (key, lines) in mapping {
            let Some((source, dest)) = parse_pair(key) else {
                errors.push(RelayMappingError::MalformedKey(key.clone()));
                continue;
            };
            if source == 0 || dest == 0 || source > banks || dest > banks {
                errors.push(RelayMappingError::BankOutOfRange {
                    key: key.clone(),
                    banks,
                });
                continue;
            }
            if source == dest {
                errors.push(RelayMappingError::SameBank(key.clone()));
                continue;
            }
            if lines.is_empty() {
                errors.push(RelayMappingError::EmptyLineSet(key.clone()));
                continue;
            }
            if let Some(&line) = lines.iter().find(|&&l| usize::from(l) >= relay_lines) {
                errors.push(RelayMappingError::LineOutOfRange {
                    key: key.clone(),
                    line,
                    lines: relay_lines,
                });
                continue;
            }
            let mut set = LineSet::new();
            if set.try_extend_from_slice(lines).is_err() {
                errors.push(RelayMappingError::TooManyLines(key.clone()));
                continue;
            }
            table[(source - 1) * banks + (dest - 1)] = Some(set);
        }

        for source in 1..=banks {
            for dest in (1..=banks).filter(|&d| d != source) {
                if table[(source - 1) * banks + (dest - 1)].is_none() {
                    errors.push(RelayMappingError::MissingPair {
                        source_bank: source,
                        dest_bank: dest,
                    });
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(Self {
            banks,
            relay_lines,
            table: table.into_iter().map(Option::unwrap_or_default).collect(),
        })
    }

    pub fn banks(&self) -> usize {
        self.banks
    }

    pub fn relay_lines(&self) -> usize {
        self.relay_lines
    }

    /// Lines connecting `source` to `dest`, or `None` for a pair that is
    /// not a distinct in-range bank pair.
    pub fn lines(&self, source: usize, dest: usize) -> Option<&[u8]> {
        if source == dest || source == 0 || dest == 0 || source > self.banks || dest > self.banks {
            return None;
        }
        Some(&self.table[(source - 1) * self.banks + (dest - 1)])
    }

    /// The pair whose line set is exactly `asserted`, if any.
    pub fn pair_for(&self, asserted: &[u8]) -> Option<(usize, usize)> {
        let mut wanted: LineSet = asserted.iter().copied().take(MAX_RELAY_LINES).collect();
        wanted.sort_unstable();
        (1..=self.banks)
            .flat_map(|s| (1..=self.banks).map(move |d| (s, d)))
            .filter(|(s, d)| s != d)
            .find(|&(s, d)| {
                self.lines(s, d).is_some_and(|lines| {
                    let mut set: LineSet = lines.iter().copied().collect();
                    set.sort_unstable();
                    set == wanted
                })
            })
    }
}

fn parse_pair(key: &str) -> Option<(usize, usize)> {
    let (source, dest) = key.split_once('-')?;
    Some((source.trim().parse().ok()?, dest.trim().parse().ok()?))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalanceSettings {
    pub spread_threshold: f64,
    pub duration: Duration,
    pub rest_period: Duration,
    pub sample_interval: Duration,
    pub min_voltage_delta: f64,
    pub drift_tolerance: f64,
}

impl BalanceSettings {
    pub fn from_config(config: &BalanceConfig) -> Self {
        Self {
            spread_threshold: config.voltage_difference_to_balance,
            duration: Duration::from_secs(config.duration_s),
            rest_period: Duration::from_secs(config.rest_period_s),
            sample_interval: Duration::from_millis(config.sample_interval_ms),
            min_voltage_delta: config.min_voltage_delta,
            drift_tolerance: config.drift_tolerance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestOrigin {
    Automatic,
    Manual,
    SelfTest,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BalanceRequest {
    pub source: usize,
    pub dest: usize,
    pub is_heating: bool,
    pub origin: RequestOrigin,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BalanceBlocked {
    #[error("balancing already in progress")]
    InProgress,
    #[error("balancer latched after a failed verification")]
    Latched,
    #[error("temperature alerts outstanding")]
    TemperatureAlerts,
    #[error("pack needs attention")]
    NeedsAttention,
    #[error("fewer than two banks")]
    NotEnoughBanks,
    #[error("destination bank {bank} reads {volts:.2}V")]
    DestinationDead { bank: usize, volts: f64 },
    #[error("rest period: {remaining_s}s remaining")]
    RestPeriod { remaining_s: u64 },
    #[error("spread {spread:.3}V not above {threshold}V")]
    SpreadBelowThreshold { spread: f64, threshold: f64 },
    #[error("no relay path from bank {source_bank} to bank {dest_bank}")]
    NoRelayPath { source_bank: usize, dest_bank: usize },
    #[error("actuator fault: {0}")]
    Actuator(#[from] ActuatorError),
}

/// Rejections returned to a manual balance request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ManualBalanceRejected {
    #[error("Balancing already in progress")]
    InProgress,
    #[error("Cannot balance with active alerts")]
    ActiveAlerts,
    #[error("Not enough battery banks")]
    NotEnoughBanks,
    #[error("Voltage difference too small for balancing")]
    SpreadTooSmall { spread: f64, threshold: f64 },
}

/// What the guards look at.
#[derive(Debug, Clone, Copy)]
pub struct GuardInput<'a> {
    pub voltages: &'a [Option<f64>],
    pub temperature_alerts: bool,
    pub needs_attention: bool,
    pub is_heating: bool,
}

/// `(highest bank, lowest bank, highest volts, lowest volts)`, 1-based.
/// Unreadable banks count as 0 V. Ties go to the lowest bank number.
pub fn select_pair(voltages: &[Option<f64>]) -> Option<(usize, usize, f64, f64)> {
    if voltages.len() < 2 {
        return None;
    }
    let volts: Vec<f64> = voltages.iter().map(|v| v.unwrap_or(0.0)).collect();
    let mut high = 0;
    let mut low = 0;
    for (i, &v) in volts.iter().enumerate() {
        if v > volts[high] {
            high = i;
        }
        if v < volts[low] {
            low = i;
        }
    }
    Some((high + 1, low + 1, volts[high], volts[low]))
}

/// Picks the pair a manual trigger would balance, without touching hardware.
pub fn plan_manual(
    voltages: &[Option<f64>],
    has_alerts: bool,
    balancing: bool,
    threshold: f64,
) -> Result<BalanceRequest, ManualBalanceRejected> {
    if balancing {
        return Err(ManualBalanceRejected::InProgress);
    }
    if has_alerts {
        return Err(ManualBalanceRejected::ActiveAlerts);
    }
    let (source, dest, max_v, min_v) =
        select_pair(voltages).ok_or(ManualBalanceRejected::NotEnoughBanks)?;
    let spread = max_v - min_v;
    if spread < threshold {
        return Err(ManualBalanceRejected::SpreadTooSmall { spread, threshold });
    }
    Ok(BalanceRequest {
        source,
        dest,
        is_heating: false,
        origin: RequestOrigin::Manual,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Verdict {
    Verified,
    NoVoltageChange,
    InsufficientSamples,
}

/// Checks a finished trend. The source must fall and the destination must
/// rise, each by at least `min_delta - drift_tolerance` (floored at zero).
pub fn verify_trend(
    initial: (f64, f64),
    final_: (f64, f64),
    samples: usize,
    min_delta: f64,
    drift_tolerance: f64,
) -> (Verdict, f64, f64) {
    let source_change = final_.0 - initial.0;
    let dest_change = final_.1 - initial.1;
    if samples < MIN_TREND_SAMPLES {
        return (Verdict::InsufficientSamples, source_change, dest_change);
    }
    let required = (min_delta - drift_tolerance).max(0.0);
    let moved = source_change < 0.0
        && dest_change > 0.0
        && source_change.abs() >= required
        && dest_change >= required;
    let verdict = if moved {
        Verdict::Verified
    } else {
        Verdict::NoVoltageChange
    };
    (verdict, source_change, dest_change)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOperation {
    pub source_bank: usize,
    pub dest_bank: usize,
    pub origin: RequestOrigin,
    pub started_at: Duration,
    pub is_heating: bool,
    pub initial_source_v: f64,
    pub initial_dest_v: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceReport {
    pub source_bank: usize,
    pub dest_bank: usize,
    pub origin: RequestOrigin,
    pub is_heating: bool,
    pub initial: (f64, f64),
    pub final_: (f64, f64),
    pub source_change: f64,
    pub dest_change: f64,
    pub samples: usize,
    pub verdict: Verdict,
}

impl BalanceReport {
    pub fn verified(&self) -> bool {
        self.verdict == Verdict::Verified
    }

    pub fn failure_message(&self) -> Option<String> {
        match self.verdict {
            Verdict::Verified => None,
            Verdict::NoVoltageChange => Some(format!(
                "Balancing failed from Bank {} to {}: No voltage change detected \
                 (High change: {:.3}V, Low change: {:.3}V). Possible relay failure.",
                self.source_bank, self.dest_bank, self.source_change, self.dest_change
            )),
            Verdict::InsufficientSamples => Some(format!(
                "Balancing failed from Bank {} to {}: Insufficient readings ({} samples).",
                self.source_bank, self.dest_bank, self.samples
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BalancePhase {
    Idle,
    Engaged {
        op: BalanceOperation,
        last_sample: Duration,
        source_trend: Vec<f64>,
        dest_trend: Vec<f64>,
    },
    Verifying(BalanceOperation),
    Verified(BalanceReport),
    Failed(BalanceReport),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BalanceStats {
    pub operations: u32,
    pub verified: u32,
    pub failed: u32,
}

/// Sole owner of the relay and converter lines.
pub struct BalanceController {
    relays: RelayTable,
    actuator: Box<dyn Actuator>,
    settings: BalanceSettings,
    phase: BalancePhase,
    latched: bool,
    last_finished: Option<Duration>,
    stats: BalanceStats,
}

impl BalanceController {
    pub fn new(relays: RelayTable, actuator: Box<dyn Actuator>, settings: BalanceSettings) -> Self {
        Self {
            relays,
            actuator,
            settings,
            phase: BalancePhase::Idle,
            latched: false,
            last_finished: None,
            stats: BalanceStats::default(),
        }
    }

    pub fn phase(&self) -> &BalancePhase {
        &self.phase
    }

    pub fn settings(&self) -> &BalanceSettings {
        &self.settings
    }

    pub fn get_stats(&self) -> &BalanceStats {
        &self.stats
    }

    pub fn is_active(&self) -> bool {
        matches!(self.phase, BalancePhase::Engaged { .. } | BalancePhase::Verifying(_))
    }

    pub fn is_latched(&self) -> bool {
        self.latched
    }

    /// External reset of the failure latch. Nothing inside the controller
    /// ever calls this.
    pub fn reset_latch(&mut self) {
        if self.latched {
            warn!("Balancer failure latch cleared by operator");
        }
        self.latched = false;
    }

    /// Direct access to non-balancing lines (alarm, fan).
    pub fn set_aux_line(&mut self, line: Line, asserted: bool) -> Result<(), ActuatorError> {
        self.actuator.set_line(line, asserted)
    }

    /// Routes relays for `source -> dest`; `(0, 0)` only resets them.
    pub fn set_relays(&mut self, source: usize, dest: usize) -> Result<(), BalanceBlocked> {
        if source == 0 && dest == 0 {
            info!("Resetting all relays to off");
            self.actuator.reset_all()?;
            return Ok(());
        }
        let lines: LineSet = self
            .relays
            .lines(source, dest)
            .ok_or(BalanceBlocked::NoRelayPath {
                source_bank: source,
                dest_bank: dest,
            })?
            .iter()
            .copied()
            .collect();
        self.actuator.reset_all()?;
        for line in lines {
            debug!("Relay {} on for {}-{}", line, source, dest);
            self.actuator.set_line(Line::Relay(line), true)?;
        }
        info!("Relays set for balancing from Bank {} to {}", source, dest);
        Ok(())
    }

    /// Automatic-trigger guards. On success, returns the request to run.
    pub fn check_guards(&self, input: &GuardInput<'_>, now: Duration) -> Result<BalanceRequest, BalanceBlocked> {
        if self.is_active() {
            return Err(BalanceBlocked::InProgress);
        }
        if self.latched {
            return Err(BalanceBlocked::Latched);
        }
        if input.temperature_alerts {
            return Err(BalanceBlocked::TemperatureAlerts);
        }
        if input.needs_attention {
            return Err(BalanceBlocked::NeedsAttention);
        }
        let (source, dest, max_v, min_v) =
            select_pair(input.voltages).ok_or(BalanceBlocked::NotEnoughBanks)?;
        if min_v <= 0.0 {
            return Err(BalanceBlocked::DestinationDead { bank: dest, volts: min_v });
        }
        if let Some(last) = self.last_finished {
            let since = now.saturating_sub(last);
            if since < self.settings.rest_period {
                return Err(BalanceBlocked::RestPeriod {
                    remaining_s: (self.settings.rest_period - since).as_secs(),
                });
            }
        }
        let spread = max_v - min_v;
        if !input.is_heating && spread <= self.settings.spread_threshold {
            return Err(BalanceBlocked::SpreadBelowThreshold {
                spread,
                threshold: self.settings.spread_threshold,
            });
        }
        Ok(BalanceRequest {
            source,
            dest,
            is_heating: input.is_heating,
            origin: RequestOrigin::Automatic,
        })
    }

    /// Guards for a request that was already planned (manual or self-test).
    pub fn check_request(
        &self,
        request: &BalanceRequest,
        voltages: &[Option<f64>],
        temperature_alerts: bool,
    ) -> Result<(), BalanceBlocked> {
        if self.is_active() {
            return Err(BalanceBlocked::InProgress);
        }
        if self.latched {
            return Err(BalanceBlocked::Latched);
        }
        if temperature_alerts {
            return Err(BalanceBlocked::TemperatureAlerts);
        }
        let dest_v = voltages
            .get(request.dest.wrapping_sub(1))
            .copied()
            .flatten()
            .unwrap_or(0.0);
        if dest_v <= 0.0 {
            return Err(BalanceBlocked::DestinationDead {
                bank: request.dest,
                volts: dest_v,
            });
        }
        if self.relays.lines(request.source, request.dest).is_none() {
            return Err(BalanceBlocked::NoRelayPath {
                source_bank: request.source,
                dest_bank: request.dest,
            });
        }
        Ok(())
    }

    /// Reads starting voltages, routes relays and enables the converter.
    pub fn begin(
        &mut self,
        request: &BalanceRequest,
        reader: &mut VoltageReader,
        now: Duration,
    ) -> Result<(), BalanceBlocked> {
        if self.is_active() {
            return Err(BalanceBlocked::InProgress);
        }
        if self.latched {
            return Err(BalanceBlocked::Latched);
        }
        let mode = if request.is_heating { "Heating" } else { "Normal" };
        info!("Starting {} balance from Bank {} to {}", mode, request.source, request.dest);

        let initial_source_v = reader.read_bank(request.source).unwrap_or(0.0);
        let initial_dest_v = reader.read_bank(request.dest).unwrap_or(0.0);
        if initial_dest_v <= 0.0 {
            warn!("Cannot balance to Bank {} ({:.2}V), skipping", request.dest, initial_dest_v);
            return Err(BalanceBlocked::DestinationDead {
                bank: request.dest,
                volts: initial_dest_v,
            });
        }

        if let Err(e) = self.engage(request.source, request.dest) {
            error!("Failed to engage balancing path: {}", e);
            self.release();
            return Err(e);
        }

        self.stats.operations = self.stats.operations.wrapping_add(1);
        self.phase = BalancePhase::Engaged {
            op: BalanceOperation {
                source_bank: request.source,
                dest_bank: request.dest,
                origin: request.origin,
                started_at: now,
                is_heating: request.is_heating,
                initial_source_v,
                initial_dest_v,
            },
            last_sample: now,
            source_trend: vec![initial_source_v],
            dest_trend: vec![initial_dest_v],
        };
        Ok(())
    }

    fn engage(&mut self, source: usize, dest: usize) -> Result<(), BalanceBlocked> {
        self.set_relays(source, dest)?;
        self.actuator.set_line(Line::Converter, true)?;
        info!("DC-DC converter on");
        Ok(())
    }

    /// Converter off, relays reset. Errors are logged; there is nothing
    /// better to do with them at this point.
    fn release(&mut self) {
        if let Err(e) = self.actuator.set_line(Line::Converter, false) {
            error!("Failed to switch converter off: {}", e);
        } else {
            info!("DC-DC converter off");
        }
        if let Err(e) = self.set_relays(0, 0) {
            error!("Failed to reset relays: {}", e);
        }
    }

    /// Time until the controller next needs a tick.
    pub fn next_wake(&self, now: Duration) -> Option<Duration> {
        match &self.phase {
            BalancePhase::Engaged { op, last_sample, .. } => {
                let next_sample = *last_sample + self.settings.sample_interval;
                let deadline = op.started_at + self.settings.duration;
                Some(next_sample.min(deadline).saturating_sub(now))
            }
            _ => None,
        }
    }

    /// Advances an engaged operation: samples when the interval has passed
    /// and, once the duration is up, shuts the path down and verifies.
    pub fn tick(&mut self, reader: &mut VoltageReader, now: Duration) -> Option<BalanceReport> {
        let BalancePhase::Engaged {
            op,
            last_sample,
            source_trend,
            dest_trend,
        } = &mut self.phase
        else {
            return None;
        };

        let finished = now.saturating_sub(op.started_at) >= self.settings.duration;
        if !finished {
            if now.saturating_sub(*last_sample) >= self.settings.sample_interval {
                let prev_source = source_trend.last().copied().unwrap_or(op.initial_source_v);
                let prev_dest = dest_trend.last().copied().unwrap_or(op.initial_dest_v);
                let source_v = reader.read_bank(op.source_bank).unwrap_or(prev_source);
                let dest_v = reader.read_bank(op.dest_bank).unwrap_or(prev_dest);
                debug!(
                    "Balancing Bank {} ({:.2}V) -> Bank {} ({:.2}V)",
                    op.source_bank, source_v, op.dest_bank, dest_v
                );
                source_trend.push(source_v);
                dest_trend.push(dest_v);
                *last_sample = now;
            }
            return None;
        }

        let prev_source = source_trend.last().copied().unwrap_or(op.initial_source_v);
        let prev_dest = dest_trend.last().copied().unwrap_or(op.initial_dest_v);
        let final_source = reader.read_bank(op.source_bank).unwrap_or(prev_source);
        let final_dest = reader.read_bank(op.dest_bank).unwrap_or(prev_dest);
        source_trend.push(final_source);
        dest_trend.push(final_dest);
        let samples = source_trend.len().min(dest_trend.len());
        let op = op.clone();

        self.release();
        self.phase = BalancePhase::Verifying(op.clone());
        self.last_finished = Some(now);

        let (verdict, source_change, dest_change) = verify_trend(
            (op.initial_source_v, op.initial_dest_v),
            (final_source, final_dest),
            samples,
            self.settings.min_voltage_delta,
            self.settings.drift_tolerance,
        );
        let report = BalanceReport {
            source_bank: op.source_bank,
            dest_bank: op.dest_bank,
            origin: op.origin,
            is_heating: op.is_heating,
            initial: (op.initial_source_v, op.initial_dest_v),
            final_: (final_source, final_dest),
            source_change,
            dest_change,
            samples,
            verdict,
        };

        if let Some(message) = report.failure_message() {
            error!("{}", message);
            self.latched = true;
            self.stats.failed = self.stats.failed.wrapping_add(1);
            self.phase = BalancePhase::Failed(report.clone());
        } else {
            info!(
                "Balancing verified: High change {:.3}V, Low change {:.3}V",
                source_change, dest_change
            );
            self.stats.verified = self.stats.verified.wrapping_add(1);
            self.phase = BalancePhase::Verified(report.clone());
        }
        Some(report)
    }

    /// Runs one operation to completion, sleeping on `clock` between ticks.
    pub fn run(
        &mut self,
        request: &BalanceRequest,
        reader: &mut VoltageReader,
        clock: &dyn Clock,
    ) -> Result<BalanceReport, BalanceBlocked> {
        self.begin(request, reader, clock.now())?;
        loop {
            if let Some(report) = self.tick(reader, clock.now()) {
                return Ok(report);
            }
            match self.next_wake(clock.now()) {
                Some(wait) => clock.sleep(wait),
                None => return Err(BalanceBlocked::InProgress),
            }
        }
    }
}
