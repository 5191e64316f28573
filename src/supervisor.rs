//! The poll cycle.
//!
//! One [`Supervisor`] owns every piece of cross-poll state (calibration,
//! anomaly history, the balancer and its latch, the event log) and is
//! threaded through [`Supervisor::poll`] by `&mut self`. Observers only
//! ever see the immutable [`Snapshot`] it publishes at the end of a poll.

use crate::alerts::{Alert, AlertKind, EventLog};
use crate::anomaly::{bank_stats, AnomalyEngine, AnomalyThresholds};
use crate::balance::{
    plan_manual, BalanceBlocked, BalanceController, BalanceReport, BalanceRequest, BalanceSettings,
    GuardInput, ManualBalanceRejected, RequestOrigin,
};
use crate::calibration::{CalibrationStore, Calibrator, MemoryCalibrationStore, RawReading};
use crate::config::{Config, ConfigError};
use crate::control::ControlRequest;
use crate::hardware::{Actuator, Bus, Clock, Connector, Line, SimClock, SimPack};
use crate::issues::{IssueAggregator, IssueReport, StartupStatus};
use crate::snapshot::{Snapshot, SnapshotPublisher, SystemStatus};
use crate::topology::Topology;
use crate::transport::{TemperatureClient, TransportSettings, UnitTarget};
use crate::voltage::{VoltageReader, VoltageSettings};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Everything the supervisor needs from the outside world.
pub struct Capabilities {
    pub connector: Box<dyn Connector>,
    pub bus: Box<dyn Bus>,
    pub actuator: Box<dyn Actuator>,
    pub store: Box<dyn CalibrationStore>,
    pub clock: Arc<dyn Clock>,
}

impl Capabilities {
    /// A fully simulated pack on virtual time. The returned handle drives
    /// the pack from outside (temperatures, faults, stuck relays).
    pub fn simulated(config: &Config, clock: SimClock) -> Result<(Self, SimPack), ConfigError> {
        let pack = SimPack::new(config, config.relay_table()?, clock.clone());
        let caps = Self {
            connector: Box::new(pack.clone()),
            bus: Box::new(pack.clone()),
            actuator: Box::new(pack.clone()),
            store: Box::new(MemoryCalibrationStore::new()),
            clock: Arc::new(clock),
        };
        Ok((caps, pack))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorState {
    pub polls: u64,
    pub calibrated: bool,
    pub balancer_latched: bool,
    pub startup: StartupStatus,
    pub pending_manual: bool,
}

/// What one poll saw and did.
#[derive(Debug, Clone)]
pub struct PollOutcome {
    pub snapshot: Arc<Snapshot>,
    pub issues: IssueReport,
    pub balance: Option<BalanceReport>,
    pub blocked: Option<BalanceBlocked>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfTestReport {
    pub passed: bool,
    pub attempts: u32,
    pub failures: Vec<String>,
    pub balance_reports: Vec<BalanceReport>,
}

pub struct Supervisor {
    config: Config,
    topology: Topology,
    clock: Arc<dyn Clock>,
    targets: Vec<UnitTarget>,
    client: TemperatureClient,
    voltage: VoltageReader,
    balancer: BalanceController,
    calibrator: Calibrator,
    store: Box<dyn CalibrationStore>,
    anomaly: AnomalyEngine,
    issues: IssueAggregator,
    events: EventLog,
    publisher: SnapshotPublisher,
    requests_tx: Sender<ControlRequest>,
    requests_rx: Receiver<ControlRequest>,
    pending_manual: Option<BalanceRequest>,
    carried: Vec<Alert>,
    last_messages: HashSet<String>,
    startup: StartupStatus,
    last_report: Option<BalanceReport>,
    polls: u64,
}

impl Supervisor {
    pub fn new(config: Config, caps: Capabilities) -> Result<Self, ConfigError> {
        config.validate()?;
        let topology = config.topology()?;
        let relays = config.relay_table()?;
        let banks = topology.num_series_banks();

        let client = TemperatureClient::new(
            caps.connector,
            Arc::clone(&caps.clock),
            TransportSettings::from_config(&config.temperature),
        );
        let voltage = VoltageReader::new(
            caps.bus,
            Arc::clone(&caps.clock),
            VoltageSettings::from_config(&config.voltage, banks),
            banks,
        );
        let balancer = BalanceController::new(
            relays,
            caps.actuator,
            BalanceSettings::from_config(&config.balance),
        );

        let mut calibrator = Calibrator::new(topology.total_channels(), config.temperature.valid_min);
        if let Err(e) = calibrator.restore(caps.store.as_ref()) {
            warn!("Ignoring stored calibration: {}", e);
        }

        let (requests_tx, requests_rx) = mpsc::channel();
        let publisher = SnapshotPublisher::new(Snapshot::empty(caps.clock.unix_time()));

        info!(
            "Supervisor ready: {} banks x {} sensors, {} parallel batteries",
            banks,
            topology.sensors_per_bank(),
            topology.parallel_batteries()
        );

        Ok(Self {
            targets: config.unit_targets(),
            anomaly: AnomalyEngine::new(topology, AnomalyThresholds::from_config(&config.temperature)),
            issues: IssueAggregator::from_config(&config.voltage),
            events: EventLog::new(config.status.event_log_size),
            clock: caps.clock,
            store: caps.store,
            topology,
            client,
            voltage,
            balancer,
            calibrator,
            publisher,
            requests_tx,
            requests_rx,
            pending_manual: None,
            carried: Vec::new(),
            last_messages: HashSet::new(),
            startup: StartupStatus::default(),
            last_report: None,
            polls: 0,
            config,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn publisher(&self) -> SnapshotPublisher {
        self.publisher.clone()
    }

    /// Queue for requests from other threads; drained at the next poll.
    pub fn requests(&self) -> Sender<ControlRequest> {
        self.requests_tx.clone()
    }

    pub fn balancer(&self) -> &BalanceController {
        &self.balancer
    }

    pub fn calibrator(&self) -> &Calibrator {
        &self.calibrator
    }

    pub fn anomaly(&self) -> &AnomalyEngine {
        &self.anomaly
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn get_state(&self) -> SupervisorState {
        SupervisorState {
            polls: self.polls,
            calibrated: self.calibrator.is_calibrated(),
            balancer_latched: self.balancer.is_latched(),
            startup: self.startup.clone(),
            pending_manual: self.pending_manual.is_some(),
        }
    }

    pub fn reset_latch(&mut self) {
        self.balancer.reset_latch();
        self.events
            .append(self.clock.unix_time(), "Balancer latch reset by operator");
    }

    /// Leaves the pack safe: converter off, relays open, alarm and fan off.
    pub fn shutdown(&mut self) {
        info!("Supervisor shutting down");
        self.set_line(Line::Converter, false);
        if let Err(e) = self.balancer.set_relays(0, 0) {
            error!("Failed to open relays on shutdown: {}", e);
        }
        self.set_line(Line::Alarm, false);
        self.set_line(Line::Fan, false);
    }

    /// Plans a manual balance against the latest snapshot and runs it on
    /// the next poll, regardless of the rest period.
    pub fn request_manual_balance(&mut self) -> Result<BalanceRequest, ManualBalanceRejected> {
        let snapshot = self.publisher.load();
        let request = plan_manual(
            &snapshot.voltages,
            !snapshot.alerts.is_empty(),
            snapshot.balancing || self.balancer.is_active(),
            self.balancer.settings().spread_threshold,
        )?;
        self.pending_manual = Some(request);
        Ok(request)
    }

    fn drain_requests(&mut self) {
        loop {
            match self.requests_rx.try_recv() {
                Ok(ControlRequest::ResetLatch) => self.reset_latch(),
                Ok(ControlRequest::Balance(request)) => {
                    debug!("Manual balance {}->{} pending", request.source, request.dest);
                    self.pending_manual = Some(request);
                }
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    fn set_line(&mut self, line: Line, asserted: bool) {
        if let Err(e) = self.balancer.set_aux_line(line, asserted) {
            error!("Failed to drive {:?}: {}", line, e);
        }
    }

    /// Reads every unit. Failed units fill their channels with
    /// [`RawReading::UnitFailed`] and are returned as `(unit, reason)`.
    fn read_temperatures(&mut self) -> (Vec<RawReading>, Vec<(u8, String)>) {
        let per_unit = self.topology.sensors_per_battery();
        let count = u16::try_from(per_unit).unwrap_or(u16::MAX);
        let mut raw = Vec::with_capacity(self.topology.total_channels());
        let mut failures = Vec::new();

        for reading in self.client.read_units(&self.targets, count) {
            match reading.result {
                Ok(values) => {
                    raw.extend(values.into_iter().map(RawReading::Value));
                }
                Err(e) => {
                    error!("Temperature unit {} failed: {}", reading.unit_id, e);
                    failures.push((reading.unit_id, e.to_string()));
                    raw.extend(std::iter::repeat(RawReading::UnitFailed).take(per_unit));
                }
            }
        }
        raw.resize(self.topology.total_channels(), RawReading::UnitFailed);
        (raw, failures)
    }

    fn calibrate(&mut self, raw: &[RawReading]) {
        if self.calibrator.observe(raw, self.store.as_mut()) {
            if let Some(median) = self.calibrator.median() {
                self.events.append(
                    self.clock.unix_time(),
                    format!("Temperature calibration set, median {median:.1}°C"),
                );
            }
        }
    }

    /// Appends alerts that were not present last poll to the event log.
    fn log_new_alerts(&mut self, alerts: &mut [Alert]) {
        let timestamp = self.clock.unix_time();
        let current: HashSet<String> = alerts.iter().map(|a| a.message.clone()).collect();
        for alert in alerts.iter_mut() {
            if !matches!(alert.kind, AlertKind::Temperature(_)) {
                alert.is_new = !self.last_messages.contains(&alert.message);
            }
            if alert.is_new {
                self.events.append(timestamp, alert.message.clone());
            }
        }
        self.last_messages = current;
    }

    /// One full poll: acquire, calibrate, detect, aggregate, maybe balance,
    /// publish.
    pub fn poll(&mut self) -> PollOutcome {
        self.drain_requests();
        self.polls += 1;
        debug!("Poll {} starting", self.polls);

        let (raw, unit_failures) = self.read_temperatures();
        self.calibrate(&raw);
        let calibrated = self.calibrator.apply(&raw);
        let stats = bank_stats(&self.topology, &calibrated);

        let mut polled: Vec<Alert> = unit_failures
            .iter()
            .map(|(unit, reason)| {
                Alert::new(
                    AlertKind::UnitFailure,
                    format!("Temperature unit {unit} failed: {reason}"),
                )
            })
            .collect();
        polled.extend(self.anomaly.evaluate(&raw, &calibrated, &stats));

        let cabinet = self.anomaly.cabinet_check(&calibrated);
        self.set_line(Line::Fan, cabinet.is_some());
        polled.extend(cabinet);
        polled.append(&mut self.carried);

        let voltages = self.voltage.read_all();
        let mut issues = self.issues.aggregate(
            &voltages,
            &polled,
            self.balancer.is_latched(),
            &self.startup,
        );
        self.set_line(Line::Alarm, issues.needs_attention);
        self.log_new_alerts(&mut issues.alerts);

        let temperature_alerts = polled.iter().any(Alert::is_temperature);
        let cold = self.config.temperature.cold_threshold;
        let is_heating = calibrated.iter().flatten().any(|&t| t < cold);

        let decision = match self.pending_manual.take() {
            Some(request) => self
                .balancer
                .check_request(&request, &voltages, temperature_alerts)
                .map(|()| request),
            None => self.balancer.check_guards(
                &GuardInput {
                    voltages: &voltages,
                    temperature_alerts,
                    needs_attention: issues.needs_attention,
                    is_heating,
                },
                self.clock.now(),
            ),
        };

        let mut snapshot = Snapshot {
            timestamp: self.clock.unix_time(),
            poll: self.polls,
            system_status: if issues.needs_attention {
                SystemStatus::Alert
            } else {
                SystemStatus::Running
            },
            total_voltage: Snapshot::total_voltage_of(&voltages),
            raw,
            calibrated,
            calibration_median: self.calibrator.median(),
            bank_stats: stats,
            voltages,
            alerts: issues.messages(),
            has_temperature_alerts: temperature_alerts,
            needs_attention: issues.needs_attention,
            balancing: false,
            balancer_latched: self.balancer.is_latched(),
            last_balance: self.last_report.clone(),
            balance_stats: *self.balancer.get_stats(),
            link_stats: *self.client.get_stats(),
            events: self.events.to_vec(),
        };

        let (balance, blocked) = match decision {
            Ok(request) => {
                snapshot.balancing = true;
                self.publisher.publish(snapshot.clone());
                let report = self.run_balance(&request);
                (report.as_ref().ok().cloned(), report.err())
            }
            Err(blocked) => {
                debug!("Balancing not started: {}", blocked);
                (None, Some(blocked))
            }
        };

        snapshot.balancing = false;
        snapshot.balancer_latched = self.balancer.is_latched();
        snapshot.last_balance = self.last_report.clone();
        snapshot.balance_stats = *self.balancer.get_stats();
        snapshot.events = self.events.to_vec();
        let snapshot = Arc::new(snapshot);
        self.publisher.publish((*snapshot).clone());

        PollOutcome {
            snapshot,
            issues,
            balance,
            blocked,
        }
    }

    fn run_balance(&mut self, request: &BalanceRequest) -> Result<BalanceReport, BalanceBlocked> {
        let mode = if request.is_heating { "Heating" } else { "Normal" };
        self.events.append(
            self.clock.unix_time(),
            format!(
                "{mode} balancing started from Bank {} to {}",
                request.source, request.dest
            ),
        );
        let result = self
            .balancer
            .run(request, &mut self.voltage, self.clock.as_ref());
        let timestamp = self.clock.unix_time();
        match &result {
            Ok(report) => {
                if let Some(message) = report.failure_message() {
                    self.events.append(timestamp, message.clone());
                    self.carried.push(Alert::new(AlertKind::BalanceFailed, message));
                } else {
                    self.events.append(
                        timestamp,
                        format!(
                            "Balancing completed from Bank {} to {}",
                            report.source_bank, report.dest_bank
                        ),
                    );
                }
                self.last_report = Some(report.clone());
            }
            Err(e) => {
                warn!("Balancing from Bank {} to {} aborted: {}", request.source, request.dest, e);
                self.events.append(
                    timestamp,
                    format!(
                        "Balancing from Bank {} to {} aborted: {e}",
                        request.source, request.dest
                    ),
                );
            }
        }
        result
    }

    /// Startup self-test, retried until it passes or attempts run out.
    /// A pack that never passes is released into normal operation with
    /// whatever latch the tests left behind.
    pub fn run_self_test(&mut self) -> SelfTestReport {
        let attempts = self.config.self_test.attempts.max(1);
        let retry_wait = Duration::from_secs(self.config.self_test.retry_wait_s);
        let mut balance_reports = Vec::new();
        let mut attempt = 1;

        loop {
            info!("Self-test attempt {}/{}", attempt, attempts);
            let failures = self.self_test_pass(&mut balance_reports);
            let timestamp = self.clock.unix_time();

            if failures.is_empty() {
                info!("Self-test passed");
                self.startup = StartupStatus::default();
                self.set_line(Line::Alarm, false);
                self.events.append(timestamp, "Self-test passed");
                return SelfTestReport {
                    passed: true,
                    attempts: attempt,
                    failures,
                    balance_reports,
                };
            }

            for failure in &failures {
                error!("Self-test: {}", failure);
                self.events.append(timestamp, failure.clone());
            }
            self.startup = StartupStatus {
                failed: true,
                failures: failures.clone(),
            };
            self.set_line(Line::Alarm, true);

            if attempt >= attempts {
                warn!("Self-test failed {} times, continuing without it", attempts);
                self.startup.failed = false;
                return SelfTestReport {
                    passed: false,
                    attempts,
                    failures,
                    balance_reports,
                };
            }
            info!("Retrying self-test in {}s", retry_wait.as_secs());
            self.clock.sleep(retry_wait);
            attempt += 1;
        }
    }

    fn self_test_pass(&mut self, reports: &mut Vec<BalanceReport>) -> Vec<String> {
        let mut failures = Vec::new();

        for target in self.targets.clone() {
            if !self.client.probe(target.port) {
                failures.push(format!(
                    "Temperature unit {} unreachable on port {}",
                    target.unit_id, target.port
                ));
            }
        }

        let (raw, unit_failures) = self.read_temperatures();
        for (unit, reason) in &unit_failures {
            failures.push(format!("Initial temp read failure for unit {unit}: {reason}"));
        }

        let voltages = self.voltage.read_all();
        if voltages.iter().any(|v| !v.is_some_and(|v| v != 0.0)) {
            failures.push("Initial voltage read failure: Zero voltage on one or more banks.".to_string());
        }

        if unit_failures.is_empty() {
            self.calibrate(&raw);
        }
        if !failures.is_empty() {
            return failures;
        }

        if self.balancer.is_latched() {
            failures.push("Balancer hardware failure detected - balancing disabled.".to_string());
            return failures;
        }

        let calibrated = self.calibrator.apply(&raw);
        let low = self.config.temperature.low_threshold;
        let high = self.config.temperature.high_threshold;
        let temps_ok = calibrated
            .iter()
            .all(|t| t.is_some_and(|t| (low..=high).contains(&t)));

        let mut order: Vec<usize> = (1..=self.topology.num_series_banks()).collect();
        order.sort_by(|&a, &b| {
            let va = voltages[a - 1].unwrap_or(0.0);
            let vb = voltages[b - 1].unwrap_or(0.0);
            vb.total_cmp(&va)
        });

        'pairs: for &source in &order {
            for &dest in &order {
                if source == dest {
                    continue;
                }
                if !temps_ok {
                    failures.push(format!(
                        "Skipping balance test from Bank {source} to Bank {dest}: Temp anomalies."
                    ));
                    continue;
                }
                info!("Testing balance from Bank {} to Bank {}", source, dest);
                let request = BalanceRequest {
                    source,
                    dest,
                    is_heating: false,
                    origin: RequestOrigin::SelfTest,
                };
                match self.run_balance(&request) {
                    Ok(report) => {
                        if let Some(message) = report.failure_message() {
                            failures.push(message);
                        }
                        reports.push(report);
                    }
                    Err(e) => failures.push(format!(
                        "Balance test from Bank {source} to Bank {dest} failed: {e}"
                    )),
                }
                if self.balancer.is_latched() {
                    break 'pairs;
                }
            }
        }
        failures
    }
}
