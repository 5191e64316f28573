use crate::alerts::EventRecord;
use crate::anomaly::BankStats;
use crate::balance::{BalanceReport, BalanceStats};
use crate::calibration::RawReading;
use crate::transport::LinkStats;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SystemStatus {
    Starting,
    Running,
    Alert,
}

/// Everything an observer may see about the pack after one poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: u64,
    pub poll: u64,
    pub system_status: SystemStatus,
    pub raw: Vec<RawReading>,
    pub calibrated: Vec<Option<f64>>,
    pub calibration_median: Option<f64>,
    pub bank_stats: Vec<BankStats>,
    pub voltages: Vec<Option<f64>>,
    pub total_voltage: f64,
    pub alerts: Vec<String>,
    pub has_temperature_alerts: bool,
    pub needs_attention: bool,
    pub balancing: bool,
    pub balancer_latched: bool,
    pub last_balance: Option<BalanceReport>,
    pub balance_stats: BalanceStats,
    pub link_stats: LinkStats,
    pub events: Vec<EventRecord>,
}

impl Snapshot {
    /// Placeholder published before the first poll completes.
    pub fn empty(timestamp: u64) -> Self {
        Self {
            timestamp,
            poll: 0,
            system_status: SystemStatus::Starting,
            raw: Vec::new(),
            calibrated: Vec::new(),
            calibration_median: None,
            bank_stats: Vec::new(),
            voltages: Vec::new(),
            total_voltage: 0.0,
            alerts: Vec::new(),
            has_temperature_alerts: false,
            needs_attention: false,
            balancing: false,
            balancer_latched: false,
            last_balance: None,
            balance_stats: BalanceStats::default(),
            link_stats: LinkStats::default(),
            events: Vec::new(),
        }
    }

    pub fn total_voltage_of(voltages: &[Option<f64>]) -> f64 {
        voltages.iter().flatten().sum()
    }
}

/// Latest-snapshot cell shared between the supervisor and its readers.
/// Readers never block the poll loop and never see a half-written state.
#[derive(Debug, Clone)]
pub struct SnapshotPublisher {
    current: Arc<ArcSwap<Snapshot>>,
}

impl SnapshotPublisher {
    pub fn new(initial: Snapshot) -> Self {
        Self {
            current: Arc::new(ArcSwap::from_pointee(initial)),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) {
        self.current.store(Arc::new(snapshot));
    }

    pub fn load(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }
}
