use crate::alerts::{Alert, AlertKind};
use crate::config::VoltageConfig;
use serde::{Deserialize, Serialize};

/// Result of folding every alert source into one list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueReport {
    pub alerts: Vec<Alert>,
    pub needs_attention: bool,
}

impl IssueReport {
    pub fn messages(&self) -> Vec<String> {
        self.alerts.iter().map(|a| a.message.clone()).collect()
    }

    pub fn has_temperature_alerts(&self) -> bool {
        self.alerts.iter().any(Alert::is_temperature)
    }
}

/// Startup self-test outcome carried into every poll until cleared.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartupStatus {
    pub failed: bool,
    pub failures: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct IssueAggregator {
    low_volts: f64,
    high_volts: f64,
}

impl IssueAggregator {
    pub fn new(low_volts: f64, high_volts: f64) -> Self {
        Self { low_volts, high_volts }
    }

    pub fn from_config(config: &VoltageConfig) -> Self {
        Self::new(config.low_threshold, config.high_threshold)
    }

    /// One alert per bank voltage out of range; unreadable counts as zero.
    pub fn voltage_alerts(&self, voltages: &[Option<f64>]) -> Vec<Alert> {
        voltages
            .iter()
            .enumerate()
            .filter_map(|(i, v)| {
                let bank = i + 1;
                let message = match *v {
                    None => format!("Bank {bank}: Zero voltage."),
                    Some(v) if v == 0.0 => format!("Bank {bank}: Zero voltage."),
                    Some(v) if v > self.high_volts => format!("Bank {bank}: High voltage ({v:.2}V)."),
                    Some(v) if v < self.low_volts => format!("Bank {bank}: Low voltage ({v:.2}V)."),
                    Some(_) => return None,
                };
                Some(Alert::new(AlertKind::Voltage, message))
            })
            .collect()
    }

    pub fn aggregate(
        &self,
        voltages: &[Option<f64>],
        temperature_alerts: &[Alert],
        latched: bool,
        startup: &StartupStatus,
    ) -> IssueReport {
        let mut alerts = Vec::new();
        if startup.failed && !startup.failures.is_empty() {
            alerts.push(Alert::new(
                AlertKind::StartupFailure,
                format!("Startup failures: {}", startup.failures.join("; ")),
            ));
        }
        if latched {
            alerts.push(Alert::new(
                AlertKind::BalancerLatched,
                "Balancer hardware failure detected - balancing disabled.",
            ));
        }
        alerts.extend(self.voltage_alerts(voltages));
        alerts.extend(temperature_alerts.iter().cloned());

        let needs_attention = startup.failed || latched || !alerts.is_empty();
        IssueReport {
            alerts,
            needs_attention,
        }
    }
}
