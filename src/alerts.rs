use crate::topology::ChannelLocation;
use heapless::Deque;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert;

/// Hard upper bound on retained events; the configured size may be smaller.
pub const EVENT_LOG_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AnomalyKind {
    Invalid,
    High,
    Low,
    Deviation,
    Rise,
    Lag,
    Disconnection,
}

impl AnomalyKind {
    pub const ALL: [AnomalyKind; 7] = [
        AnomalyKind::Invalid,
        AnomalyKind::High,
        AnomalyKind::Low,
        AnomalyKind::Deviation,
        AnomalyKind::Rise,
        AnomalyKind::Lag,
        AnomalyKind::Disconnection,
    ];

    /// Position in the per-channel `u8` mask.
    pub(crate) fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

const_assert!(AnomalyKind::ALL.len() <= u8::BITS as usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertKind {
    Temperature(AnomalyKind),
    UnitFailure,
    CabinetOverTemp,
    Voltage,
    BalancerLatched,
    BalanceFailed,
    StartupFailure,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub message: String,
    pub location: Option<ChannelLocation>,
    /// False when the same condition was already reported last poll.
    pub is_new: bool,
}

impl Alert {
    pub fn new(kind: AlertKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            location: None,
            is_new: true,
        }
    }

    pub fn at(kind: AnomalyKind, location: ChannelLocation, detail: &str) -> Self {
        Self {
            kind: AlertKind::Temperature(kind),
            message: format!(
                "Battery {} Bank {} Local Ch {}: {}",
                location.battery, location.bank, location.local, detail
            ),
            location: Some(location),
            is_new: true,
        }
    }

    /// Alerts that come from the temperature side and gate balancing.
    pub fn is_temperature(&self) -> bool {
        matches!(
            self.kind,
            AlertKind::Temperature(_) | AlertKind::UnitFailure | AlertKind::CabinetOverTemp
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventRecord {
    pub timestamp: u64,
    pub message: String,
}

impl core::fmt::Display for EventRecord {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}: {}", self.timestamp, self.message)
    }
}

/// Chronological, bounded event stream. Oldest entries fall off first.
#[derive(Debug)]
pub struct EventLog {
    limit: usize,
    entries: Deque<EventRecord, EVENT_LOG_CAPACITY>,
}

impl EventLog {
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.clamp(1, EVENT_LOG_CAPACITY),
            entries: Deque::new(),
        }
    }

    pub fn append(&mut self, timestamp: u64, message: impl Into<String>) {
        while self.entries.len() >= self.limit {
            self.entries.pop_front();
        }
        let _ = self.entries.push_back(EventRecord {
            timestamp,
            message: message.into(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventRecord> {
        self.entries.iter()
    }

    pub fn to_vec(&self) -> Vec<EventRecord> {
        self.entries.iter().cloned().collect()
    }
}
