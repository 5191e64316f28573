//! # Battery Bank Supervisor
//!
//! Supervisory logic for a multi-bank battery pack: temperature units on a
//! shared serial bus, a multiplexed voltage front end, and a relay matrix
//! with a DC-DC converter that moves charge between series banks.
//!
//! ## Features
//!
//! - **Temperature bus client**: per-request connections, progressive reads
//!   and probe-classified retries against flaky bridges
//! - **One-shot calibration**: per-sensor offsets fixed on the first clean
//!   poll and persisted across restarts
//! - **Anomaly detection**: invalid, high, low, deviation, rise, lag and
//!   disconnection checks per channel, plus cabinet over-temperature
//! - **Verified balancing**: every operation is checked against the voltage
//!   trend it produced; a balancer that moves nothing latches itself off
//! - **Snapshots**: observers read an immutable per-poll snapshot and never
//!   block the poll loop
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use bankguard::{Capabilities, Config, SimClock, Supervisor};
//!
//! let config = Config::load("bankguard.toml".as_ref()).unwrap();
//! let (caps, _pack) = Capabilities::simulated(&config, SimClock::new()).unwrap();
//! let mut supervisor = Supervisor::new(config, caps).unwrap();
//!
//! let outcome = supervisor.poll();
//! println!("{} alerts", outcome.snapshot.alerts.len());
//! ```
//!
//! ## Architecture
//!
//! - [`supervisor`] - The poll cycle and the self-test
//! - [`transport`] / [`frame`] - Temperature bus client and frame codec
//! - [`voltage`] - Bank voltage acquisition
//! - [`calibration`] / [`anomaly`] - Temperature processing
//! - [`balance`] - Relay table, guards and the verified balance controller
//! - [`issues`] / [`alerts`] - Alert aggregation and the event log
//! - [`snapshot`] / [`control`] - What observers see and may ask for
//! - [`hardware`] - Capability traits with real and simulated adapters

#![deny(clippy::all)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::float_cmp)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::new_without_default)]

pub mod alerts;
pub mod anomaly;
pub mod balance;
pub mod calibration;
pub mod config;
pub mod control;
pub mod frame;
pub mod hardware;
pub mod issues;
pub mod snapshot;
pub mod supervisor;
pub mod topology;
pub mod transport;
pub mod voltage;

// Re-export main public types for convenience
pub use alerts::{Alert, AlertKind, AnomalyKind, EventLog, EventRecord};
pub use balance::{BalanceController, BalancePhase, BalanceReport, BalanceRequest, RelayTable, Verdict};
pub use calibration::{Calibrator, FileCalibrationStore, MemoryCalibrationStore, RawReading};
pub use config::{Config, ConfigError};
pub use control::{ControlCommand, ControlHandler, ControlRequest, ControlResponse};
pub use hardware::{RecordingActuator, SimClock, SimPack};
pub use snapshot::{Snapshot, SnapshotPublisher};
pub use supervisor::{Capabilities, PollOutcome, SelfTestReport, Supervisor};
pub use topology::{ChannelLocation, Topology};
pub use transport::{ReadError, TemperatureClient};
