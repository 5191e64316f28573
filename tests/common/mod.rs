#![allow(dead_code)]

use bankguard::balance::{BalanceController, BalanceSettings, RelayTable};
use bankguard::config::Config;
use bankguard::hardware::{SimClock, SimPack};
use bankguard::voltage::{VoltageReader, VoltageSettings};
use bankguard::{Capabilities, Supervisor};
use std::sync::Arc;

/// Three banks of eight sensors behind one unit, with a complete relay
/// mapping over four relays. Every ordered pair gets a distinct line set.
pub const PACK_TOML: &str = r#"
[pack]
num_series_banks = 3
sensors_per_bank = 8
number_of_parallel_batteries = 1

[temperature]
unit_ids = [1]

[balance]
voltage_difference_to_balance = 0.1
duration_s = 5
rest_period_s = 60
sample_interval_ms = 2000
min_voltage_delta = 0.01

[balance.relay_mapping]
"1-2" = [0]
"1-3" = [0, 1]
"2-1" = [2]
"2-3" = [1]
"3-1" = [2, 3]
"3-2" = [3]

[self_test]
attempts = 2
retry_wait_s = 1

[status]
event_log_size = 20
"#;

pub fn test_config() -> Config {
    Config::from_toml_str(PACK_TOML).expect("test configuration parses")
}

pub fn relay_table(config: &Config) -> RelayTable {
    config.relay_table().expect("test relay mapping is complete")
}

pub fn sim_pack(config: &Config) -> (SimPack, SimClock) {
    let clock = SimClock::new();
    let pack = SimPack::new(config, relay_table(config), clock.clone());
    (pack, clock)
}

pub fn voltage_reader(config: &Config, pack: &SimPack, clock: &SimClock) -> VoltageReader {
    let banks = config.pack.num_series_banks;
    VoltageReader::new(
        Box::new(pack.clone()),
        Arc::new(clock.clone()),
        VoltageSettings::from_config(&config.voltage, banks),
        banks,
    )
}

pub fn balance_controller(config: &Config, pack: &SimPack) -> BalanceController {
    BalanceController::new(
        relay_table(config),
        Box::new(pack.clone()),
        BalanceSettings::from_config(&config.balance),
    )
}

pub fn sim_supervisor(config: Config) -> (Supervisor, SimPack, SimClock) {
    let clock = SimClock::new();
    let (caps, pack) = Capabilities::simulated(&config, clock.clone()).expect("simulated capabilities");
    let supervisor = Supervisor::new(config, caps).expect("supervisor builds from test config");
    (supervisor, pack, clock)
}

/// Voltages with a clear spread from bank 1 down to bank 3.
pub fn spread_pack(pack: &SimPack) {
    pack.set_bank_voltage(1, 20.4);
    pack.set_bank_voltage(2, 19.8);
    pack.set_bank_voltage(3, 19.2);
}
