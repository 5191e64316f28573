use bankguard::alerts::{AlertKind, AnomalyKind};
use bankguard::anomaly::*;
use bankguard::calibration::RawReading;
use bankguard::config::TemperatureConfig;
use bankguard::topology::Topology;

fn engine(topology: Topology) -> AnomalyEngine {
    AnomalyEngine::new(topology, AnomalyThresholds::from_config(&TemperatureConfig::default()))
}

fn raw_of(values: &[f64]) -> Vec<RawReading> {
    values.iter().map(|&v| RawReading::Value(v)).collect()
}

fn calibrated_of(values: &[f64]) -> Vec<Option<f64>> {
    values.iter().map(|&v| if v > 0.0 { Some(v) } else { None }).collect()
}

/// Runs one poll with no calibration offsets.
fn poll(engine: &mut AnomalyEngine, topology: &Topology, values: &[f64]) -> Vec<bankguard::Alert> {
    let raw = raw_of(values);
    let calibrated = calibrated_of(values);
    let stats = bank_stats(topology, &calibrated);
    engine.evaluate(&raw, &calibrated, &stats)
}

#[test]
fn test_bank_stats_span_parallel_batteries() {
    let topology = Topology::new(2, 2, 2).unwrap();
    // Bank 1 is channels 1, 2, 5, 6; bank 2 is 3, 4, 7, 8
    let calibrated = vec![
        Some(24.0),
        Some(26.0),
        Some(30.0),
        Some(31.0),
        Some(25.0),
        None,
        Some(32.0),
        Some(33.0),
    ];
    let stats = bank_stats(&topology, &calibrated);
    assert_eq!(stats.len(), 2);
    assert_eq!(
        stats[0],
        BankStats { median: 25.0, min: 24.0, max: 26.0, invalid_count: 1 }
    );
    assert_eq!(
        stats[1],
        BankStats { median: 31.5, min: 30.0, max: 33.0, invalid_count: 0 }
    );

    let empty = bank_stats(&topology, &[None; 8]);
    assert_eq!(empty[0], BankStats { invalid_count: 4, ..BankStats::default() });
    assert_eq!(overall_median(&[None, None]), None);
}

#[test]
fn test_deviation_from_bank_median() {
    let topology = Topology::new(1, 5, 1).unwrap();
    let mut engine = engine(topology);

    let alerts = poll(&mut engine, &topology, &[25.0, 25.0, 25.0, 28.0, 26.5]);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Temperature(AnomalyKind::Deviation));
    assert_eq!(
        alerts[0].message,
        "Battery 1 Bank 1 Local Ch 4: Deviation from bank median (abs 3.0°C or 12.00%)."
    );
    assert_eq!(alerts[0].location.map(|l| l.channel), Some(4));
    assert!(alerts[0].is_new);
}

#[test]
fn test_relative_deviation_alone_triggers() {
    let topology = Topology::new(1, 3, 1).unwrap();
    let mut engine = engine(topology);

    // 1.5 off a median of 10 is under the absolute limit but 15% relative
    let alerts = poll(&mut engine, &topology, &[10.0, 10.0, 11.5]);
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].message.contains("Local Ch 3"));
    assert!(alerts[0].message.contains("15.00%"));
}

#[test]
fn test_relative_deviation_below_zero_median() {
    let topology = Topology::new(1, 4, 1).unwrap();
    let mut thresholds = AnomalyThresholds::from_config(&TemperatureConfig::default());
    thresholds.valid_min = -100.0;
    thresholds.low = -50.0;
    thresholds.abs_deviation = 5.0;
    let mut engine = AnomalyEngine::new(topology, thresholds);

    let values = [-10.0, -10.0, -10.0, -13.0];
    let raw = raw_of(&values);
    let calibrated: Vec<Option<f64>> = values.iter().map(|&v| Some(v)).collect();
    let stats = bank_stats(&topology, &calibrated);
    assert_eq!(stats[0].median, -10.0);

    // 3 off a median of -10 is 30% relative
    let alerts = engine.evaluate(&raw, &calibrated, &stats);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Temperature(AnomalyKind::Deviation));
    assert_eq!(
        alerts[0].message,
        "Battery 1 Bank 1 Local Ch 4: Deviation from bank median (abs 3.0°C or 30.00%)."
    );
}

#[test]
fn test_high_and_low_checks_are_independent() {
    let topology = Topology::new(1, 3, 1).unwrap();
    let mut thresholds = AnomalyThresholds::from_config(&TemperatureConfig::default());
    thresholds.high = 20.0;
    thresholds.low = 30.0;
    let mut engine = AnomalyEngine::new(topology, thresholds);

    let alerts = poll(&mut engine, &topology, &[25.0, 25.0, 25.0]);
    let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
    assert_eq!(alerts.len(), 6);
    assert_eq!(
        kinds.iter().filter(|&&k| k == AlertKind::Temperature(AnomalyKind::High)).count(),
        3
    );
    assert_eq!(
        kinds.iter().filter(|&&k| k == AlertKind::Temperature(AnomalyKind::Low)).count(),
        3
    );
    assert!(engine.alert_state().is_active(2, AnomalyKind::High));
    assert!(engine.alert_state().is_active(2, AnomalyKind::Low));
}

#[test]
fn test_high_and_low_temperature() {
    let topology = Topology::new(1, 5, 1).unwrap();
    let mut config = TemperatureConfig::default();
    config.low_threshold = 10.0;
    let mut engine = AnomalyEngine::new(topology, AnomalyThresholds::from_config(&config));

    let alerts = poll(&mut engine, &topology, &[25.0, 25.0, 45.0, 25.0, 5.0]);
    let messages: Vec<&str> = alerts.iter().map(|a| a.message.as_str()).collect();
    assert!(messages.contains(&"Battery 1 Bank 1 Local Ch 3: High temp (45.0°C > 42°C)."));
    assert!(messages.contains(&"Battery 1 Bank 1 Local Ch 5: Low temp (5.0°C < 10°C)."));
    assert!(engine.alert_state().is_active(3, AnomalyKind::High));
    assert!(engine.alert_state().is_active(5, AnomalyKind::Low));
}

#[test]
fn test_invalid_reading_skips_other_static_checks() {
    let topology = Topology::new(1, 4, 1).unwrap();
    let mut engine = engine(topology);

    let alerts = poll(&mut engine, &topology, &[25.0, 0.0, 25.0, 25.0]);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Temperature(AnomalyKind::Invalid));
    assert_eq!(alerts[0].message, "Battery 1 Bank 1 Local Ch 2: Invalid reading (≤ 0).");
}

#[test]
fn test_failed_unit_channels_stay_quiet() {
    let topology = Topology::new(1, 2, 2).unwrap();
    let mut engine = engine(topology);
    poll(&mut engine, &topology, &[25.0, 25.0, 25.0, 25.0]);

    // Battery 2's unit drops out entirely
    let raw = vec![
        RawReading::Value(25.0),
        RawReading::Value(25.0),
        RawReading::UnitFailed,
        RawReading::UnitFailed,
    ];
    let calibrated = vec![Some(25.0), Some(25.0), None, None];
    let stats = bank_stats(&topology, &calibrated);
    let alerts = engine.evaluate(&raw, &calibrated, &stats);
    assert!(alerts.is_empty(), "unexpected alerts: {:?}", alerts);
}

#[test]
fn test_history_checks_wait_for_second_poll() {
    let topology = Topology::new(1, 5, 1).unwrap();
    let mut engine = engine(topology);
    assert!(!engine.has_history());

    let alerts = poll(&mut engine, &topology, &[25.0; 5]);
    assert!(alerts.is_empty());
    assert!(engine.has_history());
}

#[test]
fn test_rise_and_lag() {
    let topology = Topology::new(1, 5, 1).unwrap();
    let mut engine = engine(topology);
    poll(&mut engine, &topology, &[25.0; 5]);

    let alerts = poll(&mut engine, &topology, &[28.0, 25.0, 25.0, 25.0, 25.0]);
    let messages: Vec<&str> = alerts.iter().map(|a| a.message.as_str()).collect();
    assert!(messages.contains(&"Battery 1 Bank 1 Local Ch 1: Abnormal rise (3.0°C in 10s)."));
    assert!(messages.contains(&"Battery 1 Bank 1 Local Ch 1: Lag from bank group (3.0°C vs 0.0°C)."));
    assert_eq!(
        engine.alert_state().active_kinds(1),
        vec![AnomalyKind::Deviation, AnomalyKind::Rise, AnomalyKind::Lag]
    );
    assert_eq!(engine.alert_state().active_count(), 3);
}

#[test]
fn test_uniform_rise_is_not_lag() {
    let topology = Topology::new(1, 4, 1).unwrap();
    let mut engine = engine(topology);
    poll(&mut engine, &topology, &[25.0; 4]);

    // The whole bank warms together: no channel lags its group
    let alerts = poll(&mut engine, &topology, &[26.0; 4]);
    assert!(alerts.is_empty(), "unexpected alerts: {:?}", alerts);
}

#[test]
fn test_sudden_disconnection() {
    let topology = Topology::new(1, 4, 1).unwrap();
    let mut engine = engine(topology);
    poll(&mut engine, &topology, &[25.0; 4]);

    let alerts = poll(&mut engine, &topology, &[25.0, 25.0, 0.0, 25.0]);
    let kinds: Vec<AlertKind> = alerts.iter().map(|a| a.kind).collect();
    assert_eq!(
        kinds,
        vec![
            AlertKind::Temperature(AnomalyKind::Invalid),
            AlertKind::Temperature(AnomalyKind::Disconnection),
        ]
    );
    assert_eq!(alerts[1].message, "Battery 1 Bank 1 Local Ch 3: Sudden disconnection.");

    // Staying disconnected is not a new disconnection
    let alerts = poll(&mut engine, &topology, &[25.0, 25.0, 0.0, 25.0]);
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Temperature(AnomalyKind::Invalid));
    assert!(!alerts[0].is_new);
}

#[test]
fn test_repeated_condition_is_not_new() {
    let topology = Topology::new(1, 5, 1).unwrap();
    let mut engine = engine(topology);

    let first = poll(&mut engine, &topology, &[25.0, 25.0, 45.0, 25.0, 25.0]);
    assert!(!first.is_empty());
    assert!(first.iter().all(|a| a.is_new));

    let second = poll(&mut engine, &topology, &[25.0, 25.0, 45.0, 25.0, 25.0]);
    assert_eq!(second.len(), first.len());
    assert!(second.iter().all(|a| !a.is_new));

    // The drop back is itself a lag; a steady poll after that is clean
    let recovery = poll(&mut engine, &topology, &[25.0; 5]);
    assert!(recovery.iter().all(|a| a.kind == AlertKind::Temperature(AnomalyKind::Lag)));
    let again = poll(&mut engine, &topology, &[25.0; 5]);
    assert!(again.is_empty());
    assert_eq!(engine.alert_state().active_count(), 0);
}

#[test]
fn test_cabinet_over_temperature() {
    let topology = Topology::new(1, 3, 1).unwrap();
    let engine = engine(topology);

    assert!(engine.cabinet_check(&[Some(30.0), Some(31.0), Some(32.0)]).is_none());
    let alert = engine.cabinet_check(&[Some(36.0), Some(36.0), None]).unwrap();
    assert_eq!(alert.kind, AlertKind::CabinetOverTemp);
    assert_eq!(alert.message, "Cabinet over temp: 36.0°C > 35°C. Fan on.");
    assert!(alert.is_temperature());
}
