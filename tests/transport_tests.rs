use bankguard::config::TemperatureConfig;
use bankguard::frame::{encode_exception, encode_response, FrameError, ReadRequest};
use bankguard::hardware::{Clock, Reply, ScriptedConnector, SimClock};
use bankguard::transport::*;
use std::sync::Arc;
use std::time::Duration;

const PORT: u16 = 10001;

fn client_with(config: &TemperatureConfig) -> (TemperatureClient, ScriptedConnector, SimClock) {
    let clock = SimClock::new();
    let connector = ScriptedConnector::new(clock.clone());
    let client = TemperatureClient::new(
        Box::new(connector.clone()),
        Arc::new(clock.clone()),
        TransportSettings::from_config(config),
    );
    (client, connector, clock)
}

fn client() -> (TemperatureClient, ScriptedConnector, SimClock) {
    client_with(&TemperatureConfig::default())
}

fn target(unit_id: u8) -> UnitTarget {
    UnitTarget { unit_id, port: PORT }
}

#[test]
fn test_successful_read_scales_registers() {
    let (mut client, connector, _clock) = client();
    let request = ReadRequest::holding_registers(1, 0, 3);
    connector.push(Reply::Frame(encode_response(&request, &[2512, -150, 3000]).unwrap()));

    let values = client.read_unit(target(1), 3).unwrap();
    assert_eq!(values, vec![25.12, -1.5, 30.0]);
    assert_eq!(connector.sends(), 1);
    assert_eq!(client.get_stats().responses_ok, 1);
    assert_eq!(client.get_stats().requests_sent, 1);
}

#[test]
fn test_response_assembled_from_bursts() {
    let (mut client, connector, _clock) = client();
    let request = ReadRequest::holding_registers(1, 0, 4);
    let frame = encode_response(&request, &[2500, 2510, 2520, 2530]).unwrap();
    let (head, tail) = frame.split_at(3);
    connector.push(Reply::Bursts(vec![head.to_vec(), tail.to_vec()]));

    let values = client.read_unit(target(1), 4).unwrap();
    assert_eq!(values, vec![25.0, 25.1, 25.2, 25.3]);
    assert_eq!(connector.sends(), 1);
}

#[test]
fn test_silent_unit_exhausts_device_retries() {
    let (mut client, connector, _clock) = client();

    let err = client.read_unit(target(1), 8).unwrap_err();
    assert_eq!(
        err,
        ReadError::RetriesExhausted {
            unit_id: 1,
            attempts: 3,
            last: AttemptError::Transport(TransportError::Timeout),
        }
    );
    assert_eq!(err.unit_id(), 1);
    assert_eq!(err.to_string(), "Failed after 3 attempts for unit 1: timed out");

    // Each failed attempt is followed by a connect-only probe
    assert_eq!(connector.sends(), 3);
    assert_eq!(connector.connects(), 6);
    assert_eq!(client.get_stats().reads_failed, 1);
    assert_eq!(client.get_stats().transport_errors, 3);
}

#[test]
fn test_unreachable_bridge_is_a_network_failure() {
    let (mut client, connector, _clock) = client();
    connector.set_reachable(false);

    let err = client.read_unit(target(2), 8).unwrap_err();
    assert_eq!(err, ReadError::NetworkUnreachable { unit_id: 2, attempts: 3 });
    assert_eq!(connector.sends(), 0);
    assert!(!client.probe(PORT));
}

/// Queues the connect outcomes for one attempt and the reachability check after it.
fn script_attempt(connector: &ScriptedConnector, network_up_after: bool) {
    connector.push_reachability(true);
    connector.push_reachability(network_up_after);
}

#[test]
fn test_mixed_failures_share_one_attempt_budget() {
    let (mut client, connector, clock) = client();
    script_attempt(&connector, true);
    script_attempt(&connector, false);
    script_attempt(&connector, true);

    let err = client.read_unit(target(1), 8).unwrap_err();
    assert_eq!(
        err,
        ReadError::RetriesExhausted {
            unit_id: 1,
            attempts: 3,
            last: AttemptError::Transport(TransportError::Timeout),
        }
    );
    assert_eq!(err.to_string(), "Failed after 3 attempts for unit 1: timed out");
    assert_eq!(connector.sends(), 3);
    assert_eq!(connector.connects(), 6);
    // Only the first failure found the network up with an attempt to follow
    assert_eq!(clock.now(), Duration::from_millis(3 * 8250 + 1000));
}

#[test]
fn test_last_attempt_with_network_down_reports_unreachable() {
    let (mut client, connector, _clock) = client();
    script_attempt(&connector, true);
    script_attempt(&connector, true);
    script_attempt(&connector, false);

    let err = client.read_unit(target(4), 8).unwrap_err();
    assert_eq!(err, ReadError::NetworkUnreachable { unit_id: 4, attempts: 3 });
    assert_eq!(connector.sends(), 3);
}

#[test]
fn test_network_budget_can_end_a_read_early() {
    let mut config = TemperatureConfig::default();
    config.network_retries = 1;
    let (mut client, connector, _clock) = client_with(&config);
    script_attempt(&connector, false);

    let err = client.read_unit(target(1), 8).unwrap_err();
    assert_eq!(err, ReadError::NetworkUnreachable { unit_id: 1, attempts: 1 });
    assert_eq!(connector.sends(), 1);
}

#[test]
fn test_device_exception_is_not_retried() {
    let (mut client, connector, _clock) = client();
    let request = ReadRequest::holding_registers(1, 0, 8);
    connector.push(Reply::Frame(encode_exception(&request, 0x02)));

    let err = client.read_unit(target(1), 8).unwrap_err();
    assert_eq!(err, ReadError::DeviceException { unit_id: 1, code: 0x02 });
    assert_eq!(connector.sends(), 1);
}

#[test]
fn test_corrupt_frame_then_recovery() {
    let (mut client, connector, _clock) = client();
    let request = ReadRequest::holding_registers(1, 0, 2);
    let good = encode_response(&request, &[2500, 2600]).unwrap();
    let mut corrupt = good.clone();
    corrupt[3] ^= 0x40;
    connector.push(Reply::Frame(corrupt));
    connector.push(Reply::Frame(good));

    let values = client.read_unit(target(1), 2).unwrap();
    assert_eq!(values, vec![25.0, 26.0]);
    assert_eq!(connector.sends(), 2);
    assert_eq!(client.get_stats().frame_errors, 1);
    assert_eq!(client.get_stats().responses_ok, 1);
}

#[test]
fn test_wrong_unit_counts_as_device_failure() {
    let (mut client, connector, _clock) = client();
    let other = ReadRequest::holding_registers(9, 0, 2);
    connector.set_fallback(Reply::Frame(encode_response(&other, &[2500, 2500]).unwrap()));

    let err = client.read_unit(target(1), 2).unwrap_err();
    match err {
        ReadError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(
                last,
                AttemptError::Frame(FrameError::UnitMismatch { expected: 1, received: 9 })
            );
        }
        other => panic!("unexpected error: {:?}", other),
    }
}

#[test]
fn test_retry_timing_on_virtual_clock() {
    // Per attempt: query delay 250ms, read timeout 5s, settle 3s.
    // Backoff of 1s between attempts, none after the last.
    let (mut client, _connector, clock) = client();
    let _ = client.read_unit(target(1), 8);
    assert_eq!(clock.now(), Duration::from_millis(3 * 8250 + 2 * 1000));

    let mut config = TemperatureConfig::default();
    config.retry_backoff_base = 2;
    let (mut client, _connector, clock) = client_with(&config);
    let _ = client.read_unit(target(1), 8);
    assert_eq!(clock.now(), Duration::from_millis(3 * 8250 + 1000 + 2000));
}

#[test]
fn test_backoff_schedule() {
    let mut config = TemperatureConfig::default();
    config.retry_backoff_base = 2;
    let settings = TransportSettings::from_config(&config);
    assert_eq!(settings.backoff(0), Duration::from_secs(1));
    assert_eq!(settings.backoff(1), Duration::from_secs(2));
    assert_eq!(settings.backoff(2), Duration::from_secs(4));
}

#[test]
fn test_read_units_keeps_going_after_a_failure() {
    let (mut client, connector, clock) = client();
    let request = ReadRequest::holding_registers(1, 0, 2);
    connector.push(Reply::Frame(encode_response(&request, &[2500, 2500]).unwrap()));
    // Unit 2 gets the silent fallback

    let readings = client.read_units(&[target(1), target(2)], 2);
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[0].unit_id, 1);
    assert_eq!(readings[0].result, Ok(vec![25.0, 25.0]));
    assert_eq!(readings[1].unit_id, 2);
    assert!(matches!(readings[1].result, Err(ReadError::RetriesExhausted { unit_id: 2, .. })));

    // Inter-unit pause happened before unit 2
    assert!(clock.now() >= Duration::from_millis(250 + 500));
}
