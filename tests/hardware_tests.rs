use bankguard::config::HardwareConfig;
use bankguard::frame::{encode_response, ReadRequest};
use bankguard::hardware::*;
use bankguard::transport::{ReadError, TemperatureClient, TransportError, TransportSettings, UnitTarget};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;
use std::sync::Arc;
use tempfile::TempDir;

mod common;

fn gpio_tree(config: &HardwareConfig, dir: &TempDir) {
    let pins = config
        .relay_pins
        .iter()
        .copied()
        .chain([config.converter_pin, config.alarm_pin, config.fan_pin]);
    for pin in pins {
        std::fs::create_dir_all(dir.path().join(format!("gpio{}", pin))).unwrap();
    }
}

fn pin_value(dir: &TempDir, pin: u32) -> String {
    std::fs::read_to_string(dir.path().join(format!("gpio{}", pin)).join("value")).unwrap()
}

#[test]
fn test_sysfs_actuator_drives_pins() {
    let dir = TempDir::new().unwrap();
    let mut config = HardwareConfig::default();
    config.gpio_base = dir.path().display().to_string();
    gpio_tree(&config, &dir);

    let mut actuator = SysfsActuator::new(&config);
    assert!(actuator.is_available());
    actuator.setup().unwrap();
    let direction = std::fs::read_to_string(dir.path().join("gpio17").join("direction")).unwrap();
    assert_eq!(direction, "low");

    actuator.set_line(Line::Relay(1), true).unwrap();
    actuator.set_line(Line::Converter, true).unwrap();
    assert_eq!(pin_value(&dir, 18), "1");
    assert_eq!(pin_value(&dir, 5), "1");

    actuator.reset_all().unwrap();
    for pin in [17, 18, 27, 22] {
        assert_eq!(pin_value(&dir, pin), "0");
    }
    // Reset only touches relays
    assert_eq!(pin_value(&dir, 5), "1");

    assert_eq!(
        actuator.set_line(Line::Relay(9), true),
        Err(ActuatorError::Unmapped { line: Line::Relay(9) })
    );
}

#[test]
fn test_sysfs_actuator_missing_tree() {
    let dir = TempDir::new().unwrap();
    let mut config = HardwareConfig::default();
    config.gpio_base = dir.path().join("absent").display().to_string();

    let mut actuator = SysfsActuator::new(&config);
    assert!(!actuator.is_available());
    assert!(matches!(actuator.setup(), Err(ActuatorError::Gpio { pin: 17, .. })));
}

#[test]
fn test_tcp_connector_round_trip() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let request = ReadRequest::holding_registers(1, 0, 2);
    let reply = encode_response(&request, &[2500, 2600]).unwrap();

    let peer_reply = reply.clone();
    let peer = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut frame = [0u8; 8];
        stream.read_exact(&mut frame).unwrap();
        stream.write_all(&peer_reply).unwrap();
        frame
    });

    let mut connector = TcpConnector::new();
    let mut stream = connector
        .connect("127.0.0.1", port, Duration::from_secs(2))
        .unwrap();
    stream.send(&request.encode()).unwrap();

    let mut received = Vec::new();
    while received.len() < reply.len() {
        let chunk = stream.recv_with_timeout(256, Duration::from_secs(2)).unwrap();
        assert!(!chunk.is_empty(), "peer closed early");
        received.extend_from_slice(&chunk);
    }
    assert_eq!(received, reply);
    assert_eq!(peer.join().unwrap(), request.encode());
}

#[test]
fn test_tcp_connector_refused() {
    // Bind then drop to find a port nobody listens on
    let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
    let mut connector = TcpConnector::new();
    let result = connector.connect("127.0.0.1", port, Duration::from_millis(500));
    assert!(matches!(
        result,
        Err(TransportError::ConnectionRefused | TransportError::Timeout)
    ));
}

#[test]
fn test_sim_clock_is_shared() {
    let clock = SimClock::new();
    let other = clock.clone();
    clock.sleep(Duration::from_secs(3));
    assert_eq!(other.now(), Duration::from_secs(3));
    assert_eq!(other.unix_time(), 1_700_000_003);
}

#[test]
fn test_recording_actuator_failure_injection() {
    let mut actuator = RecordingActuator::new();
    actuator.set_line(Line::Fan, true).unwrap();
    actuator.fail_line(Line::Alarm);
    assert!(actuator.set_line(Line::Alarm, true).is_err());
    assert!(actuator.is_asserted(Line::Fan));
    assert!(!actuator.is_asserted(Line::Alarm));
    assert_eq!(actuator.history(), vec![(Line::Fan, true)]);
}

#[test]
fn test_sim_unit_refuses_oversized_read() {
    let config = common::test_config();
    let (pack, clock) = common::sim_pack(&config);
    let mut client = TemperatureClient::new(
        Box::new(pack.clone()),
        Arc::new(clock.clone()),
        TransportSettings::from_config(&config.temperature),
    );
    let target = UnitTarget { unit_id: 1, port: 10001 };

    assert_eq!(
        client.read_unit(target, 128),
        Err(ReadError::DeviceException { unit_id: 1, code: 0x03 })
    );
    assert_eq!(client.read_unit(target, 8).map(|v| v.len()), Ok(8));
}
