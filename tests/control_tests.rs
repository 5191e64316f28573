use bankguard::balance::RequestOrigin;
use bankguard::control::*;
use bankguard::snapshot::Snapshot;
use std::sync::mpsc;

mod common;

fn snapshot_with(voltages: &[f64]) -> Snapshot {
    let mut snapshot = Snapshot::empty(1_700_000_000);
    snapshot.poll = 4;
    snapshot.voltages = voltages.iter().map(|&v| Some(v)).collect();
    snapshot.total_voltage = voltages.iter().sum();
    snapshot
}

fn command(id: u32, command: CommandType) -> ControlCommand {
    ControlCommand { id, command }
}

#[test]
fn test_parse_command() {
    let (tx, _rx) = mpsc::channel();
    let mut handler = ControlHandler::new(tx, 0.1);

    let cmd = handler.parse_command(r#"{"id": 7, "command": "Balance"}"#).unwrap();
    assert_eq!(cmd.id, 7);
    assert_eq!(cmd.command, CommandType::Balance);

    let cmd = handler.parse_command(r#"{"id": 8, "command": "ResetLatch"}"#).unwrap();
    assert_eq!(cmd.command, CommandType::ResetLatch);
}

#[test]
fn test_parse_rejects_bad_input() {
    let (tx, _rx) = mpsc::channel();
    let mut handler = ControlHandler::new(tx, 0.1);

    let oversized = format!(r#"{{"id": 1, "command": "Status", "pad": "{}"}}"#, "x".repeat(600));
    assert!(matches!(
        handler.parse_command(&oversized),
        Err(ControlError::MessageTooLarge)
    ));

    assert!(matches!(
        handler.parse_command("not json"),
        Err(ControlError::InvalidJson(_))
    ));
    assert!(matches!(
        handler.parse_command(r#"{"id": 1, "command": "SelfDestruct"}"#),
        Err(ControlError::InvalidJson(_))
    ));
}

#[test]
fn test_status_returns_snapshot() {
    let (tx, rx) = mpsc::channel();
    let mut handler = ControlHandler::new(tx, 0.1);
    let snapshot = snapshot_with(&[19.8, 19.8, 19.8]);

    let response = handler.handle(&command(1, CommandType::Status), &snapshot);
    assert_eq!(response.id, 1);
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.snapshot.as_ref().map(|s| s.poll), Some(4));
    assert!(rx.try_recv().is_err());

    // Snapshot responses are not squeezed into the bounded buffer
    let json = handler.serialize_response(&response).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["snapshot"]["poll"], 4);
    assert_eq!(value["status"], "Success");
}

#[test]
fn test_balance_is_queued() {
    let (tx, rx) = mpsc::channel();
    let handler = ControlHandler::new(tx, 0.1);
    let snapshot = snapshot_with(&[19.8, 20.4, 19.2]);

    let response = handler.handle(&command(2, CommandType::Balance), &snapshot);
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(
        response.message.as_deref(),
        Some("Balancing initiated from Bank 2 to Bank 3")
    );

    match rx.try_recv().unwrap() {
        ControlRequest::Balance(request) => {
            assert_eq!((request.source, request.dest), (2, 3));
            assert_eq!(request.origin, RequestOrigin::Manual);
        }
        other => panic!("unexpected request: {:?}", other),
    }
}

#[test]
fn test_balance_rejections() {
    let (tx, rx) = mpsc::channel();
    let handler = ControlHandler::new(tx, 0.1);

    let flat = snapshot_with(&[19.8, 19.82, 19.8]);
    let response = handler.handle(&command(3, CommandType::Balance), &flat);
    assert_eq!(response.status, ResponseStatus::Rejected);
    assert_eq!(
        response.message.as_deref(),
        Some("Voltage difference too small for balancing")
    );

    let mut alerting = snapshot_with(&[20.4, 19.8, 19.2]);
    alerting.alerts.push("Bank 1: High voltage (21.50V).".to_string());
    let response = handler.handle(&command(4, CommandType::Balance), &alerting);
    assert_eq!(response.message.as_deref(), Some("Cannot balance with active alerts"));

    let mut busy = snapshot_with(&[20.4, 19.8, 19.2]);
    busy.balancing = true;
    let response = handler.handle(&command(5, CommandType::Balance), &busy);
    assert_eq!(response.message.as_deref(), Some("Balancing already in progress"));

    assert!(rx.try_recv().is_err());
}

#[test]
fn test_reset_latch_is_queued() {
    let (tx, rx) = mpsc::channel();
    let handler = ControlHandler::new(tx, 0.1);

    let response = handler.handle(&command(6, CommandType::ResetLatch), &Snapshot::empty(0));
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(response.message.as_deref(), Some("Latch reset requested"));
    assert_eq!(rx.try_recv().unwrap(), ControlRequest::ResetLatch);
}

#[test]
fn test_supervisor_gone() {
    let (tx, rx) = mpsc::channel();
    drop(rx);
    let mut handler = ControlHandler::new(tx, 0.1);

    let response = handler.handle(&command(9, CommandType::ResetLatch), &Snapshot::empty(0));
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.message.as_deref(), Some("supervisor is not running"));

    let json = handler.serialize_response(&response).unwrap();
    assert!(!json.contains("snapshot"));
}

#[test]
fn test_error_response_for_unparsed_line() {
    let response = ControlHandler::error_response(&ControlError::MessageTooLarge);
    assert_eq!(response.id, 0);
    assert_eq!(response.status, ResponseStatus::Error);
    assert_eq!(response.message.as_deref(), Some("message exceeds 512 bytes"));
}

#[test]
fn test_control_drives_supervisor() {
    let (mut supervisor, pack, _clock) = common::sim_supervisor(common::test_config());
    common::spread_pack(&pack);
    // First poll balances 1 -> 3 on its own and starts the rest period
    supervisor.poll();

    let handler = ControlHandler::new(supervisor.requests(), 0.1);
    let response = handler.handle(&command(1, CommandType::Balance), &supervisor.publisher().load());
    assert_eq!(response.status, ResponseStatus::Success);

    let outcome = supervisor.poll();
    let report = outcome.balance.expect("queued balance ran");
    assert_eq!(report.origin, RequestOrigin::Manual);
    assert_eq!((report.source_bank, report.dest_bank), (1, 3));
}
