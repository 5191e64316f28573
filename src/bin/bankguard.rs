use bankguard::config::Config;
use bankguard::control::{ControlHandler, ControlRequest};
use bankguard::hardware::{Clock, SimClock};
use bankguard::snapshot::SnapshotPublisher;
use bankguard::{Capabilities, Supervisor};
use clap::{App, Arg};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "bankguard.toml";
const SNAPSHOT_BROADCAST_BUFFER_SIZE: usize = 16;
const SLEEP_SLICE: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("bankguard")
        .version("0.1.0")
        .author("Energy Systems Engineering Team")
        .about("🔋 Battery bank supervisor - temperature monitoring and verified balancing")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file")
                .takes_value(true)
                .default_value(DEFAULT_CONFIG),
        )
        .arg(
            Arg::with_name("simulate")
                .short("s")
                .long("simulate")
                .help("Run against a simulated pack on virtual time"),
        )
        .arg(
            Arg::with_name("validate-config")
                .long("validate-config")
                .help("Check the configuration and exit"),
        )
        .arg(
            Arg::with_name("data-dir")
                .short("d")
                .long("data-dir")
                .value_name("DIR")
                .help("Directory holding calibration offsets")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("bind")
                .short("b")
                .long("bind")
                .value_name("ADDR")
                .help("Status server address, overriding the configuration")
                .takes_value(true),
        )
        .arg(
            Arg::with_name("skip-self-test")
                .long("skip-self-test")
                .help("Start polling without the startup self-test"),
        )
        .get_matches();

    let config_path = Path::new(matches.value_of("config").unwrap_or(DEFAULT_CONFIG));
    let mut config = match Config::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{} {}", "✗".red().bold(), e);
            std::process::exit(2);
        }
    };
    if let Some(dir) = matches.value_of("data-dir") {
        config.data_dir = PathBuf::from(dir);
    }
    if let Some(bind) = matches.value_of("bind") {
        config.status.bind = bind.to_string();
    }

    if matches.is_present("validate-config") {
        return match config.validate() {
            Ok(()) => {
                println!("{} {} is valid", "✓".green().bold(), config_path.display());
                Ok(())
            }
            Err(e) => {
                eprintln!("{} {}", "✗".red().bold(), e);
                std::process::exit(1);
            }
        };
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.logging.level)),
        )
        .init();

    let simulate = matches.is_present("simulate");
    println!("{}", "🔋 Battery Bank Supervisor".bright_blue().bold());
    println!("{}", "==========================".bright_blue());
    println!(
        "  Pack: {} banks x {} sensors, {} parallel",
        config.pack.num_series_banks.to_string().cyan(),
        config.pack.sensors_per_bank.to_string().cyan(),
        config.pack.number_of_parallel_batteries.to_string().cyan()
    );
    println!(
        "  Mode: {}",
        if simulate { "simulated".yellow() } else { "hardware".green() }
    );

    let (caps, pace) = if simulate {
        let (caps, _pack) = Capabilities::simulated(&config, SimClock::new())?;
        (caps, true)
    } else {
        (hardware_capabilities(&config)?, false)
    };
    let clock = Arc::clone(&caps.clock);
    let bind = config.status.bind.clone();
    let poll_interval = Duration::from_secs(config.temperature.poll_interval_s);
    let spread_threshold = config.balance.voltage_difference_to_balance;
    let self_test = config.self_test.enabled && !matches.is_present("skip-self-test");

    let supervisor = Supervisor::new(config, caps)?;
    let publisher = supervisor.publisher();
    let requests = supervisor.requests();

    let (snapshot_tx, _) = broadcast::channel(SNAPSHOT_BROADCAST_BUFFER_SIZE);
    let running = Arc::new(AtomicBool::new(true));

    let loop_running = Arc::clone(&running);
    let loop_tx = snapshot_tx.clone();
    let supervisor_thread = std::thread::Builder::new()
        .name("supervisor".into())
        .spawn(move || {
            run_supervisor(supervisor, clock, poll_interval, pace, self_test, loop_tx, loop_running);
        })?;

    let server = tokio::spawn(async move {
        if let Err(e) = start_status_server(bind, publisher, requests, spread_threshold, snapshot_tx).await {
            error!("Status server error: {}", e);
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    running.store(false, Ordering::SeqCst);
    server.abort();
    if supervisor_thread.join().is_err() {
        error!("Supervisor thread panicked");
    }
    println!("{}", "🔋 Battery Bank Supervisor stopped".bright_blue());
    Ok(())
}

#[cfg(feature = "hardware")]
fn hardware_capabilities(config: &Config) -> Result<Capabilities, Box<dyn std::error::Error>> {
    use bankguard::hardware::i2c::LinuxI2cBus;
    use bankguard::hardware::{SystemClock, SysfsActuator, TcpConnector};
    use bankguard::FileCalibrationStore;

    let mut actuator = SysfsActuator::new(&config.hardware);
    if !actuator.is_available() {
        return Err(format!("GPIO interface {} not found", config.hardware.gpio_base).into());
    }
    actuator.setup()?;
    Ok(Capabilities {
        connector: Box::new(TcpConnector::new()),
        bus: Box::new(LinuxI2cBus::new(config.hardware.i2c_bus)),
        actuator: Box::new(actuator),
        store: Box::new(FileCalibrationStore::new(&config.data_dir)),
        clock: Arc::new(SystemClock::new()),
    })
}

#[cfg(not(feature = "hardware"))]
fn hardware_capabilities(_config: &Config) -> Result<Capabilities, Box<dyn std::error::Error>> {
    Err("built without the `hardware` feature; run with --simulate".into())
}

fn run_supervisor(
    mut supervisor: Supervisor,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
    pace: bool,
    self_test: bool,
    snapshot_tx: broadcast::Sender<String>,
    running: Arc<AtomicBool>,
) {
    if self_test {
        let report = supervisor.run_self_test();
        if report.passed {
            info!("✅ Self-test passed after {} attempt(s)", report.attempts);
        } else {
            warn!("⚠️  Self-test failed: {}", report.failures.join("; "));
        }
    }

    while running.load(Ordering::SeqCst) {
        let outcome = supervisor.poll();
        let snapshot = &outcome.snapshot;
        info!(
            "📊 Poll {}: {} alerts, {:.2}V total{}",
            snapshot.poll,
            snapshot.alerts.len(),
            snapshot.total_voltage,
            if snapshot.balancer_latched { ", balancer latched" } else { "" }
        );
        match serde_json::to_string(&**snapshot) {
            // No subscribers is not an error.
            Ok(json) => {
                let _ = snapshot_tx.send(json);
            }
            Err(e) => warn!("Failed to serialize snapshot: {}", e),
        }

        let mut waited = Duration::ZERO;
        while waited < poll_interval && running.load(Ordering::SeqCst) {
            let slice = SLEEP_SLICE.min(poll_interval - waited);
            clock.sleep(slice);
            if pace {
                std::thread::sleep(slice);
            }
            waited += slice;
        }
    }
    supervisor.shutdown();
}

async fn start_status_server(
    bind: String,
    publisher: SnapshotPublisher,
    requests: Sender<ControlRequest>,
    spread_threshold: f64,
    snapshot_tx: broadcast::Sender<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(&bind).await?;
    info!("🌐 Status server listening on {}", bind);

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                info!("🔗 New client connected: {}", addr);
                let handler = ControlHandler::new(requests.clone(), spread_threshold);
                let client_publisher = publisher.clone();
                let client_snapshot_rx = snapshot_tx.subscribe();

                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, handler, client_publisher, client_snapshot_rx).await {
                        warn!("Client {} error: {}", addr, e);
                    }
                    info!("🔌 Client {} disconnected", addr);
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}

async fn handle_client(
    stream: TcpStream,
    mut handler: ControlHandler,
    publisher: SnapshotPublisher,
    mut snapshot_rx: broadcast::Receiver<String>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let (reader, writer) = stream.into_split();
    let mut buf_reader = BufReader::new(reader);
    let writer = Arc::new(Mutex::new(writer));

    let snapshot_writer = Arc::clone(&writer);
    let snapshot_task = tokio::spawn(async move {
        while let Ok(snapshot) = snapshot_rx.recv().await {
            let mut writer_guard = snapshot_writer.lock().await;
            if let Err(e) = writer_guard.write_all(snapshot.as_bytes()).await {
                warn!("Failed to send snapshot: {}", e);
                break;
            }
            if let Err(e) = writer_guard.write_all(b"\n").await {
                warn!("Failed to send snapshot newline: {}", e);
                break;
            }
        }
    });

    let mut line = String::new();
    loop {
        line.clear();
        match buf_reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let response = match handler.parse_command(trimmed) {
                    Ok(command) => {
                        info!("📨 Received command: {:?}", command);
                        handler.handle(&command, &publisher.load())
                    }
                    Err(e) => {
                        warn!("Failed to parse command: {}", e);
                        ControlHandler::error_response(&e)
                    }
                };
                let response_json = handler.serialize_response(&response)?;
                let mut writer_guard = writer.lock().await;
                writer_guard.write_all(response_json.as_bytes()).await?;
                writer_guard.write_all(b"\n").await?;
            }
            Err(e) => {
                error!("Error reading from client: {}", e);
                break;
            }
        }
    }

    snapshot_task.abort();
    Ok(())
}
