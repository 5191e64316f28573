//! Deterministic stand-ins for every capability.
//!
//! Time only moves when something sleeps on [`SimClock`], so a whole
//! balance run or a retry ladder completes instantly and repeatably.
//! [`SimPack`] models the pack itself: bank voltages that move when the
//! converter is on and the relays route a mapped pair, and temperature
//! units that answer real bus frames.

use super::{Actuator, ActuatorError, Bus, BusError, ByteStream, Clock, Connector, Line};
use crate::balance::RelayTable;
use crate::config::Config;
use crate::frame::{encode_exception, encode_response, ReadRequest, ILLEGAL_DATA_VALUE};
use crate::transport::TransportError;
use crate::voltage::VoltageSettings;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const SIM_EPOCH: u64 = 1_700_000_000;
const LCG_SEED: u64 = 0x1234_5678_9ABC_DEF0;
const AMBIENT_C: f64 = 25.0;
const SENSOR_SPREAD_C: f64 = 1.0; // raw sensors scatter +/-0.5 around ambient
const NOMINAL_BANK_V: f64 = 19.8;
const TRANSFER_V_PER_S: f64 = 0.04;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared virtual time. Clones observe the same instant.
#[derive(Debug, Clone, Default)]
pub struct SimClock {
    micros: Arc<AtomicU64>,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, duration: Duration) {
        self.micros
            .fetch_add(duration.as_micros() as u64, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }

    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }

    fn unix_time(&self) -> u64 {
        SIM_EPOCH + self.now().as_secs()
    }
}

#[derive(Debug)]
struct PackState {
    clock: SimClock,
    voltage: VoltageSettings,
    relays_table: RelayTable,
    relay_lines: usize,
    bank_volts: Vec<f64>,
    last_update: Duration,
    relays: BTreeSet<u8>,
    converter: bool,
    alarm: bool,
    fan: bool,
    stuck_relays: bool,
    selected: Option<usize>,
    units: Vec<u8>,
    sensors_per_unit: usize,
    temperatures: Vec<f64>,
    offline_units: HashSet<u8>,
    exceptions: HashMap<u8, u8>,
    network_down: bool,
    bus_dead: bool,
    connects: u32,
    requests: u32,
}

impl PackState {
    /// Integrates charge transfer since the last update.
    fn settle(&mut self) {
        let now = self.clock.now();
        let dt = now.saturating_sub(self.last_update).as_secs_f64();
        self.last_update = now;
        if !self.converter || self.stuck_relays || dt <= 0.0 {
            return;
        }
        let asserted: Vec<u8> = self.relays.iter().copied().collect();
        if let Some((source, dest)) = self.relays_table.pair_for(&asserted) {
            let moved = TRANSFER_V_PER_S * dt;
            self.bank_volts[source - 1] = (self.bank_volts[source - 1] - moved).max(0.0);
            self.bank_volts[dest - 1] += moved;
        }
    }

    fn answer(&mut self, request: &ReadRequest) -> Option<Vec<u8>> {
        self.requests = self.requests.wrapping_add(1);
        if self.offline_units.contains(&request.unit_id) {
            return None;
        }
        if let Some(&code) = self.exceptions.get(&request.unit_id) {
            return Some(encode_exception(request, code));
        }
        let index = self.units.iter().position(|&u| u == request.unit_id)?;
        let first = index * self.sensors_per_unit + usize::from(request.start_address);
        let registers: Vec<i16> = (0..usize::from(request.count))
            .map(|i| {
                let celsius = self.temperatures.get(first + i).copied().unwrap_or(0.0);
                (celsius * 100.0).round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
            })
            .collect();
        Some(
            encode_response(request, &registers)
                .unwrap_or_else(|_| encode_exception(request, ILLEGAL_DATA_VALUE)),
        )
    }
}

/// Simulated pack: voltage front end, temperature units and output lines.
/// Clones are handles onto the same pack.
#[derive(Debug, Clone)]
pub struct SimPack {
    state: Arc<Mutex<PackState>>,
}

impl SimPack {
    pub fn new(config: &Config, relays: RelayTable, clock: SimClock) -> Self {
        let banks = config.pack.num_series_banks;
        let sensors_per_unit = banks * config.pack.sensors_per_bank;
        let units = config.temperature.unit_ids.clone();

        let mut rng = LCG_SEED;
        let mut next = move || {
            rng = rng.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            ((rng >> 33) % 1000) as f64 / 1000.0
        };
        let temperatures = (0..units.len() * sensors_per_unit)
            .map(|_| AMBIENT_C + (next() - 0.5) * SENSOR_SPREAD_C)
            .collect();

        Self {
            state: Arc::new(Mutex::new(PackState {
                voltage: VoltageSettings::from_config(&config.voltage, banks),
                relay_lines: relays.relay_lines(),
                relays_table: relays,
                bank_volts: vec![NOMINAL_BANK_V; banks],
                last_update: clock.now(),
                clock,
                relays: BTreeSet::new(),
                converter: false,
                alarm: false,
                fan: false,
                stuck_relays: false,
                selected: None,
                units,
                sensors_per_unit,
                temperatures,
                offline_units: HashSet::new(),
                exceptions: HashMap::new(),
                network_down: false,
                bus_dead: false,
                connects: 0,
                requests: 0,
            })),
        }
    }

    pub fn set_bank_voltage(&self, bank: usize, volts: f64) {
        let mut state = lock(&self.state);
        state.settle();
        if let Some(v) = state.bank_volts.get_mut(bank.wrapping_sub(1)) {
            *v = volts;
        }
    }

    pub fn bank_voltage(&self, bank: usize) -> Option<f64> {
        let mut state = lock(&self.state);
        state.settle();
        state.bank_volts.get(bank.wrapping_sub(1)).copied()
    }

    /// Raw (uncalibrated) temperature of a 1-based channel.
    pub fn set_temperature(&self, channel: usize, celsius: f64) {
        if let Some(t) = lock(&self.state).temperatures.get_mut(channel.wrapping_sub(1)) {
            *t = celsius;
        }
    }

    pub fn temperature(&self, channel: usize) -> Option<f64> {
        lock(&self.state).temperatures.get(channel.wrapping_sub(1)).copied()
    }

    pub fn set_all_temperatures(&self, celsius: f64) {
        for t in &mut lock(&self.state).temperatures {
            *t = celsius;
        }
    }

    pub fn set_unit_offline(&self, unit_id: u8, offline: bool) {
        let mut state = lock(&self.state);
        if offline {
            state.offline_units.insert(unit_id);
        } else {
            state.offline_units.remove(&unit_id);
        }
    }

    pub fn set_unit_exception(&self, unit_id: u8, code: Option<u8>) {
        let mut state = lock(&self.state);
        match code {
            Some(code) => state.exceptions.insert(unit_id, code),
            None => state.exceptions.remove(&unit_id),
        };
    }

    pub fn set_network_down(&self, down: bool) {
        lock(&self.state).network_down = down;
    }

    /// Relays that click but never close: the converter runs, nothing moves.
    pub fn set_stuck_relays(&self, stuck: bool) {
        let mut state = lock(&self.state);
        state.settle();
        state.stuck_relays = stuck;
    }

    pub fn set_bus_dead(&self, dead: bool) {
        lock(&self.state).bus_dead = dead;
    }

    pub fn line(&self, line: Line) -> bool {
        let state = lock(&self.state);
        match line {
            Line::Relay(n) => state.relays.contains(&n),
            Line::Converter => state.converter,
            Line::Alarm => state.alarm,
            Line::Fan => state.fan,
        }
    }

    pub fn asserted_relays(&self) -> Vec<u8> {
        lock(&self.state).relays.iter().copied().collect()
    }

    pub fn connects(&self) -> u32 {
        lock(&self.state).connects
    }

    pub fn requests(&self) -> u32 {
        lock(&self.state).requests
    }
}

impl Bus for SimPack {
    fn read_word(&mut self, address: u8, _register: u8) -> Result<u16, BusError> {
        let mut state = lock(&self.state);
        if state.bus_dead {
            return Err(BusError::Io("bus stuck low".to_string()));
        }
        if address != state.voltage.meter_address {
            return Err(BusError::NoDevice(address));
        }
        state.settle();
        let bank = state.selected.ok_or(BusError::NoDevice(address))?;
        let volts = state.bank_volts.get(bank).copied().unwrap_or(0.0);
        let code = state.voltage.volts_to_code(volts, bank + 1);
        Ok(code.swap_bytes())
    }

    fn write_word(&mut self, address: u8, _register: u8, _value: u16) -> Result<(), BusError> {
        let state = lock(&self.state);
        if state.bus_dead {
            return Err(BusError::Io("bus stuck low".to_string()));
        }
        if address != state.voltage.meter_address {
            return Err(BusError::NoDevice(address));
        }
        Ok(())
    }

    fn write_byte(&mut self, address: u8, value: u8) -> Result<(), BusError> {
        let mut state = lock(&self.state);
        if state.bus_dead {
            return Err(BusError::Io("bus stuck low".to_string()));
        }
        if address == state.voltage.multiplexer_address {
            state.selected = (value != 0).then(|| value.trailing_zeros() as usize);
            Ok(())
        } else if address == state.voltage.meter_address {
            Ok(())
        } else {
            Err(BusError::NoDevice(address))
        }
    }
}

impl Actuator for SimPack {
    fn set_line(&mut self, line: Line, asserted: bool) -> Result<(), ActuatorError> {
        let mut state = lock(&self.state);
        state.settle();
        match line {
            Line::Relay(n) => {
                if usize::from(n) >= state.relay_lines {
                    return Err(ActuatorError::Unmapped { line });
                }
                if asserted {
                    state.relays.insert(n);
                } else {
                    state.relays.remove(&n);
                }
            }
            Line::Converter => state.converter = asserted,
            Line::Alarm => state.alarm = asserted,
            Line::Fan => state.fan = asserted,
        }
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), ActuatorError> {
        let mut state = lock(&self.state);
        state.settle();
        state.relays.clear();
        Ok(())
    }
}

impl Connector for SimPack {
    fn connect(
        &mut self,
        _host: &str,
        _port: u16,
        timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, TransportError> {
        let mut state = lock(&self.state);
        state.connects = state.connects.wrapping_add(1);
        if state.network_down {
            state.clock.sleep(timeout);
            return Err(TransportError::Timeout);
        }
        Ok(Box::new(SimStream {
            pack: Arc::clone(&self.state),
            pending: VecDeque::new(),
            silent: false,
        }))
    }
}

struct SimStream {
    pack: Arc<Mutex<PackState>>,
    pending: VecDeque<u8>,
    silent: bool,
}

impl ByteStream for SimStream {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut state = lock(&self.pack);
        // Units ignore frames they cannot parse, exactly like a real drop.
        let reply = ReadRequest::decode(bytes).ok().and_then(|r| state.answer(&r));
        match reply {
            Some(frame) => {
                self.pending.extend(frame);
                self.silent = false;
            }
            None => self.silent = true,
        }
        Ok(())
    }

    fn recv_with_timeout(
        &mut self,
        max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        if self.silent {
            lock(&self.pack).clock.sleep(timeout);
            return Err(TransportError::Timeout);
        }
        let take = max_bytes.min(self.pending.len());
        Ok(self.pending.drain(..take).collect())
    }
}

/// How a scripted peer answers one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The whole frame in one read.
    Frame(Vec<u8>),
    /// The frame split across successive reads.
    Bursts(Vec<Vec<u8>>),
    /// Nothing at all; every read times out.
    Silence,
}

#[derive(Debug)]
struct Script {
    replies: VecDeque<Reply>,
    fallback: Reply,
    reachable: bool,
    reachability: VecDeque<bool>,
    connects: u32,
    sends: u32,
}

/// Bridge whose answers are queued up front, for exercising the transport
/// against exact byte sequences. Once the queue is empty every request
/// gets the fallback reply.
#[derive(Debug, Clone)]
pub struct ScriptedConnector {
    script: Arc<Mutex<Script>>,
    clock: SimClock,
}

impl ScriptedConnector {
    pub fn new(clock: SimClock) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                replies: VecDeque::new(),
                fallback: Reply::Silence,
                reachable: true,
                reachability: VecDeque::new(),
                connects: 0,
                sends: 0,
            })),
            clock,
        }
    }

    pub fn push(&self, reply: Reply) {
        lock(&self.script).replies.push_back(reply);
    }

    pub fn set_fallback(&self, reply: Reply) {
        lock(&self.script).fallback = reply;
    }

    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.script).reachable = reachable;
    }

    /// Decides whether the next connect succeeds. Queued outcomes are
    /// used one per connect, then `set_reachable` applies again.
    pub fn push_reachability(&self, reachable: bool) {
        lock(&self.script).reachability.push_back(reachable);
    }

    pub fn connects(&self) -> u32 {
        lock(&self.script).connects
    }

    pub fn sends(&self) -> u32 {
        lock(&self.script).sends
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &mut self,
        _host: &str,
        _port: u16,
        _timeout: Duration,
    ) -> Result<Box<dyn ByteStream>, TransportError> {
        let mut script = lock(&self.script);
        script.connects = script.connects.wrapping_add(1);
        let reachable = script.reachability.pop_front().unwrap_or(script.reachable);
        if !reachable {
            return Err(TransportError::ConnectionRefused);
        }
        Ok(Box::new(ScriptedStream {
            script: Arc::clone(&self.script),
            clock: self.clock.clone(),
            reply: None,
        }))
    }
}

struct ScriptedStream {
    script: Arc<Mutex<Script>>,
    clock: SimClock,
    reply: Option<VecDeque<Vec<u8>>>,
}

impl ByteStream for ScriptedStream {
    fn send(&mut self, _bytes: &[u8]) -> Result<(), TransportError> {
        let mut script = lock(&self.script);
        script.sends = script.sends.wrapping_add(1);
        let reply = script
            .replies
            .pop_front()
            .unwrap_or_else(|| script.fallback.clone());
        self.reply = match reply {
            Reply::Frame(frame) => Some(VecDeque::from([frame])),
            Reply::Bursts(bursts) => Some(bursts.into()),
            Reply::Silence => None,
        };
        Ok(())
    }

    fn recv_with_timeout(
        &mut self,
        _max_bytes: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError> {
        match &mut self.reply {
            None => {
                self.clock.sleep(timeout);
                Err(TransportError::Timeout)
            }
            Some(bursts) => Ok(bursts.pop_front().unwrap_or_default()),
        }
    }
}

/// Actuator that only remembers what it was told.
#[derive(Debug, Clone, Default)]
pub struct RecordingActuator {
    history: Arc<Mutex<Vec<(Line, bool)>>>,
    failing: Arc<Mutex<HashSet<Line>>>,
}

impl RecordingActuator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `set_line` call in order; a reset shows up as relay deasserts.
    pub fn history(&self) -> Vec<(Line, bool)> {
        lock(&self.history).clone()
    }

    pub fn is_asserted(&self, line: Line) -> bool {
        lock(&self.history)
            .iter()
            .rev()
            .find(|(l, _)| *l == line)
            .is_some_and(|(_, on)| *on)
    }

    pub fn fail_line(&self, line: Line) {
        lock(&self.failing).insert(line);
    }
}

impl Actuator for RecordingActuator {
    fn set_line(&mut self, line: Line, asserted: bool) -> Result<(), ActuatorError> {
        if lock(&self.failing).contains(&line) {
            return Err(ActuatorError::Gpio {
                pin: 0,
                reason: "injected failure".to_string(),
            });
        }
        lock(&self.history).push((line, asserted));
        Ok(())
    }

    fn reset_all(&mut self) -> Result<(), ActuatorError> {
        let asserted: Vec<Line> = {
            let history = lock(&self.history);
            let mut on: Vec<Line> = Vec::new();
            for (line, state) in history.iter() {
                if let Line::Relay(_) = line {
                    on.retain(|l| l != line);
                    if *state {
                        on.push(*line);
                    }
                }
            }
            on
        };
        let mut history = lock(&self.history);
        for line in asserted {
            history.push((line, false));
        }
        Ok(())
    }
}
