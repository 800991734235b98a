//! Offline stand-in for a gateway and its bank of meters.
//!
//! A [`SimulatedMeterBank`] answers MCW commands the way the real hardware does: it unescapes the
//! request, checks the CRC, applies reads and writes to a register store per meter and answers with
//! an `F<id>,...` segment using the compact escape forms the gateway emits. Busy calibration steps
//! read as not ready for a few polls before the status register flips to `2.0`.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::debug;

use crate::codec::{append_crc, crc16, decode_escapes};
use crate::error::{Error, Result};
use crate::register::{
    CAL_DONE_CONFIRMED, CAL_DONE_VALUE, CALIBRATION_UNLOCK, FunctionCode, MeterRegister,
    STEP_READY,
};
use crate::topology::Socket;
use crate::transport::{Connector, Transport};

/// Something that happened on a simulated connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JournalEntry {
    Opened(Socket),
    Sent(Socket, String),
    Closed(Socket),
}

/// Shared record of every simulated connection, kept after the transports are gone.
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<JournalEntry>>>);

impl Journal {
    fn push(&self, entry: JournalEntry) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    pub fn entries(&self) -> Vec<JournalEntry> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Commands sent to `socket`, in order.
    pub fn sent_to(&self, socket: &Socket) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                JournalEntry::Sent(s, command) if &s == socket => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn opened(&self, socket: &Socket) -> usize {
        self.count(|e| matches!(e, JournalEntry::Opened(s) if s == socket))
    }

    pub fn closed(&self, socket: &Socket) -> usize {
        self.count(|e| matches!(e, JournalEntry::Closed(s) if s == socket))
    }

    fn count(&self, predicate: impl Fn(&JournalEntry) -> bool) -> usize {
        self.entries().iter().filter(|e| predicate(e)).count()
    }
}

/// How one simulated meter misbehaves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeterBehaviour {
    /// Busy steps never finish.
    pub never_ready: bool,
    /// The meter never answers at all.
    pub silent: bool,
    /// Replies lost on the way back before the meter is heard. Requests still take effect.
    pub lost_replies: u32,
}

#[derive(Debug, Clone)]
struct SimulatedMeter {
    registers: BTreeMap<u16, u16>,
    behaviour: MeterBehaviour,
    busy_remaining: u32,
    finishing: bool,
    replies_lost: u32,
}

impl SimulatedMeter {
    fn new(local: u16, behaviour: MeterBehaviour) -> Self {
        let mut meter = Self {
            registers: BTreeMap::new(),
            behaviour,
            busy_remaining: 0,
            finishing: false,
            replies_lost: 0,
        };
        // Nominal readings with the applied calibration input.
        let offset = local as f32 * 0.1;
        for phase in 0..3u16 {
            meter.set_float(phase * 2, 230.0 + offset);
            meter.set_float(6 + phase * 2, 5.0);
            meter.set_float(12 + phase * 2, 1150.0 + offset);
        }
        meter.set_float(MeterRegister::CalDone.into(), 0.0);
        meter
    }

    fn set_float(&mut self, register: u16, value: f32) {
        let bytes = value.to_be_bytes();
        self.registers
            .insert(register, u16::from_be_bytes([bytes[0], bytes[1]]));
        if let Some(next) = register.checked_add(1) {
            self.registers
                .insert(next, u16::from_be_bytes([bytes[2], bytes[3]]));
        }
    }

    fn read(&mut self, start: u16, count: u16) -> Vec<u8> {
        let status = u16::from(MeterRegister::CalDone);
        let end = start.saturating_add(count);
        if (start..end).contains(&status) && !self.behaviour.never_ready {
            if self.busy_remaining > 0 {
                self.busy_remaining -= 1;
            } else if self.finishing {
                self.finishing = false;
                self.set_float(status, STEP_READY);
            }
        }
        // Addresses past 0xFFFF read as zero.
        (0..count)
            .map(|i| start.checked_add(i))
            .flat_map(|r| {
                r.and_then(|r| self.registers.get(&r).copied())
                    .unwrap_or(0)
                    .to_be_bytes()
            })
            .collect()
    }

    fn write(&mut self, start: u16, words: &[u16], busy_polls: u32) {
        for (offset, word) in words.iter().enumerate() {
            let Some(register) = u16::try_from(offset).ok().and_then(|o| start.checked_add(o))
            else {
                break;
            };
            self.registers.insert(register, *word);
        }
        if words.len() < 2 {
            return;
        }
        let value = f32::from_be_bytes({
            let [a, b] = words[0].to_be_bytes();
            let [c, d] = words[1].to_be_bytes();
            [a, b, c, d]
        });
        if start == u16::from(MeterRegister::Command) && value != CALIBRATION_UNLOCK as f32 {
            self.busy_remaining = busy_polls;
            self.finishing = true;
            self.set_float(MeterRegister::CalDone.into(), 0.0);
        } else if start == u16::from(MeterRegister::CalDone) && value == CAL_DONE_VALUE {
            self.set_float(start, CAL_DONE_CONFIRMED);
        }
    }
}

/// Settings for one simulated gateway.
#[derive(Debug, Clone)]
pub struct BankSettings {
    pub slave_id: u8,
    pub meters: u16,
    /// Status reads a busy meter answers with "not ready" before it finishes.
    pub busy_polls: u32,
    /// Echo each command back before the answer, as some gateways do.
    pub echo: bool,
    /// Fail every send after this many have succeeded.
    pub fail_after: Option<usize>,
    pub behaviour: HashMap<u16, MeterBehaviour>,
}

impl Default for BankSettings {
    fn default() -> Self {
        Self {
            slave_id: 1,
            meters: 10,
            busy_polls: 2,
            echo: true,
            fail_after: None,
            behaviour: HashMap::new(),
        }
    }
}

/// A simulated gateway connection.
#[derive(Debug)]
pub struct SimulatedMeterBank {
    socket: Socket,
    settings: BankSettings,
    meters: BTreeMap<u16, SimulatedMeter>,
    outbox: Vec<u8>,
    sends: usize,
    journal: Journal,
    open: bool,
}

impl SimulatedMeterBank {
    pub fn new(socket: Socket, settings: BankSettings, journal: Journal) -> Self {
        let meters = (1..=settings.meters)
            .map(|local| {
                let behaviour = settings.behaviour.get(&local).copied().unwrap_or_default();
                (local, SimulatedMeter::new(local, behaviour))
            })
            .collect();
        journal.push(JournalEntry::Opened(socket.clone()));
        Self {
            socket,
            settings,
            meters,
            outbox: Vec::new(),
            sends: 0,
            journal,
            open: true,
        }
    }

    fn handle(&mut self, command: &str) {
        let Some((local, payload)) = command
            .strip_prefix("MCW")
            .and_then(|rest| rest.split_once(','))
        else {
            // Plain gateway command.
            self.outbox.extend_from_slice(command.as_bytes());
            self.outbox.extend_from_slice(b" OK\r");
            return;
        };
        let Ok(local) = local.parse::<u16>() else {
            return;
        };
        let frame = decode_escapes(payload.as_bytes());
        let busy_polls = self.settings.busy_polls;
        let slave_id = self.settings.slave_id;

        let targets: Vec<u16> = if local == 0 {
            self.meters.keys().copied().collect()
        } else {
            vec![local]
        };
        for target in targets {
            let Some(meter) = self.meters.get_mut(&target) else {
                continue;
            };
            let Some(response) = respond(meter, slave_id, &frame, busy_polls) else {
                continue;
            };
            if local == 0 || meter.behaviour.silent {
                continue;
            }
            if meter.replies_lost < meter.behaviour.lost_replies {
                meter.replies_lost += 1;
                continue;
            }
            self.outbox
                .extend_from_slice(format!("F{target},MCW{target},").as_bytes());
            self.outbox.extend_from_slice(&gateway_escape(&response));
            self.outbox.push(b'\r');
        }
    }
}

/// Apply `frame` to `meter` and build its answer. `None` when a real meter would stay quiet.
fn respond(meter: &mut SimulatedMeter, slave_id: u8, frame: &[u8], busy_polls: u32) -> Option<Vec<u8>> {
    if frame.len() < 4 || frame[0] != slave_id {
        return None;
    }
    let (body, crc) = frame.split_at(frame.len() - 2);
    if crc16(body).to_le_bytes().as_slice() != crc {
        debug!("Simulated meter ignores frame with bad CRC");
        return None;
    }
    let exception = |code: u8| {
        let mut response = vec![slave_id, body[1] | 0x80, code];
        append_crc(&mut response);
        Some(response)
    };
    if body.len() < 6 {
        return exception(0x03);
    }
    let start = u16::from_be_bytes([body[2], body[3]]);
    let count = u16::from_be_bytes([body[4], body[5]]);

    let mut response = match FunctionCode::try_from(body[1]) {
        Ok(FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters) => {
            if count == 0 || count > 125 {
                return exception(0x03);
            }
            let data = meter.read(start, count);
            let mut response = vec![slave_id, body[1], data.len() as u8];
            response.extend(data);
            response
        }
        Ok(FunctionCode::WriteMultipleRegisters) => {
            let byte_count = *body.get(6)? as usize;
            let data = body.get(7..7 + byte_count)?;
            if byte_count != count as usize * 2 {
                return exception(0x03);
            }
            let words: Vec<u16> = data
                .chunks_exact(2)
                .map(|w| u16::from_be_bytes([w[0], w[1]]))
                .collect();
            meter.write(start, &words, busy_polls);
            body[..6].to_vec()
        }
        Err(_) => return exception(0x01),
    };
    append_crc(&mut response);
    Some(response)
}

/// Escape `bytes` with the mix of forms the gateway uses: printable characters as they are,
/// control bytes as `^X`, high bytes as `<NNN>`, and `^h` hex for the rest.
pub fn gateway_escape(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len() * 2);
    for byte in bytes {
        match *byte {
            b'^' | b'<' | 0x7F => out.extend_from_slice(format!("^h{:02X}", byte).as_bytes()),
            0x00..=0x1F => out.extend_from_slice(&[b'^', byte | 0x40]),
            0x80..=0xFF => out.extend_from_slice(format!("<{}>", byte).as_bytes()),
            _ => out.push(*byte),
        }
    }
    out
}

impl Transport for SimulatedMeterBank {
    fn send(&mut self, command: &str) -> Result<()> {
        if !self.open {
            return Err(Error::Transport {
                kind: embedded_io::ErrorKind::NotConnected,
                message: "transport already closed".into(),
            });
        }
        if self.settings.fail_after.is_some_and(|n| self.sends >= n) {
            return Err(Error::Transport {
                kind: embedded_io::ErrorKind::ConnectionReset,
                message: format!("simulated failure on {}", self.socket),
            });
        }
        self.sends += 1;
        self.journal
            .push(JournalEntry::Sent(self.socket.clone(), command.to_string()));
        if self.settings.echo {
            self.outbox.extend_from_slice(command.as_bytes());
            self.outbox.push(b'\r');
        }
        self.handle(command);
        Ok(())
    }

    fn receive_all(&mut self, _timeout: Duration) -> Result<Vec<u8>> {
        Ok(std::mem::take(&mut self.outbox))
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.journal.push(JournalEntry::Closed(self.socket.clone()));
        }
    }
}

impl Drop for SimulatedMeterBank {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens [`SimulatedMeterBank`]s, one per socket.
#[derive(Debug, Clone, Default)]
pub struct SimulatedConnector {
    defaults: BankSettings,
    per_socket: HashMap<Socket, BankSettings>,
    refused: HashSet<Socket>,
    journal: Journal,
}

impl SimulatedConnector {
    pub fn new(defaults: BankSettings) -> Self {
        Self {
            defaults,
            ..Default::default()
        }
    }

    pub fn journal(&self) -> Journal {
        self.journal.clone()
    }

    fn settings_mut(&mut self, socket: &Socket) -> &mut BankSettings {
        self.per_socket
            .entry(socket.clone())
            .or_insert_with(|| self.defaults.clone())
    }

    /// Busy steps on `local` of `socket` never finish.
    pub fn never_ready(mut self, socket: &Socket, local: u16) -> Self {
        self.settings_mut(socket)
            .behaviour
            .entry(local)
            .or_default()
            .never_ready = true;
        self
    }

    pub fn silent(mut self, socket: &Socket, local: u16) -> Self {
        self.settings_mut(socket)
            .behaviour
            .entry(local)
            .or_default()
            .silent = true;
        self
    }

    /// Connections to `socket` drop after `sends` commands.
    pub fn fail_after(mut self, socket: &Socket, sends: usize) -> Self {
        self.settings_mut(socket).fail_after = Some(sends);
        self
    }

    /// Connecting to `socket` is refused.
    pub fn refuse(mut self, socket: &Socket) -> Self {
        self.refused.insert(socket.clone());
        self
    }
}

impl Connector for SimulatedConnector {
    type Transport = SimulatedMeterBank;

    fn open(&mut self, socket: &Socket) -> Result<Self::Transport> {
        if self.refused.contains(socket) {
            return Err(Error::Transport {
                kind: embedded_io::ErrorKind::ConnectionRefused,
                message: format!("simulated refusal from {socket}"),
            });
        }
        let settings = self
            .per_socket
            .get(socket)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone());
        Ok(SimulatedMeterBank::new(
            socket.clone(),
            settings,
            self.journal.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Encoder, Reply, WordOrder, is_ready, parse_read_response};
    use crate::topology::LocalMeterId;

    fn bank(settings: BankSettings) -> SimulatedMeterBank {
        SimulatedMeterBank::new(Socket::new("sim", 1), settings, Journal::default())
    }

    fn exchange(bank: &mut SimulatedMeterBank, command: &str) -> Reply {
        bank.send(command).unwrap();
        Reply::parse(&bank.receive_all(Duration::ZERO).unwrap())
    }

    #[test]
    fn gateway_escape_decodes_back() {
        let bytes: Vec<u8> = (0..=255).collect();
        assert_eq!(decode_escapes(&gateway_escape(&bytes)), bytes);
    }

    #[test]
    fn reads_measurements() {
        let encoder = Encoder::new(1, 10);
        let mut bank = bank(BankSettings::default());
        let cmd = encoder
            .read_holding(LocalMeterId::new(2), MeterRegister::Measurements, 18)
            .unwrap();
        let reply = exchange(&mut bank, cmd.as_str());
        let payload = reply.for_meter(LocalMeterId::new(2)).unwrap();
        let response = parse_read_response(payload, 36).unwrap();
        assert_eq!(response.float_at(3, WordOrder::BigEndian), Some(5.0));
    }

    #[test]
    fn busy_step_becomes_ready() {
        let encoder = Encoder::new(1, 10);
        let local = LocalMeterId::new(1);
        let mut bank = bank(BankSettings::default());
        exchange(
            &mut bank,
            encoder
                .write_floats(local, MeterRegister::Command, &[904.0])
                .unwrap()
                .as_str(),
        );
        let status = encoder.read_holding(local, MeterRegister::CalDone, 2).unwrap();
        let ready: Vec<bool> = (0..3)
            .map(|_| {
                let reply = exchange(&mut bank, status.as_str());
                is_ready(reply.for_meter(local).unwrap(), 1)
            })
            .collect();
        assert_eq!(ready, vec![false, false, true]);
    }

    #[test]
    fn never_ready_and_silent_meters() {
        let mut settings = BankSettings::default();
        settings.behaviour.insert(
            1,
            MeterBehaviour {
                never_ready: true,
                silent: false,
                ..Default::default()
            },
        );
        settings.behaviour.insert(
            2,
            MeterBehaviour {
                never_ready: false,
                silent: true,
                ..Default::default()
            },
        );
        let encoder = Encoder::new(1, 10);
        let mut bank = bank(settings);
        for _ in 0..5 {
            let cmd = encoder
                .read_holding(LocalMeterId::new(1), MeterRegister::CalDone, 2)
                .unwrap();
            let reply = exchange(&mut bank, cmd.as_str());
            assert!(!is_ready(reply.for_meter(LocalMeterId::new(1)).unwrap(), 1));
        }
        let cmd = encoder
            .read_holding(LocalMeterId::new(2), MeterRegister::CalDone, 2)
            .unwrap();
        assert!(exchange(&mut bank, cmd.as_str()).is_empty());
    }

    #[test]
    fn injected_failure_and_close() {
        let journal = Journal::default();
        let socket = Socket::new("sim", 2);
        let settings = BankSettings {
            fail_after: Some(1),
            ..Default::default()
        };
        let mut bank = SimulatedMeterBank::new(socket.clone(), settings, journal.clone());
        bank.send("VER").unwrap();
        assert!(bank.send("VER").unwrap_err().is_socket_fault());
        drop(bank);
        assert_eq!(journal.opened(&socket), 1);
        assert_eq!(journal.closed(&socket), 1);
        assert_eq!(journal.sent_to(&socket), vec!["VER".to_string()]);
    }

    #[test]
    fn register_store_stops_at_the_top_address() {
        let mut meter = SimulatedMeter::new(1, MeterBehaviour::default());
        meter.set_float(0xFFFF, 1.0);
        meter.write(0xFFFF, &[0x1234, 0x5678], 0);
        let bytes = meter.read(0xFFFE, 4);
        assert_eq!(bytes, vec![0x00, 0x00, 0x12, 0x34, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn connector_refuses_configured_socket() {
        let socket = Socket::new("sim", 3);
        let mut connector = SimulatedConnector::new(BankSettings::default()).refuse(&socket);
        assert!(connector.open(&socket).unwrap_err().is_socket_fault());
        assert!(connector.open(&Socket::new("sim", 4)).is_ok());
    }
}
