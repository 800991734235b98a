//! MCW wire codec.
//!
//! Requests are ordinary Modbus RTU frames, generated with [rmodbus], whose bytes are written as
//! `^hXX` tokens behind an `MCW<local>,` prefix. Replies arrive as CR separated segments of the form
//! `F<local>,<ignored>,<escaped payload>`; [`Reply::parse`] splits them and [`decode_escapes`]
//! recovers the raw frame bytes.

use std::fmt;
use std::ops::RangeInclusive;

use log::debug;

use crate::error::{Error, Result};
use crate::register::{FunctionCode, STEP_READY};
use crate::topology::LocalMeterId;

/// Largest Modbus frame we build or accept.
pub const FRAME_CAPACITY: usize = 256;

/// Modbus CRC16: init `0xFFFF`, reflected polynomial `0xA001`.
///
/// On the wire the result is sent low byte first.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= *byte as u16;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// Append the CRC of `frame` to it, low byte first.
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Render every byte as `^h` plus two uppercase hex digits.
pub fn escape(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 4);
    for byte in bytes {
        out.push_str("^h");
        out.push_str(&hex::encode_upper([*byte]));
    }
    out
}

/// A fully built MCW command addressed to one local meter (or broadcast).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McwCommand {
    local: LocalMeterId,
    frame: Vec<u8>,
    text: String,
}

impl McwCommand {
    fn new(local: LocalMeterId, frame: &[u8]) -> Self {
        let text = format!("MCW{},{}", local.get(), escape(frame));
        Self {
            local,
            frame: frame.to_vec(),
            text,
        }
    }

    pub fn local(&self) -> LocalMeterId {
        self.local
    }

    /// The raw Modbus frame, CRC included.
    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }
}

impl fmt::Display for McwCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// How a float is split across its two registers.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WordOrder {
    /// High word first. What the meters use unless configured otherwise.
    BigEndian,
    /// Low word first.
    Swapped,
}

impl WordOrder {
    pub fn float_to_words(self, value: f32) -> [u16; 2] {
        let bytes = value.to_be_bytes();
        let high = u16::from_be_bytes([bytes[0], bytes[1]]);
        let low = u16::from_be_bytes([bytes[2], bytes[3]]);
        match self {
            WordOrder::BigEndian => [high, low],
            WordOrder::Swapped => [low, high],
        }
    }

    pub fn float_from_bytes(self, bytes: [u8; 4]) -> f32 {
        match self {
            WordOrder::BigEndian => f32::from_be_bytes(bytes),
            WordOrder::Swapped => f32::from_be_bytes([bytes[2], bytes[3], bytes[0], bytes[1]]),
        }
    }
}

/// Builds MCW commands for one slave id.
///
/// Encoding is pure: the same arguments always give the same command text.
#[derive(Debug, Clone)]
pub struct Encoder {
    slave_id: u8,
    meter_limit: u16,
    word_swap: Vec<RangeInclusive<u16>>,
}

impl Encoder {
    /// `meter_limit` is the highest local id accepted; 0 (broadcast) is always accepted.
    pub fn new(slave_id: u8, meter_limit: u16) -> Self {
        Self {
            slave_id,
            meter_limit,
            word_swap: Vec::new(),
        }
    }

    /// Registers in these ranges carry their floats low word first.
    pub fn with_word_swap(mut self, ranges: Vec<RangeInclusive<u16>>) -> Self {
        self.word_swap = ranges;
        self
    }

    pub fn slave_id(&self) -> u8 {
        self.slave_id
    }

    pub fn word_order(&self, register: u16) -> WordOrder {
        if self.word_swap.iter().any(|r| r.contains(&register)) {
            WordOrder::Swapped
        } else {
            WordOrder::BigEndian
        }
    }

    /// Read `count` holding registers (function 0x03).
    pub fn read_holding(
        &self,
        local: LocalMeterId,
        register: impl Into<u16>,
        count: u16,
    ) -> Result<McwCommand> {
        self.check_local(local)?;
        let mut buff: heapless::Vec<u8, FRAME_CAPACITY> = heapless::Vec::new();
        let mut req = rmodbus::client::ModbusRequest::new(self.slave_id, rmodbus::ModbusProto::Rtu);
        req.generate_get_holdings(register.into(), count, &mut buff)?;
        Ok(McwCommand::new(local, &buff))
    }

    /// Read `count` input registers (function 0x04).
    pub fn read_input(
        &self,
        local: LocalMeterId,
        register: impl Into<u16>,
        count: u16,
    ) -> Result<McwCommand> {
        self.check_local(local)?;
        let mut buff: heapless::Vec<u8, FRAME_CAPACITY> = heapless::Vec::new();
        let mut req = rmodbus::client::ModbusRequest::new(self.slave_id, rmodbus::ModbusProto::Rtu);
        req.generate_get_inputs(register.into(), count, &mut buff)?;
        Ok(McwCommand::new(local, &buff))
    }

    /// Write consecutive floats starting at `register` (function 0x10), two registers each.
    pub fn write_floats(
        &self,
        local: LocalMeterId,
        register: impl Into<u16>,
        values: &[f32],
    ) -> Result<McwCommand> {
        self.check_local(local)?;
        let register = register.into();
        let order = self.word_order(register);
        let words: Vec<u16> = values
            .iter()
            .flat_map(|v| order.float_to_words(*v))
            .collect();

        let mut buff: heapless::Vec<u8, FRAME_CAPACITY> = heapless::Vec::new();
        let mut req = rmodbus::client::ModbusRequest::new(self.slave_id, rmodbus::ModbusProto::Rtu);
        req.generate_set_holdings_bulk(register, &words, &mut buff)?;
        Ok(McwCommand::new(local, &buff))
    }

    fn check_local(&self, local: LocalMeterId) -> Result<()> {
        if local.get() > self.meter_limit {
            return Err(Error::InvalidMeterId {
                id: local.get(),
                max: self.meter_limit,
            });
        }
        Ok(())
    }
}

/// Undo MCW escaping.
///
/// * `^h` + two hex digits is that byte.
/// * `^X` for any other `X` is `X & 0x1F`.
/// * `<NNN>` with three decimal digits in `128..=255` is that byte.
/// * Everything else, including a trailing `^`, is taken literally.
pub fn decode_escapes(input: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    let mut i = 0;
    while i < input.len() {
        let c = input[i];
        if c == b'^' && i + 1 < input.len() {
            if input[i + 1] == b'h' && i + 3 < input.len() {
                if let Some(byte) = hex_pair(input[i + 2], input[i + 3]) {
                    out.push(byte);
                    i += 4;
                    continue;
                }
            }
            out.push(input[i + 1] & 0x1F);
            i += 2;
        } else if c == b'<' {
            match high_byte(&input[i..]) {
                Some(byte) => {
                    out.push(byte);
                    i += 5;
                }
                None => {
                    out.push(c);
                    i += 1;
                }
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

fn hex_pair(high: u8, low: u8) -> Option<u8> {
    let mut byte = [0u8; 1];
    hex::decode_to_slice([high, low], &mut byte).ok()?;
    Some(byte[0])
}

fn high_byte(input: &[u8]) -> Option<u8> {
    if input.len() < 5 || input[4] != b'>' {
        return None;
    }
    let digits = &input[1..4];
    if !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    let value = digits
        .iter()
        .fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
    if (128..=255).contains(&value) {
        Some(value as u8)
    } else {
        None
    }
}

/// One `F<id>,...` segment, payload already unescaped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub meter: u32,
    pub payload: Vec<u8>,
}

impl Segment {
    fn parse(segment: &[u8]) -> Option<Self> {
        let rest = segment.strip_prefix(b"F")?;
        let id_len = rest.iter().take_while(|b| b.is_ascii_digit()).count();
        if id_len == 0 || rest.get(id_len) != Some(&b',') {
            return None;
        }
        let meter = std::str::from_utf8(&rest[..id_len]).ok()?.parse().ok()?;
        let after_id = &rest[id_len + 1..];
        let comma = after_id.iter().position(|b| *b == b',')?;
        Some(Self {
            meter,
            payload: decode_escapes(&after_id[comma + 1..]),
        })
    }

    pub fn hex(&self) -> String {
        hex::encode_upper(&self.payload)
    }
}

/// Everything the gateway sent back for one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reply {
    segments: Vec<Segment>,
}

impl Reply {
    /// Split on CR, drop empty segments and `MCW` echoes, keep the `F` segments.
    pub fn parse(raw: &[u8]) -> Self {
        let segments = raw
            .split(|b| *b == b'\r')
            .map(|s| s.strip_prefix(b"\n").unwrap_or(s))
            .filter(|s| !s.is_empty())
            .filter(|s| !s.starts_with(b"MCW"))
            .filter_map(Segment::parse)
            .collect();
        Self { segments }
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Payload of the first segment that came from `local`.
    pub fn for_meter(&self, local: LocalMeterId) -> Option<&[u8]> {
        self.segments
            .iter()
            .find(|s| s.meter == local.get() as u32)
            .map(|s| s.payload.as_slice())
    }
}

/// The header and data of a read-style response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse<'a> {
    pub slave: u8,
    pub function: FunctionCode,
    pub data: &'a [u8],
}

impl ReadResponse<'_> {
    /// Float number `index` of the data, or `None` when the data stops short.
    pub fn float_at(&self, index: usize, order: WordOrder) -> Option<f32> {
        let start = index * 4;
        let bytes: [u8; 4] = self.data.get(start..start + 4)?.try_into().ok()?;
        Some(order.float_from_bytes(bytes))
    }
}

/// Parse a read response that should carry at least `expected_bytes` of data.
///
/// Returns `None` for anything malformed: short frames, exceptions, other function codes,
/// or a byte count below what was asked for.
pub fn parse_read_response(frame: &[u8], expected_bytes: usize) -> Option<ReadResponse<'_>> {
    if frame.len() < 5 || frame[1] & 0x80 != 0 {
        return None;
    }
    let function = FunctionCode::try_from(frame[1]).ok()?;
    if !function.has_byte_count() {
        return None;
    }
    let byte_count = frame[2] as usize;
    if byte_count < expected_bytes {
        return None;
    }
    let data = frame.get(3..3 + byte_count)?;
    if let Some(crc) = frame.get(3 + byte_count..5 + byte_count) {
        let computed = crc16(&frame[..3 + byte_count]).to_le_bytes();
        if crc != computed.as_slice() {
            debug!(
                "CRC mismatch in {}: got {}, computed {}",
                hex::encode_upper(frame),
                hex::encode_upper(crc),
                hex::encode_upper(computed)
            );
        }
    }
    Some(ReadResponse {
        slave: frame[0],
        function,
        data,
    })
}

/// The exact frame a meter answers with once a busy step is done: the status register
/// read back as `2.0`, CRC included.
pub fn ready_sentinel(slave_id: u8) -> Vec<u8> {
    let mut frame = vec![slave_id, FunctionCode::ReadHoldingRegisters as u8, 4];
    frame.extend_from_slice(&STEP_READY.to_be_bytes());
    append_crc(&mut frame);
    frame
}

/// True if the sentinel for `slave_id` occurs anywhere in `payload`.
pub fn is_ready(payload: &[u8], slave_id: u8) -> bool {
    let sentinel = ready_sentinel(slave_id);
    payload.windows(sentinel.len()).any(|w| w == sentinel.as_slice())
}
