use std::thread;
use std::time::Duration;

use log::{debug, info, warn};

use crate::codec::{Encoder, McwCommand, Reply, is_ready, parse_read_response};
use crate::error::{Error, Result};
use crate::register::MeterRegister;
use crate::topology::{LocalMeterId, Socket};
use crate::transport::Transport;

/// Reply handling of a [`McwClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientTiming {
    /// How long to wait for a reply to one command.
    pub reply_timeout: Duration,
    /// Attempts per read, or per acknowledged write, before giving up.
    pub read_retries: u32,
    /// Pause between attempts.
    pub retry_gap: Duration,
}

impl Default for ClientTiming {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(2),
            read_retries: 3,
            retry_gap: Duration::from_millis(200),
        }
    }
}

/// You can create a McwClient using any [Transport] connected to one socket.
///
/// The client owns the connection for as long as it lives and closes it when dropped, so a
/// socket is released on every exit path of the code driving it.
///
/// For its methods, "write" sends values to a meter and "read" returns values measured or stored
/// by the meter. Meters are always addressed by their [LocalMeterId] on this socket.
pub struct McwClient<T: Transport> {
    transport: T,
    encoder: Encoder,
    timing: ClientTiming,
    socket: Socket,
}

impl<T: Transport> McwClient<T> {
    pub fn new(transport: T, socket: Socket, encoder: Encoder, timing: ClientTiming) -> Self {
        Self {
            transport,
            encoder,
            timing,
            socket,
        }
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    pub fn encoder(&self) -> &Encoder {
        &self.encoder
    }

    /// Send a plain gateway command such as `VER` and return whatever came back.
    pub fn send_raw(&mut self, command: &str) -> Result<Vec<u8>> {
        info!("[{}] SEND: {}", self.socket, command);
        self.transport.send(command)?;
        let raw = self.transport.receive_all(self.timing.reply_timeout)?;
        info!("[{}] RECV RAW: {}", self.socket, String::from_utf8_lossy(&raw).escape_debug());
        Ok(raw)
    }

    /// Send one command and split up the reply.
    fn exchange(&mut self, command: &McwCommand) -> Result<Reply> {
        let raw = self.send_raw(command.as_str())?;
        let reply = Reply::parse(&raw);
        for segment in reply.segments() {
            debug!(
                "[{}] DECODED F{}: {}",
                self.socket,
                segment.meter,
                segment.hex()
            );
        }
        Ok(reply)
    }

    /// Write consecutive float values to a meter.
    ///
    /// Returns whether the meter answered. Sent once; see [`McwClient::write_floats_acknowledged`].
    pub fn write_floats(
        &mut self,
        local: LocalMeterId,
        register: impl Into<u16>,
        values: &[f32],
    ) -> Result<bool> {
        let command = self.encoder.write_floats(local, register, values)?;
        let reply = self.exchange(&command)?;
        let answered = reply.for_meter(local).is_some();
        if !answered && !local.is_broadcast() {
            debug!("[{}] No answer from {} to write", self.socket, local);
        }
        Ok(answered)
    }

    /// Write a numeric command code, such as a calibration step, to a register.
    pub fn write_code(
        &mut self,
        local: LocalMeterId,
        register: impl Into<u16>,
        code: u32,
    ) -> Result<bool> {
        self.write_floats(local, register, &[code as f32])
    }

    /// Resend a write until the meter answers, giving up after `read_retries` attempts.
    ///
    /// Broadcasts are never answered and go out once.
    pub fn write_floats_acknowledged(
        &mut self,
        local: LocalMeterId,
        register: impl Into<u16>,
        values: &[f32],
    ) -> Result<bool> {
        let register = register.into();
        if local.is_broadcast() {
            return self.write_floats(local, register, values);
        }
        let attempts = self.timing.read_retries.max(1);
        for attempt in 1..=attempts {
            if self.write_floats(local, register, values)? {
                return Ok(true);
            }
            debug!(
                "[{}] Write of {:#06X} to {} attempt {}/{} unanswered",
                self.socket, register, local, attempt, attempts
            );
            if attempt < attempts {
                thread::sleep(self.timing.retry_gap);
            }
        }
        warn!(
            "[{}] {} never acknowledged write to {:#06X}",
            self.socket, local, register
        );
        Ok(false)
    }

    /// [`McwClient::write_code`] with the retries of [`McwClient::write_floats_acknowledged`].
    pub fn write_code_acknowledged(
        &mut self,
        local: LocalMeterId,
        register: impl Into<u16>,
        code: u32,
    ) -> Result<bool> {
        self.write_floats_acknowledged(local, register, &[code as f32])
    }

    /// Read `count` floats starting at `register`.
    ///
    /// Short, malformed or missing replies are retried. `Ok(None)` means the meter gave no usable
    /// data within the retry bound; only transport failures are errors.
    pub fn read_floats(
        &mut self,
        local: LocalMeterId,
        register: impl Into<u16>,
        count: usize,
    ) -> Result<Option<Vec<f32>>> {
        let register = register.into();
        let order = self.encoder.word_order(register);
        let command = self.encoder.read_holding(local, register, (count * 2) as u16)?;
        let attempts = self.timing.read_retries.max(1);

        for attempt in 1..=attempts {
            let reply = self.exchange(&command)?;
            let outcome = match reply.for_meter(local) {
                None => Err(Error::NoResponse(local)),
                Some(payload) => parse_read_response(payload, count * 4)
                    .and_then(|r| (0..count).map(|i| r.float_at(i, order)).collect())
                    .ok_or(Error::NoValidFrame),
            };
            match outcome {
                Ok(values) => return Ok(Some(values)),
                Err(e) if e.is_no_data() => debug!(
                    "[{}] Read of {:#06X} from {} attempt {}/{}: {}",
                    self.socket, register, local, attempt, attempts, e
                ),
                Err(e) => return Err(e),
            }
            if attempt < attempts {
                thread::sleep(self.timing.retry_gap);
            }
        }
        warn!(
            "[{}] No valid data from {} for register {:#06X}",
            self.socket, local, register
        );
        Ok(None)
    }

    /// Read a single float.
    pub fn read_float(
        &mut self,
        local: LocalMeterId,
        register: impl Into<u16>,
    ) -> Result<Option<f32>> {
        Ok(self
            .read_floats(local, register, 1)?
            .and_then(|v| v.first().copied()))
    }

    /// Ask a meter once whether its current busy step is finished.
    ///
    /// Only the segment sent by `local` is looked at; silence counts as not ready.
    pub fn poll_ready(&mut self, local: LocalMeterId) -> Result<bool> {
        let command = self
            .encoder
            .read_holding(local, MeterRegister::CalDone, 2)?;
        let reply = self.exchange(&command)?;
        Ok(reply
            .for_meter(local)
            .is_some_and(|payload| is_ready(payload, self.encoder.slave_id())))
    }
}

impl<T: Transport> Drop for McwClient<T> {
    fn drop(&mut self) {
        self.transport.close();
        debug!("[{}] Connection closed", self.socket);
    }
}
