//! Byte transport to an MCW gateway.
//!
//! [`StreamTransport`] works over any [`Link`], which is an [embedded_io] reader/writer that can
//! bound how long a read blocks. [`TcpLink`] is the link used against real gateways.

use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use embedded_io::Error as _;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::topology::Socket;

/// What the calibration code needs from a connection to one socket.
pub trait Transport {
    /// Send one ASCII command. The terminator is appended here.
    fn send(&mut self, command: &str) -> Result<()>;

    /// Everything that arrived within `timeout`. Empty when nothing did; a timeout is not an error.
    fn receive_all(&mut self, timeout: Duration) -> Result<Vec<u8>>;

    /// Release the connection. Calling it twice is harmless.
    fn close(&mut self);
}

/// Opens a [`Transport`] per socket.
pub trait Connector {
    type Transport: Transport;

    fn open(&mut self, socket: &Socket) -> Result<Self::Transport>;
}

/// A byte stream whose reads give up after a configurable time.
pub trait Link: embedded_io::Read + embedded_io::Write {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()>;

    fn shutdown(&mut self) {}
}

/// Line terminator appended to every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminator {
    #[default]
    Cr,
    CrLf,
}

impl Terminator {
    pub fn as_bytes(self) -> &'static [u8] {
        match self {
            Terminator::Cr => b"\r",
            Terminator::CrLf => b"\r\n",
        }
    }
}

/// Pacing of a [`StreamTransport`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamTiming {
    /// Pause after every send; the gateway needs it before it answers.
    pub post_send: Duration,
    /// Once a CR has been seen, wait this long before the trailing read.
    pub grace: Duration,
    /// Read timeout of the trailing read.
    pub trailing: Duration,
}

impl Default for StreamTiming {
    fn default() -> Self {
        Self {
            post_send: Duration::from_millis(100),
            grace: Duration::from_millis(500),
            trailing: Duration::from_millis(200),
        }
    }
}

/// MCW transport over a [`Link`].
pub struct StreamTransport<L: Link> {
    link: Option<L>,
    terminator: Terminator,
    timing: StreamTiming,
}

impl<L: Link> StreamTransport<L> {
    pub fn new(link: L, terminator: Terminator, timing: StreamTiming) -> Self {
        Self {
            link: Some(link),
            terminator,
            timing,
        }
    }

    pub fn is_open(&self) -> bool {
        self.link.is_some()
    }

    fn link(&mut self) -> Result<&mut L> {
        self.link.as_mut().ok_or_else(|| Error::Transport {
            kind: embedded_io::ErrorKind::NotConnected,
            message: "transport already closed".into(),
        })
    }

    /// Read until timeout, EOF or a read that ends in CR. Returns true when a CR was seen.
    fn read_into(&mut self, buff: &mut Vec<u8>, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        let link = self.link()?;
        let mut temp_buf = [0u8; 512];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            link.set_read_timeout(remaining)?;
            match link.read(&mut temp_buf) {
                Ok(0) => return Ok(false),
                Ok(bytes_read) => {
                    let chunk = &temp_buf[..bytes_read];
                    buff.extend_from_slice(chunk);
                    if chunk.contains(&b'\r') {
                        return Ok(true);
                    }
                }
                Err(e) => {
                    // A timed out read just means the gateway has nothing more to say.
                    if e.kind() == embedded_io::ErrorKind::TimedOut {
                        return Ok(false);
                    }
                    return Err(Error::transport(e));
                }
            }
        }
    }
}

impl<L: Link> Transport for StreamTransport<L> {
    fn send(&mut self, command: &str) -> Result<()> {
        if !command.is_ascii() {
            return Err(Error::Transport {
                kind: embedded_io::ErrorKind::InvalidInput,
                message: format!("command is not ASCII: {command:?}"),
            });
        }
        let terminator = self.terminator.as_bytes();
        let link = self.link()?;
        link.write_all(command.as_bytes()).map_err(Error::transport)?;
        link.write_all(terminator).map_err(Error::transport)?;
        link.flush().map_err(Error::transport)?;
        if !self.timing.post_send.is_zero() {
            thread::sleep(self.timing.post_send);
        }
        Ok(())
    }

    fn receive_all(&mut self, timeout: Duration) -> Result<Vec<u8>> {
        let mut buff = Vec::new();
        if self.read_into(&mut buff, timeout)? {
            thread::sleep(self.timing.grace);
            let trailing = self.timing.trailing;
            self.read_into(&mut buff, trailing)?;
        }
        Ok(buff)
    }

    fn close(&mut self) {
        if let Some(mut link) = self.link.take() {
            link.shutdown();
        }
    }
}

impl<L: Link> Drop for StreamTransport<L> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Map a std I/O error kind onto the [embedded_io] one.
pub fn io_error_kind(err: &std::io::Error) -> embedded_io::ErrorKind {
    match err.kind() {
        std::io::ErrorKind::NotFound => embedded_io::ErrorKind::NotFound,
        std::io::ErrorKind::PermissionDenied => embedded_io::ErrorKind::PermissionDenied,
        std::io::ErrorKind::ConnectionRefused => embedded_io::ErrorKind::ConnectionRefused,
        std::io::ErrorKind::ConnectionReset => embedded_io::ErrorKind::ConnectionReset,
        std::io::ErrorKind::ConnectionAborted => embedded_io::ErrorKind::ConnectionAborted,
        std::io::ErrorKind::NotConnected => embedded_io::ErrorKind::NotConnected,
        std::io::ErrorKind::AddrInUse => embedded_io::ErrorKind::AddrInUse,
        std::io::ErrorKind::AddrNotAvailable => embedded_io::ErrorKind::AddrNotAvailable,
        std::io::ErrorKind::BrokenPipe => embedded_io::ErrorKind::BrokenPipe,
        std::io::ErrorKind::InvalidInput => embedded_io::ErrorKind::InvalidInput,
        std::io::ErrorKind::InvalidData => embedded_io::ErrorKind::InvalidData,
        // Socket read timeouts surface as WouldBlock on unix.
        std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
            embedded_io::ErrorKind::TimedOut
        }
        std::io::ErrorKind::Interrupted => embedded_io::ErrorKind::Interrupted,
        std::io::ErrorKind::Unsupported => embedded_io::ErrorKind::Unsupported,
        std::io::ErrorKind::OutOfMemory => embedded_io::ErrorKind::OutOfMemory,
        _ => embedded_io::ErrorKind::Other,
    }
}

/// [std::io::Error] carrying an [embedded_io::Error] implementation.
#[derive(Debug)]
pub struct IoError(std::io::Error);

impl core::fmt::Display for IoError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for IoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

impl embedded_io::Error for IoError {
    fn kind(&self) -> embedded_io::ErrorKind {
        io_error_kind(&self.0)
    }
}

/// A TCP connection to a gateway.
pub struct TcpLink(TcpStream);

impl TcpLink {
    pub fn connect(socket: &Socket, timeout: Duration) -> Result<Self> {
        let mut last_error = None;
        for addr in (socket.host.as_str(), socket.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout.max(Duration::from_millis(1))) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    return Ok(Self(stream));
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(match last_error {
            Some(e) => e.into(),
            None => Error::Transport {
                kind: embedded_io::ErrorKind::AddrNotAvailable,
                message: format!("{socket} did not resolve to any address"),
            },
        })
    }
}

impl embedded_io::ErrorType for TcpLink {
    type Error = IoError;
}

impl embedded_io::Read for TcpLink {
    fn read(&mut self, buf: &mut [u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Read::read(&mut self.0, buf).map_err(IoError)
    }
}

impl embedded_io::Write for TcpLink {
    fn write(&mut self, buf: &[u8]) -> core::result::Result<usize, Self::Error> {
        std::io::Write::write(&mut self.0, buf).map_err(IoError)
    }

    fn flush(&mut self) -> core::result::Result<(), Self::Error> {
        std::io::Write::flush(&mut self.0).map_err(IoError)
    }
}

impl Link for TcpLink {
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<()> {
        // A zero timeout means "block forever" to std.
        self.0
            .set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        Ok(())
    }

    fn shutdown(&mut self) {
        if let Err(e) = self.0.shutdown(Shutdown::Both) {
            debug!("Shutdown failed: {}", e);
        }
    }
}

/// Opens [`StreamTransport`]s over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub terminator: Terminator,
    pub timing: StreamTiming,
}

impl Connector for TcpConnector {
    type Transport = StreamTransport<TcpLink>;

    fn open(&mut self, socket: &Socket) -> Result<Self::Transport> {
        let link = TcpLink::connect(socket, self.connect_timeout)?;
        info!("Connected to {}", socket);
        Ok(StreamTransport::new(link, self.terminator, self.timing))
    }
}
