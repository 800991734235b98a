//! We use this mocking module in unit tests to emulate a gateway connection.

use std::collections::VecDeque;
use std::time::Duration;

use crate::transport::Link;

/// In-memory [`Link`]. Every queued chunk is returned by exactly one read.
pub struct MockLink {
    /// Everything written so far
    write_buffer: heapless::Vec<u8, 512>,
    /// Chunks handed out by successive reads
    read_chunks: VecDeque<Vec<u8>>,
    /// Last timeout the transport asked for
    read_timeout: Option<Duration>,
    should_error_on_write: bool,
    should_error_on_read: bool,
    shut_down: bool,
}

#[derive(Debug)]
pub enum MockLinkError {
    /// No chunk left to read
    Timeout,
    BufferOverflow,
    SimulatedError,
}

impl core::fmt::Display for MockLinkError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::error::Error for MockLinkError {}

impl embedded_io::Error for MockLinkError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            MockLinkError::Timeout => embedded_io::ErrorKind::TimedOut,
            MockLinkError::BufferOverflow => embedded_io::ErrorKind::OutOfMemory,
            MockLinkError::SimulatedError => embedded_io::ErrorKind::Other,
        }
    }
}

impl embedded_io::ErrorType for MockLink {
    type Error = MockLinkError;
}

impl embedded_io::Write for MockLink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_write {
            return Err(MockLinkError::SimulatedError);
        }
        self.write_buffer
            .extend_from_slice(buf)
            .map_err(|_| MockLinkError::BufferOverflow)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        if self.should_error_on_write {
            return Err(MockLinkError::SimulatedError);
        }
        Ok(())
    }
}

impl embedded_io::Read for MockLink {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        if self.should_error_on_read {
            return Err(MockLinkError::SimulatedError);
        }
        let Some(mut chunk) = self.read_chunks.pop_front() else {
            return Err(MockLinkError::Timeout);
        };
        let bytes_to_read = core::cmp::min(buf.len(), chunk.len());
        buf[..bytes_to_read].copy_from_slice(&chunk[..bytes_to_read]);
        if bytes_to_read < chunk.len() {
            // Hand the rest out on the next read.
            self.read_chunks.push_front(chunk.split_off(bytes_to_read));
        }
        Ok(bytes_to_read)
    }
}

impl Link for MockLink {
    fn set_read_timeout(&mut self, timeout: Duration) -> crate::error::Result<()> {
        self.read_timeout = Some(timeout);
        Ok(())
    }

    fn shutdown(&mut self) {
        self.shut_down = true;
    }
}

impl MockLink {
    pub fn new() -> Self {
        Self {
            write_buffer: heapless::Vec::new(),
            read_chunks: VecDeque::new(),
            read_timeout: None,
            should_error_on_write: false,
            should_error_on_read: false,
            shut_down: false,
        }
    }

    /// Queue one chunk to be returned by a later read.
    pub fn queue_read(&mut self, data: &[u8]) {
        self.read_chunks.push_back(data.to_vec());
    }

    pub fn written_data(&self) -> &[u8] {
        &self.write_buffer
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.read_timeout
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    pub fn set_error_on_write(&mut self, should_error: bool) {
        self.should_error_on_write = should_error;
    }

    pub fn set_error_on_read(&mut self, should_error: bool) {
        self.should_error_on_read = should_error;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_io::{Error, Read, Write};

    #[test]
    fn test_write_accumulates() {
        let mut mock = MockLink::new();
        mock.write(b"MCW1,").unwrap();
        mock.write(b"^h01\r").unwrap();
        assert_eq!(mock.written_data(), b"MCW1,^h01\r");
    }

    #[test]
    fn test_write_buffer_overflow() {
        let mut mock = MockLink::new();
        let result = mock.write(&[0u8; 600]);
        assert!(matches!(result, Err(MockLinkError::BufferOverflow)));
    }

    #[test]
    fn test_chunks_are_read_in_order() {
        let mut mock = MockLink::new();
        mock.queue_read(b"Hello");
        mock.queue_read(b" World");

        let mut buffer = [0u8; 3];
        assert_eq!(mock.read(&mut buffer).unwrap(), 3);
        assert_eq!(&buffer, b"Hel");
        let mut buffer = [0u8; 16];
        assert_eq!(mock.read(&mut buffer).unwrap(), 2);
        assert_eq!(&buffer[..2], b"lo");
        assert_eq!(mock.read(&mut buffer).unwrap(), 6);
        assert!(matches!(mock.read(&mut buffer), Err(MockLinkError::Timeout)));
    }

    #[test]
    fn test_error_simulation() {
        let mut mock = MockLink::new();
        mock.set_error_on_write(true);
        assert!(mock.write(b"test").is_err());
        assert!(mock.flush().is_err());
        assert!(mock.written_data().is_empty());

        mock.queue_read(b"data");
        mock.set_error_on_read(true);
        let mut buffer = [0u8; 10];
        assert!(matches!(
            mock.read(&mut buffer),
            Err(MockLinkError::SimulatedError)
        ));
        mock.set_error_on_read(false);
        assert_eq!(mock.read(&mut buffer).unwrap(), 4);
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(MockLinkError::Timeout.kind(), embedded_io::ErrorKind::TimedOut);
        assert_eq!(
            MockLinkError::BufferOverflow.kind(),
            embedded_io::ErrorKind::OutOfMemory
        );
        assert_eq!(
            MockLinkError::SimulatedError.kind(),
            embedded_io::ErrorKind::Other
        );
    }

    #[test]
    fn test_link_records_timeout_and_shutdown() {
        let mut mock = MockLink::new();
        mock.set_read_timeout(Duration::from_millis(20)).unwrap();
        mock.shutdown();
        assert_eq!(mock.read_timeout(), Some(Duration::from_millis(20)));
        assert!(mock.is_shut_down());
    }
}
