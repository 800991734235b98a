//! Our error types for MCW meter communication and calibration runs.

use std::path::PathBuf;

use thiserror::Error;

use crate::topology::LocalMeterId;

pub type Result<T> = core::result::Result<T, Error>;

/// Custom error type for MCW gateway communications and calibration bookkeeping.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid local meter id {id}, expected 0..={max}")]
    InvalidMeterId { id: u16, max: u16 },
    #[error("Modbus protocol error: {0}")]
    ModbusError(rmodbus::ErrorKind),
    #[error("No valid frame in response")]
    NoValidFrame,
    #[error("No response from meter {0}")]
    NoResponse(LocalMeterId),
    #[error("Transport error ({kind:?}): {message}")]
    Transport {
        kind: embedded_io::ErrorKind,
        message: String,
    },
    #[error("Configuration error: {0}")]
    Configuration(String),
    #[error("State file {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("State file {} is not valid JSON: {source}", path.display())]
    StateFormat {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("Operator aborted: {0}")]
    Operator(String),
}

impl Error {
    /// Wrap any link level error.
    pub fn transport<E: embedded_io::Error>(err: E) -> Self {
        Error::Transport {
            kind: err.kind(),
            message: format!("{err:?}"),
        }
    }

    /// True for failures that only invalidate the socket currently being driven.
    ///
    /// The orchestrator withholds that socket's completion and moves on; anything else
    /// aborts the invocation.
    pub fn is_socket_fault(&self) -> bool {
        matches!(self, Error::Transport { .. })
    }

    /// True for the recoverable "no data" outcomes of a single read.
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::NoValidFrame | Error::NoResponse(_))
    }
}

impl From<rmodbus::ErrorKind> for Error {
    fn from(err: rmodbus::ErrorKind) -> Self {
        Error::ModbusError(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Transport {
            kind: crate::transport::io_error_kind(&err),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_errors_are_socket_faults() {
        let transport = Error::Transport {
            kind: embedded_io::ErrorKind::ConnectionReset,
            message: "reset".into(),
        };
        assert!(transport.is_socket_fault());
        assert!(!Error::NoValidFrame.is_socket_fault());
        assert!(!Error::Configuration("no sockets".into()).is_socket_fault());
    }

    #[test]
    fn silence_and_garbage_are_no_data() {
        assert!(Error::NoValidFrame.is_no_data());
        assert!(Error::NoResponse(LocalMeterId::new(3)).is_no_data());
        assert!(!Error::Configuration("bad".into()).is_no_data());
    }

    #[test]
    fn io_errors_keep_their_kind() {
        let err: Error =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        match err {
            Error::Transport { kind, .. } => {
                assert_eq!(kind, embedded_io::ErrorKind::ConnectionRefused)
            }
            other => panic!("Unexpected error: {:?}", other),
        }
    }
}
