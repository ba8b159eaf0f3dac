//! Transport layer
//!
//! A transport is one open byte-stream connection bound to one port. It is
//! owned by exactly one worker at a time and never shared between threads.
//!
//! Supports:
//! - Serial ports (RS-232, USB-Serial adapters) through [`SerialProvider`]
//! - In-memory simulated ports through [`crate::core::simulator::SimulatedBus`]

mod serial;

pub use serial::{list_ports, SerialConfig, SerialFlowControl, SerialParity, SerialProvider, SerialTransport};

use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Connection state of a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Not connected (never opened, or closed)
    #[default]
    Closed,
    /// Connected and usable
    Open,
    /// A hard I/O fault occurred; the connection is unusable
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Transport error types
#[derive(Error, Debug)]
pub enum TransportError {
    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Port not found
    #[error("Port not found: {0}")]
    PortNotFound(String),

    /// Permission denied
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Port enumeration failed
    #[error("Port enumeration failed: {0}")]
    Enumeration(String),

    /// Write did not complete within the port timeout
    #[error("Write timed out on port {0}")]
    WriteTimeout(String),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Not connected
    #[error("Not connected")]
    NotConnected,
}

impl TransportError {
    /// Whether this error means the port could not be opened at all
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed(_) | Self::PortNotFound(_) | Self::PermissionDenied(_)
        )
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Bytes sent
    pub bytes_sent: u64,
    /// Bytes received
    pub bytes_received: u64,
    /// Completed writes
    pub writes: u64,
    /// Reads that ended on the port timeout
    pub read_timeouts: u64,
    /// Errors count
    pub errors: u64,
    /// Connection uptime in seconds
    pub uptime_secs: u64,
}

/// A single byte-stream connection.
///
/// Reads block for at most [`Transport::timeout`]. A timeout is not an error:
/// `read` returns whatever arrived in time, possibly nothing.
pub trait Transport: Send {
    /// Port identifier this transport is bound to
    fn port(&self) -> &str;

    /// Current connection state
    fn state(&self) -> ConnectionState;

    /// Check if connected
    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Configured read/write timeout
    fn timeout(&self) -> Duration;

    /// Read up to `len` bytes, returning early on timeout
    fn read(&mut self, len: usize) -> Result<Bytes, TransportError>;

    /// Write all of `data`
    fn write(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Close the connection. Closing twice is a no-op.
    fn close(&mut self);

    /// Get statistics
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Source of ports: enumerates candidates and opens transports on them.
#[cfg_attr(test, mockall::automock)]
pub trait PortProvider: Send + Sync {
    /// List candidate port identifiers, in a stable enumeration order
    fn list_ports(&self) -> Result<Vec<String>, TransportError>;

    /// Open a transport on `port`
    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Render bytes for wire-level debug logs: `00|01|c8 [...]`
pub fn byte_debug_string(data: &[u8]) -> String {
    let hex = hex::encode(data);
    let pairs: Vec<&str> = (0..hex.len())
        .step_by(2)
        .map(|i| &hex[i..i + 2])
        .collect();
    let printable: String = data
        .iter()
        .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
        .collect();
    format!("{} [{}]", pairs.join("|"), printable)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_debug_string() {
        assert_eq!(byte_debug_string(&[0x00, 0x41, 0xc8]), "00|41|c8 [.A.]");
        assert_eq!(byte_debug_string(&[]), " []");
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(TransportError::PortNotFound("COM9".into()).is_connection_error());
        assert!(TransportError::PermissionDenied("/dev/ttyS0".into()).is_connection_error());
        assert!(!TransportError::WriteTimeout("COM3".into()).is_connection_error());
        assert!(!TransportError::NotConnected.is_connection_error());
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "Open");
        assert_eq!(ConnectionState::default(), ConnectionState::Closed);
    }
}
