//! Crate-wide error type

use crate::config::ConfigError;
use crate::core::device::BindError;
use crate::core::discovery::DiscoveryError;
use crate::core::probe::ProbeError;
use crate::core::protocol::FrameError;
use crate::core::transport::TransportError;
use crate::core::worker::WorkerError;
use thiserror::Error;

/// Any error produced by this crate
#[derive(Error, Debug)]
pub enum Error {
    /// Port or byte I/O failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Framing or checksum failure
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Identity probe failure
    #[error(transparent)]
    Probe(#[from] ProbeError),

    /// Discovery cycle failure
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    /// Device binding failure
    #[error(transparent)]
    Bind(#[from] BindError),

    /// Background worker failure
    #[error(transparent)]
    Worker(#[from] WorkerError),

    /// Configuration failure
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether the error stems from a bad checksum on the wire
    pub fn is_checksum_fault(&self) -> bool {
        match self {
            Self::Frame(FrameError::ChecksumFault { .. }) => true,
            Self::Probe(e) => e.is_checksum_fault(),
            _ => false,
        }
    }
}

/// Result alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::Pid;

    #[test]
    fn test_conversions() {
        let err: Error = FrameError::ChecksumFault {
            expected: 1,
            received: 2,
        }
        .into();
        assert!(err.is_checksum_fault());

        let err: Error = BindError::DeviceNotPresent {
            name: "drive".into(),
            pid: Pid::from(1u8),
        }
        .into();
        assert!(!err.is_checksum_fault());
        assert_eq!(err.to_string(), "Device 'drive' (PID 1) is not present");
    }
}
