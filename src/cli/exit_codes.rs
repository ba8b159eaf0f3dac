//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::device::BindError;
use crate::core::discovery::DiscoveryError;
use crate::core::probe::ProbeError;
use crate::core::protocol::FrameError;
use crate::core::transport::TransportError;
use crate::core::worker::WorkerError;
use crate::error::Error;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Connection failed
    pub const CONNECTION_FAILED: u8 = 3;

    /// No reply in time
    pub const TIMEOUT: u8 = 4;

    /// Permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Port not found
    pub const PORT_NOT_FOUND: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Failure with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<std::io::Error> for CliResult {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let code = match err.kind() {
            ErrorKind::NotFound => ExitCodes::PORT_NOT_FOUND,
            ErrorKind::PermissionDenied => ExitCodes::PERMISSION_DENIED,
            ErrorKind::TimedOut => ExitCodes::TIMEOUT,
            _ => ExitCodes::ERROR,
        };

        Self::Error(code, err.to_string())
    }
}

impl From<&Error> for CliResult {
    fn from(err: &Error) -> Self {
        Self::Error(err.exit_code(), err.to_string())
    }
}

/// Errors that map onto a process exit code
pub trait ToExitCode {
    /// Exit code for this error
    fn exit_code(&self) -> u8;
}

impl ToExitCode for TransportError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::PortNotFound(_) => ExitCodes::PORT_NOT_FOUND,
            Self::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            Self::WriteTimeout(_) => ExitCodes::TIMEOUT,
            Self::ConnectionFailed(_) | Self::Enumeration(_) | Self::IoError(_) | Self::NotConnected => {
                ExitCodes::CONNECTION_FAILED
            }
        }
    }
}

impl ToExitCode for FrameError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::NoResponse => ExitCodes::TIMEOUT,
            Self::BodyTooLong(_) | Self::ReservedOpcode => ExitCodes::INVALID_ARGS,
            Self::Transport(e) => e.exit_code(),
            Self::Io(_) => ExitCodes::CONNECTION_FAILED,
            Self::InvalidFrame(_) | Self::ChecksumFault { .. } | Self::Truncated { .. } => {
                ExitCodes::PROTOCOL_ERROR
            }
        }
    }
}

impl ToExitCode for ProbeError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Connection { source, .. } | Self::Write { source, .. } => source.exit_code(),
            Self::NoResponse { .. } => ExitCodes::TIMEOUT,
            Self::Frame { source, .. } => source.exit_code(),
            Self::EmptyIdentity { .. } => ExitCodes::PROTOCOL_ERROR,
            Self::Worker { .. } => ExitCodes::INTERNAL_ERROR,
        }
    }
}

impl ToExitCode for DiscoveryError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Enumeration(e) => e.exit_code(),
            Self::HostGone => ExitCodes::CANCELLED,
            Self::Task(_) => ExitCodes::INTERNAL_ERROR,
        }
    }
}

impl ToExitCode for BindError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::DeviceNotPresent { .. } => ExitCodes::DEVICE_NOT_FOUND,
            Self::Connection { source, .. } => source.exit_code(),
            Self::Worker(e) => e.exit_code(),
        }
    }
}

impl ToExitCode for WorkerError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Cancelled(_) => ExitCodes::CANCELLED,
            Self::Spawn { .. } | Self::Panicked(_) => ExitCodes::INTERNAL_ERROR,
        }
    }
}

impl ToExitCode for ConfigError {
    fn exit_code(&self) -> u8 {
        match self {
            Self::UnknownDevice(_) => ExitCodes::DEVICE_NOT_FOUND,
            _ => ExitCodes::CONFIG_ERROR,
        }
    }
}

impl ToExitCode for Error {
    fn exit_code(&self) -> u8 {
        match self {
            Self::Transport(e) => e.exit_code(),
            Self::Frame(e) => e.exit_code(),
            Self::Probe(e) => e.exit_code(),
            Self::Discovery(e) => e.exit_code(),
            Self::Bind(e) => e.exit_code(),
            Self::Worker(e) => e.exit_code(),
            Self::Config(e) => e.exit_code(),
        }
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "No reply in time",
        7 => "Permission denied",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not found",
        14 => "Port not found",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 7, 8, 9, 11, 12, 14, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::probe::Pid;

    #[test]
    fn test_cli_result() {
        let success = CliResult::success();
        assert!(success.is_success());
        assert_eq!(success.code(), 0);

        let error = CliResult::error(3, "Connection failed");
        assert!(!error.is_success());
        assert_eq!(error.code(), 3);
        assert_eq!(error.message(), Some("Connection failed"));
    }

    #[test]
    fn test_from_io_error() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no access");
        let result = CliResult::from(err);
        assert_eq!(result.code(), ExitCodes::PERMISSION_DENIED);
    }

    #[test]
    fn test_library_error_codes() {
        let absent = Error::from(BindError::DeviceNotPresent {
            name: "drive".into(),
            pid: Pid::from(7u8),
        });
        assert_eq!(CliResult::from(&absent).code(), ExitCodes::DEVICE_NOT_FOUND);

        let checksum = Error::from(FrameError::ChecksumFault {
            expected: 0x10,
            received: 0x11,
        });
        assert_eq!(checksum.exit_code(), ExitCodes::PROTOCOL_ERROR);

        let silent = Error::from(FrameError::NoResponse);
        assert_eq!(silent.exit_code(), ExitCodes::TIMEOUT);

        let stalled = Error::from(ProbeError::Write {
            port: "COM3".into(),
            source: TransportError::WriteTimeout("COM3".into()),
        });
        assert_eq!(stalled.exit_code(), ExitCodes::TIMEOUT);

        let config = Error::from(ConfigError::NoConfigDir);
        assert_eq!(config.exit_code(), ExitCodes::CONFIG_ERROR);
        assert_eq!(exit_code_description(config.exit_code()), "Configuration error");
    }
}
