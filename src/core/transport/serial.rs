//! Serial port transport implementation

use super::{ConnectionState, PortProvider, Transport, TransportError, TransportStats};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{ErrorKind, Read, Write};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            other => Err(format!("unknown parity '{other}'")),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Read/write timeout in milliseconds
    pub timeout_ms: u64,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings (8N1, 5s timeout)
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            timeout_ms: 5000,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set the read/write timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Timeout as a [`Duration`]
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("COM1", 115200)
    }
}

/// Serial port transport
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    state: ConnectionState,
    stats: TransportStats,
    connected_at: Option<Instant>,
}

impl SerialTransport {
    /// Create an unconnected serial transport
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            state: ConnectionState::Closed,
            stats: TransportStats::default(),
            connected_at: None,
        }
    }

    /// Create and connect in one step
    pub fn open(config: SerialConfig) -> Result<Self, TransportError> {
        let mut transport = Self::new(config);
        transport.connect()?;
        Ok(transport)
    }

    /// Open the underlying port
    pub fn connect(&mut self) -> Result<(), TransportError> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let opened = serialport::new(&self.config.port, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(self.config.timeout_duration())
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                serialport::ErrorKind::Io(ErrorKind::NotFound) => {
                    TransportError::PortNotFound(self.config.port.clone())
                }
                serialport::ErrorKind::Io(ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(self.config.port.clone())
                }
                _ => TransportError::ConnectionFailed(format!("{}: {}", self.config.port, e)),
            });

        match opened {
            Ok(port) => {
                self.port = Some(port);
                self.state = ConnectionState::Open;
                self.connected_at = Some(Instant::now());
                self.stats = TransportStats::default();
                info!(
                    "Device connected at port {} at {} baud",
                    self.config.port, self.config.baud_rate
                );
                Ok(())
            }
            Err(e) => {
                self.state = ConnectionState::Failed;
                debug!("Device could not be connected at port {}: {}", self.config.port, e);
                Err(e)
            }
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }
}

impl Transport for SerialTransport {
    fn port(&self) -> &str {
        &self.config.port
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn timeout(&self) -> Duration {
        self.config.timeout_duration()
    }

    fn read(&mut self, len: usize) -> Result<Bytes, TransportError> {
        let deadline = Instant::now() + self.config.timeout_duration();
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let mut buffer = BytesMut::zeroed(len);
        let mut filled = 0;

        while filled < len {
            match port.read(&mut buffer[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == ErrorKind::TimedOut => {
                    self.stats.read_timeouts += 1;
                    break;
                }
                Err(e) => {
                    self.stats.errors += 1;
                    self.state = ConnectionState::Failed;
                    return Err(TransportError::IoError(e));
                }
            }
            if Instant::now() >= deadline {
                break;
            }
        }

        buffer.truncate(filled);
        self.stats.bytes_received += filled as u64;
        Ok(buffer.freeze())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;
        debug!("{}.write: {}", self.config.port, super::byte_debug_string(data));

        let result = port.write_all(data).and_then(|()| port.flush());
        match result {
            Ok(()) => {
                self.stats.bytes_sent += data.len() as u64;
                self.stats.writes += 1;
                Ok(())
            }
            Err(ref e) if e.kind() == ErrorKind::TimedOut => {
                self.stats.errors += 1;
                warn!("Device {} timed out on write", self.config.port);
                Err(TransportError::WriteTimeout(self.config.port.clone()))
            }
            Err(e) => {
                self.stats.errors += 1;
                self.state = ConnectionState::Failed;
                Err(TransportError::IoError(e))
            }
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Connection to port {} closed.", self.config.port);
        }
        self.connected_at = None;
        self.state = ConnectionState::Closed;
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Some(connected_at) = self.connected_at {
            stats.uptime_secs = connected_at.elapsed().as_secs();
        }
        stats
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Port provider backed by the operating system's serial ports
#[derive(Debug, Clone, Default)]
pub struct SerialProvider {
    template: SerialConfig,
}

impl SerialProvider {
    /// Create a provider using 8N1 without flow control
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a provider whose ports are opened with the line settings of `template`.
    ///
    /// The template's port, baud rate and timeout are replaced on every open.
    pub fn with_template(template: SerialConfig) -> Self {
        Self { template }
    }
}

impl PortProvider for SerialProvider {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(list_ports()?.into_iter().map(|p| p.port_name).collect())
    }

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let mut config = self.template.clone().timeout(timeout);
        config.port = port.to_string();
        config.baud_rate = baud_rate;
        Ok(Box::new(SerialTransport::open(config)?))
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::Enumeration(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = SerialConfig::new("/dev/ttyACM0", 9600)
            .timeout(Duration::from_millis(250))
            .parity(SerialParity::Even)
            .stop_bits(2);
        assert_eq!(config.port, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 9600);
        assert_eq!(config.timeout_duration(), Duration::from_millis(250));
        assert_eq!(config.parity, SerialParity::Even);
        assert_eq!(config.stop_bits, 2);
    }

    #[test]
    fn test_parity_from_str() {
        assert_eq!("E".parse::<SerialParity>(), Ok(SerialParity::Even));
        assert_eq!("none".parse::<SerialParity>(), Ok(SerialParity::None));
        assert!("mark".parse::<SerialParity>().is_err());
    }

    #[test]
    fn test_unconnected_transport_rejects_io() {
        let mut transport = SerialTransport::new(SerialConfig::default());
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(matches!(transport.read(1), Err(TransportError::NotConnected)));
        assert!(matches!(transport.write(&[0]), Err(TransportError::NotConnected)));
        transport.close();
        assert!(!transport.is_connected());
    }

    #[test]
    fn test_open_missing_port_fails() {
        let config = SerialConfig::new("/dev/portbind-does-not-exist", 115200);
        let err = SerialTransport::open(config).err().expect("port should not open");
        assert!(err.is_connection_error());
    }
}
