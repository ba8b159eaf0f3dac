//! Identity probe
//!
//! Sends the identity query (opcode 0x00, empty body) once over a freshly
//! opened transport and records the body of the reply as the device's logical
//! ID. A probe never retries: a timeout, a stalled write or a checksum fault
//! means "no identity" for this discovery cycle.

use super::liveness::Liveness;
use super::protocol::{self, FrameError, IDENTITY_QUERY};
use super::transport::{PortProvider, Transport, TransportError};
use super::worker::{OnceWorker, Worker, WorkerError};
use bytes::Bytes;
use crossbeam_channel::Sender;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Logical device identity, as reported by the device itself
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pid(Bytes);

impl Pid {
    /// Wrap raw identity bytes
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// Raw identity bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The identity as a single byte, if it is one
    pub fn as_u8(&self) -> Option<u8> {
        match self.0.as_ref() {
            [b] => Some(*b),
            _ => None,
        }
    }
}

impl From<u8> for Pid {
    fn from(value: u8) -> Self {
        Self(Bytes::copy_from_slice(&[value]))
    }
}

impl From<Bytes> for Pid {
    fn from(value: Bytes) -> Self {
        Self(value)
    }
}

impl From<Vec<u8>> for Pid {
    fn from(value: Vec<u8>) -> Self {
        Self(Bytes::from(value))
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_u8() {
            Some(b) => write!(f, "{b}"),
            None => write!(f, "0x{}", hex::encode(&self.0)),
        }
    }
}

impl FromStr for Pid {
    type Err = String;

    /// Accepts a decimal byte (`7`) or hex bytes (`0x07`, `0x0102`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(digits) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            let bytes = hex::decode(digits).map_err(|e| format!("invalid PID '{s}': {e}"))?;
            if bytes.is_empty() {
                return Err(format!("invalid PID '{s}': empty"));
            }
            return Ok(Self::from(bytes));
        }
        s.parse::<u8>()
            .map(Self::from)
            .map_err(|e| format!("invalid PID '{s}': {e}"))
    }
}

/// One successful probe result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    /// Port the device answered on
    pub port: String,
    /// Identity it reported
    pub pid: Pid,
}

/// Probe failures; each leaves the port without an identity this cycle
#[derive(Error, Debug)]
pub enum ProbeError {
    /// Port could not be opened
    #[error("Port {port} could not be opened: {source}")]
    Connection {
        /// Port
        port: String,
        /// Underlying error
        #[source]
        source: TransportError,
    },

    /// Identity query could not be written
    #[error("Identity query to {port} abandoned: {source}")]
    Write {
        /// Port
        port: String,
        /// Underlying error
        #[source]
        source: TransportError,
    },

    /// No reply before the timeout
    #[error("Port {port} did not answer the identity query")]
    NoResponse {
        /// Port
        port: String,
    },

    /// Reply carried no identity bytes
    #[error("Port {port} returned an empty identity")]
    EmptyIdentity {
        /// Port
        port: String,
    },

    /// Reply was malformed or failed its checksum
    #[error("Identity reply from {port} rejected: {source}")]
    Frame {
        /// Port
        port: String,
        /// Underlying error
        #[source]
        source: FrameError,
    },

    /// Probe worker did not complete
    #[error("Probe worker for {port} failed: {source}")]
    Worker {
        /// Port
        port: String,
        /// Underlying error
        #[source]
        source: WorkerError,
    },
}

impl ProbeError {
    /// Port the failure belongs to
    pub fn port(&self) -> &str {
        match self {
            Self::Connection { port, .. }
            | Self::Write { port, .. }
            | Self::NoResponse { port }
            | Self::EmptyIdentity { port }
            | Self::Frame { port, .. }
            | Self::Worker { port, .. } => port,
        }
    }

    /// Whether the reply failed its checksum
    pub fn is_checksum_fault(&self) -> bool {
        matches!(
            self,
            Self::Frame {
                source: FrameError::ChecksumFault { .. },
                ..
            }
        )
    }
}

/// Probe result tagged with the index of its port in enumeration order
pub type ProbeOutcome = (usize, Result<IdentityRecord, ProbeError>);

/// Single-shot identity query against one port
#[derive(Debug, Clone)]
pub struct IdentityProbe {
    port: String,
    baud_rate: u32,
    timeout: Duration,
}

impl IdentityProbe {
    /// Probe `port` at `baud_rate`, waiting up to `timeout` for the reply
    pub fn new(port: impl Into<String>, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port: port.into(),
            baud_rate,
            timeout,
        }
    }

    /// Port being probed
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Run one identity exchange over an already open transport
    pub fn query(transport: &mut dyn Transport) -> Result<IdentityRecord, ProbeError> {
        let port = transport.port().to_string();
        let frame_error = |source: FrameError| match source {
            FrameError::NoResponse => ProbeError::NoResponse { port: port.clone() },
            source => ProbeError::Frame {
                port: port.clone(),
                source,
            },
        };

        protocol::write_frame(transport, IDENTITY_QUERY, &[]).map_err(|e| match e {
            FrameError::Transport(source) => ProbeError::Write {
                port: port.clone(),
                source,
            },
            e => frame_error(e),
        })?;
        let body = protocol::read_frame(transport).map_err(frame_error)?;
        if body.is_empty() {
            return Err(ProbeError::EmptyIdentity { port });
        }

        let pid = Pid::new(body);
        debug!("{} reported PID {}", port, pid);
        Ok(IdentityRecord { port, pid })
    }

    /// Open the port, query it once, and close it again
    pub fn run_once(&self, provider: &dyn PortProvider) -> Result<IdentityRecord, ProbeError> {
        let mut transport = provider
            .open(&self.port, self.baud_rate, self.timeout)
            .map_err(|source| ProbeError::Connection {
                port: self.port.clone(),
                source,
            })?;

        let result = Self::query(transport.as_mut());
        transport.close();

        if let Err(e) = &result {
            if e.is_checksum_fault() {
                warn!("{}", e);
            } else {
                debug!("{}", e);
            }
        }
        result
    }

    /// Run the probe on its own single-shot worker thread and send the
    /// outcome, tagged with `index`, over `outcomes`
    pub fn spawn_reporting(
        self,
        provider: Arc<dyn PortProvider>,
        liveness: Liveness,
        index: usize,
        outcomes: Sender<ProbeOutcome>,
    ) -> Result<OnceWorker<()>, WorkerError> {
        Worker::builder(format!("probe:{}", self.port))
            .liveness(liveness)
            .spawn_once(move || {
                let result = self.run_once(provider.as_ref());
                // The receiver outlives every probe.
                let _ = outcomes.send((index, result));
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::simulator::{SimulatedBus, SimulatedDevice};
    use crate::core::transport::MockPortProvider;

    const TIMEOUT: Duration = Duration::from_millis(30);

    #[test]
    fn test_pid_parse_and_display() {
        assert_eq!("7".parse::<Pid>().unwrap(), Pid::from(7u8));
        assert_eq!("0x07".parse::<Pid>().unwrap(), Pid::from(7u8));
        assert_eq!("0x0102".parse::<Pid>().unwrap().as_bytes(), &[1, 2]);
        assert!("256".parse::<Pid>().is_err());
        assert!("0x".parse::<Pid>().is_err());
        assert!("abc".parse::<Pid>().is_err());

        assert_eq!(Pid::from(2u8).to_string(), "2");
        assert_eq!(Pid::from(vec![0xab, 0x01]).to_string(), "0xab01");
        assert_eq!(Pid::from(vec![0xab, 0x01]).as_u8(), None);
    }

    #[test]
    fn test_probe_records_identity() {
        let bus = SimulatedBus::new().with_device(SimulatedDevice::new("sim0").identity(5u8));
        let record = IdentityProbe::new("sim0", 115200, TIMEOUT).run_once(&bus).unwrap();
        assert_eq!(record, IdentityRecord { port: "sim0".into(), pid: Pid::from(5u8) });

        let device = bus.device("sim0").unwrap();
        assert_eq!(device.received_frames().len(), 1);
        assert_eq!(device.received_frames()[0].code(), IDENTITY_QUERY);
        assert_eq!(device.open_count(), 1);
        assert!(!device.is_open());
    }

    #[test]
    fn test_probe_silent_port() {
        let bus = SimulatedBus::new().with_device(SimulatedDevice::new("sim0").silent());
        let err = IdentityProbe::new("sim0", 115200, TIMEOUT).run_once(&bus).unwrap_err();
        assert!(matches!(err, ProbeError::NoResponse { .. }));
        assert_eq!(err.port(), "sim0");
    }

    #[test]
    fn test_probe_checksum_fault_is_terminal() {
        let bus = SimulatedBus::new()
            .with_device(SimulatedDevice::new("sim0").identity(1u8).corrupt_checksum());
        let err = IdentityProbe::new("sim0", 115200, TIMEOUT).run_once(&bus).unwrap_err();
        assert!(err.is_checksum_fault());
        // One query, no retry.
        assert_eq!(bus.device("sim0").unwrap().received_frames().len(), 1);
    }

    #[test]
    fn test_probe_unopenable_port() {
        let mut provider = MockPortProvider::new();
        provider
            .expect_open()
            .times(1)
            .returning(|port, _, _| Err(TransportError::PermissionDenied(port.to_string())));

        let err = IdentityProbe::new("/dev/ttyS0", 115200, TIMEOUT)
            .run_once(&provider)
            .unwrap_err();
        assert!(matches!(err, ProbeError::Connection { .. }));
    }

    #[test]
    fn test_probe_device_without_identity_answers_nothing() {
        let bus = SimulatedBus::new().with_device(SimulatedDevice::new("sim0"));
        let err = IdentityProbe::new("sim0", 115200, TIMEOUT).run_once(&bus).unwrap_err();
        assert!(matches!(err, ProbeError::NoResponse { .. }));
    }

    #[test]
    fn test_stalled_write_is_not_a_reply_fault() {
        let bus = SimulatedBus::new()
            .with_device(SimulatedDevice::new("sim0").identity(1u8).write_timeout());
        let err = IdentityProbe::new("sim0", 115200, TIMEOUT).run_once(&bus).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::Write { source: TransportError::WriteTimeout(_), .. }
        ));
        assert!(!err.is_checksum_fault());
        assert!(!bus.device("sim0").unwrap().is_open());
    }

    #[test]
    fn test_spawned_probe_reports_its_index() {
        let bus: Arc<dyn PortProvider> =
            Arc::new(SimulatedBus::new().with_device(SimulatedDevice::new("sim0").identity(9u8)));
        let (tx, rx) = crossbeam_channel::unbounded();
        let worker = IdentityProbe::new("sim0", 115200, TIMEOUT)
            .spawn_reporting(bus, Liveness::new(), 4, tx)
            .unwrap();
        worker.join().unwrap();

        let (index, result) = rx.try_recv().unwrap();
        assert_eq!(index, 4);
        assert_eq!(result.unwrap().pid, Pid::from(9u8));
    }
}
