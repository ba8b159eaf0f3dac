//! Simulated ports
//!
//! In-memory devices that speak the framed protocol, for tests and demos.
//! A [`SimulatedBus`] is a [`PortProvider`]: it enumerates its devices in the
//! order they were added and opens [`SimulatedTransport`]s on them.

use crate::core::probe::Pid;
use crate::core::protocol::{decode_command, Frame, IDENTITY_QUERY};
use crate::core::transport::{
    byte_debug_string, ConnectionState, PortProvider, Transport, TransportError, TransportStats,
};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::debug;

/// How a simulated device reacts to requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Behavior {
    /// Answer known opcodes
    #[default]
    Respond,
    /// Never answer
    Silent,
    /// Answer with a bad checksum byte
    CorruptChecksum,
    /// Refuse to open
    Unopenable,
    /// Stall every write until the port timeout
    WriteTimeout,
}

#[derive(Debug, Default)]
struct DeviceLog {
    frames: Vec<Frame>,
    opens: usize,
    open: bool,
    baud_rate: Option<u32>,
}

/// One simulated device attached to a port
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    port: String,
    identity: Option<Pid>,
    replies: Arc<RwLock<HashMap<u8, Bytes>>>,
    behavior: Behavior,
    delay: Duration,
    log: Arc<Mutex<DeviceLog>>,
}

impl SimulatedDevice {
    /// A device on `port` that knows no opcodes yet
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            identity: None,
            replies: Arc::new(RwLock::new(HashMap::new())),
            behavior: Behavior::Respond,
            delay: Duration::ZERO,
            log: Arc::new(Mutex::new(DeviceLog::default())),
        }
    }

    /// Answer the identity query with `pid`
    #[must_use]
    pub fn identity(mut self, pid: impl Into<Pid>) -> Self {
        self.identity = Some(pid.into());
        self
    }

    /// Answer `opcode` with `body`
    #[must_use]
    pub fn reply(self, opcode: u8, body: impl Into<Bytes>) -> Self {
        self.set_reply(opcode, body);
        self
    }

    /// Never answer anything
    #[must_use]
    pub fn silent(mut self) -> Self {
        self.behavior = Behavior::Silent;
        self
    }

    /// Send replies with a corrupted checksum
    #[must_use]
    pub fn corrupt_checksum(mut self) -> Self {
        self.behavior = Behavior::CorruptChecksum;
        self
    }

    /// Refuse to be opened
    #[must_use]
    pub fn unopenable(mut self) -> Self {
        self.behavior = Behavior::Unopenable;
        self
    }

    /// Let every write time out without reaching the device
    #[must_use]
    pub fn write_timeout(mut self) -> Self {
        self.behavior = Behavior::WriteTimeout;
        self
    }

    /// Hold each reply back for `delay`
    #[must_use]
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Change the reply to `opcode`, also while the device is in use
    pub fn set_reply(&self, opcode: u8, body: impl Into<Bytes>) {
        self.replies.write().insert(opcode, body.into());
    }

    /// Port name
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Configured behavior
    pub fn behavior(&self) -> Behavior {
        self.behavior
    }

    /// Every request frame received so far
    pub fn received_frames(&self) -> Vec<Frame> {
        self.log.lock().frames.clone()
    }

    /// How many times the port has been opened
    pub fn open_count(&self) -> usize {
        self.log.lock().opens
    }

    /// Whether a transport is currently open on this device
    pub fn is_open(&self) -> bool {
        self.log.lock().open
    }

    /// Baud rate of the most recent open
    pub fn last_baud_rate(&self) -> Option<u32> {
        self.log.lock().baud_rate
    }

    fn respond(&self, request: &Frame) -> Option<Bytes> {
        if self.behavior == Behavior::Silent {
            return None;
        }

        let body = if request.code() == IDENTITY_QUERY {
            self.identity.as_ref().map(|pid| Bytes::copy_from_slice(pid.as_bytes()))
        } else {
            self.replies.read().get(&request.code()).cloned()
        }?;

        let reply = match Frame::reply(body) {
            Ok(reply) => reply,
            Err(e) => {
                debug!("{}: cannot encode reply: {}", self.port, e);
                return None;
            }
        };

        let mut wire = reply.to_bytes().to_vec();
        if self.behavior == Behavior::CorruptChecksum {
            if let Some(chk) = wire.last_mut() {
                *chk ^= 0xFF;
            }
        }
        Some(Bytes::from(wire))
    }
}

/// Transport connected to a [`SimulatedDevice`]
pub struct SimulatedTransport {
    device: SimulatedDevice,
    timeout: Duration,
    state: ConnectionState,
    pending: BytesMut,
    delay_due: bool,
    stats: TransportStats,
}

impl Transport for SimulatedTransport {
    fn port(&self) -> &str {
        &self.device.port
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn read(&mut self, len: usize) -> Result<Bytes, TransportError> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }

        if self.delay_due {
            self.delay_due = false;
            if self.device.delay >= self.timeout {
                thread::sleep(self.timeout);
                self.stats.read_timeouts += 1;
                return Ok(Bytes::new());
            }
            thread::sleep(self.device.delay);
        }

        if self.pending.is_empty() {
            thread::sleep(self.timeout);
            self.stats.read_timeouts += 1;
            return Ok(Bytes::new());
        }

        let n = len.min(self.pending.len());
        self.stats.bytes_received += n as u64;
        Ok(self.pending.split_to(n).freeze())
    }

    fn write(&mut self, data: &[u8]) -> Result<(), TransportError> {
        if self.state != ConnectionState::Open {
            return Err(TransportError::NotConnected);
        }
        debug!("{}.write: {}", self.device.port, byte_debug_string(data));
        if self.device.behavior == Behavior::WriteTimeout {
            thread::sleep(self.timeout);
            self.stats.errors += 1;
            return Err(TransportError::WriteTimeout(self.device.port.clone()));
        }
        self.stats.bytes_sent += data.len() as u64;
        self.stats.writes += 1;

        match decode_command(data) {
            Ok(request) => {
                let reply = self.device.respond(&request);
                self.device.log.lock().frames.push(request);
                if let Some(reply) = reply {
                    self.pending.extend_from_slice(&reply);
                    self.delay_due = !self.device.delay.is_zero();
                }
            }
            Err(e) => debug!("{}: ignoring malformed request: {}", self.device.port, e),
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.state == ConnectionState::Open {
            self.device.log.lock().open = false;
            debug!("Connection to simulated port {} closed.", self.device.port);
        }
        self.state = ConnectionState::Closed;
        self.pending.clear();
    }

    fn stats(&self) -> TransportStats {
        self.stats.clone()
    }
}

impl Drop for SimulatedTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// A set of simulated devices acting as the system's ports
#[derive(Debug, Clone, Default)]
pub struct SimulatedBus {
    devices: Arc<RwLock<Vec<SimulatedDevice>>>,
}

impl SimulatedBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device (builder form)
    #[must_use]
    pub fn with_device(self, device: SimulatedDevice) -> Self {
        self.attach(device);
        self
    }

    /// Attach a device; it is enumerated after those already present
    pub fn attach(&self, device: SimulatedDevice) {
        self.devices.write().push(device);
    }

    /// Detach the device on `port`
    pub fn detach(&self, port: &str) -> Option<SimulatedDevice> {
        let mut devices = self.devices.write();
        let index = devices.iter().position(|d| d.port == port)?;
        Some(devices.remove(index))
    }

    /// Device on `port`
    pub fn device(&self, port: &str) -> Option<SimulatedDevice> {
        self.devices.read().iter().find(|d| d.port == port).cloned()
    }

    /// Total opens across all devices
    pub fn total_opens(&self) -> usize {
        self.devices.read().iter().map(SimulatedDevice::open_count).sum()
    }
}

impl PortProvider for SimulatedBus {
    fn list_ports(&self) -> Result<Vec<String>, TransportError> {
        Ok(self.devices.read().iter().map(|d| d.port.clone()).collect())
    }

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let device = self
            .device(port)
            .ok_or_else(|| TransportError::PortNotFound(port.to_string()))?;

        if device.behavior == Behavior::Unopenable {
            return Err(TransportError::ConnectionFailed(format!("{port}: device refused")));
        }

        {
            let mut log = device.log.lock();
            if log.open {
                return Err(TransportError::ConnectionFailed(format!("{port}: already open")));
            }
            log.open = true;
            log.opens += 1;
            log.baud_rate = Some(baud_rate);
        }

        Ok(Box::new(SimulatedTransport {
            device,
            timeout,
            state: ConnectionState::Open,
            pending: BytesMut::new(),
            delay_due: false,
            stats: TransportStats::default(),
        }))
    }
}
