//! Bound devices
//!
//! A [`BoundDevice`] is a long-lived worker attached to whichever port hosts a
//! declared PID at bind time. The discovery snapshot is consulted only once;
//! if the device moves, bind again after the next discovery cycle.

use super::discovery::{DiscoveryCache, Snapshot};
use super::liveness::Liveness;
use super::probe::Pid;
use super::protocol::{self, FrameError};
use super::transport::{PortProvider, Transport, TransportError, TransportStats};
use super::worker::{ExitReason, Worker, WorkerError, WorkerHandle};
use bytes::Bytes;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

/// Binding errors
#[derive(Error, Debug)]
pub enum BindError {
    /// The PID is not in the discovery snapshot
    #[error("Device '{name}' (PID {pid}) is not present")]
    DeviceNotPresent {
        /// Device name
        name: String,
        /// Declared PID
        pid: Pid,
    },

    /// The matched port could not be opened
    #[error("Device '{name}' could not open {port}: {source}")]
    Connection {
        /// Device name
        name: String,
        /// Port from the snapshot
        port: String,
        /// Underlying error
        #[source]
        source: TransportError,
    },

    /// The device worker could not be started
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Static description of a device: its declared PID and port settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSpec {
    name: String,
    pid: Pid,
    baud_rate: u32,
    timeout: Duration,
    interval: Option<Duration>,
}

impl DeviceSpec {
    /// Device `name` answering the identity query with `pid`
    pub fn new(name: impl Into<String>, pid: impl Into<Pid>) -> Self {
        Self {
            name: name.into(),
            pid: pid.into(),
            baud_rate: 115_200,
            timeout: Duration::from_millis(1000),
            interval: None,
        }
    }

    /// Set the baud rate
    #[must_use]
    pub fn baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the read timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Pause between loop iterations
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared PID
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Baud rate
    pub fn baud(&self) -> u32 {
        self.baud_rate
    }

    /// Read timeout
    pub fn read_timeout(&self) -> Duration {
        self.timeout
    }
}

/// Protocol client handed to the device's iteration function
pub struct DeviceLink {
    transport: Box<dyn Transport>,
    pid: Pid,
}

impl DeviceLink {
    /// Wrap an open transport
    pub fn new(transport: Box<dyn Transport>, pid: Pid) -> Self {
        Self { transport, pid }
    }

    /// Send one frame
    pub fn send(&mut self, opcode: u8, body: &[u8]) -> Result<(), FrameError> {
        protocol::write_frame(self.transport.as_mut(), opcode, body)
    }

    /// Receive one frame body, waiting at most one port timeout
    pub fn get(&mut self) -> Result<Bytes, FrameError> {
        protocol::read_frame(self.transport.as_mut())
    }

    /// Send one frame and wait for the reply body
    pub fn request(&mut self, opcode: u8, body: &[u8]) -> Result<Bytes, FrameError> {
        self.send(opcode, body)?;
        self.get()
    }

    /// Port the device is bound to
    pub fn port(&self) -> &str {
        self.transport.port()
    }

    /// Device PID
    pub fn pid(&self) -> &Pid {
        &self.pid
    }

    /// Whether the transport is still open
    pub fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }

    /// Transport statistics
    pub fn stats(&self) -> TransportStats {
        self.transport.stats()
    }
}

impl fmt::Debug for DeviceLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceLink")
            .field("port", &self.transport.port())
            .field("pid", &self.pid)
            .finish()
    }
}

/// Application logic run once per loop iteration.
///
/// Returning `false` ends the loop. Closures `FnMut(&mut DeviceLink) -> bool`
/// implement this trait.
pub trait DeviceApp: Send + 'static {
    /// One iteration
    fn iterate(&mut self, link: &mut DeviceLink) -> bool;
}

impl<F> DeviceApp for F
where
    F: FnMut(&mut DeviceLink) -> bool + Send + 'static,
{
    fn iterate(&mut self, link: &mut DeviceLink) -> bool {
        self(link)
    }
}

/// A device worker bound to the port hosting its PID
pub struct BoundDevice {
    spec: DeviceSpec,
    port: String,
    worker: Worker,
}

impl BoundDevice {
    /// Bind using the cache's current snapshot and provider
    pub fn bind<A: DeviceApp>(
        spec: DeviceSpec,
        cache: &DiscoveryCache,
        liveness: Liveness,
        app: A,
    ) -> Result<Self, BindError> {
        let snapshot = cache.snapshot();
        let provider = cache.provider();
        Self::bind_snapshot(spec, &snapshot, provider.as_ref(), liveness, app)
    }

    /// Bind against an explicit snapshot.
    ///
    /// Fails with [`BindError::DeviceNotPresent`] before anything is opened
    /// when the PID is unknown.
    pub fn bind_snapshot<A: DeviceApp>(
        spec: DeviceSpec,
        snapshot: &Snapshot,
        provider: &dyn PortProvider,
        liveness: Liveness,
        mut app: A,
    ) -> Result<Self, BindError> {
        let port = snapshot
            .get(spec.pid())
            .ok_or_else(|| BindError::DeviceNotPresent {
                name: spec.name.clone(),
                pid: spec.pid.clone(),
            })?
            .to_string();

        let transport = provider
            .open(&port, spec.baud(), spec.read_timeout())
            .map_err(|source| {
                warn!("Device '{}' could not open {}: {}", spec.name, port, source);
                BindError::Connection {
                    name: spec.name.clone(),
                    port: port.clone(),
                    source,
                }
            })?;

        let connected = transport.is_connected();
        let mut link = DeviceLink::new(transport, spec.pid.clone());
        let mut builder = Worker::builder(format!("device:{}", spec.name))
            .liveness(liveness)
            .connected(connected);
        if let Some(interval) = spec.interval {
            builder = builder.interval(interval);
        }
        let worker = builder.spawn(move || app.iterate(&mut link))?;

        info!("Device '{}' (PID {}) bound to {}", spec.name, spec.pid, port);
        Ok(Self { spec, port, worker })
    }

    /// Device name
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// Declared PID
    pub fn pid(&self) -> &Pid {
        &self.spec.pid
    }

    /// Port bound at bind time
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Device description
    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    /// Handle to the worker's flags
    pub fn handle(&self) -> WorkerHandle {
        self.worker.handle()
    }

    /// Ask the loop to stop at its next boundary
    pub fn request_exit(&self) {
        self.worker.request_exit();
    }

    /// Whether the loop has exited and the port is released
    pub fn is_done(&self) -> bool {
        self.worker.is_done()
    }

    /// Why the loop exited, once done
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.worker.exit_reason()
    }

    /// Block until done or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.worker.wait_timeout(timeout)
    }

    /// Wait for the loop to end on its own
    pub fn join(self) -> Result<ExitReason, WorkerError> {
        self.worker.join()
    }

    /// Request an exit and wait for the loop
    pub fn stop(self) -> Result<ExitReason, WorkerError> {
        self.worker.stop()
    }
}

impl fmt::Debug for BoundDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundDevice")
            .field("name", &self.spec.name)
            .field("pid", &self.spec.pid)
            .field("port", &self.port)
            .field("worker", &self.worker)
            .finish()
    }
}
