//! # portbind
//!
//! Address serial devices by the identity they report rather than by a
//! volatile OS port name:
//! - Checksum-framed opcode/body protocol
//! - Concurrent discovery: every port probed in parallel for its PID
//! - Binding: a background worker attached to whichever port hosts PID N
//! - Cooperative run-loop workers with a host liveness context
//!
//! ## Example
//!
//! ```rust,no_run
//! use portbind::{BoundDevice, DeviceLink, DeviceSpec, DiscoveryCache, Liveness, SerialProvider};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! fn main() -> portbind::Result<()> {
//!     let liveness = Liveness::new();
//!     let cache = DiscoveryCache::new(Arc::new(SerialProvider::default()), liveness.clone());
//!     cache.refresh(115200, Duration::from_millis(500))?;
//!
//!     let sensor = BoundDevice::bind(
//!         DeviceSpec::new("sensor", 2u8),
//!         &cache,
//!         liveness.child(),
//!         |link: &mut DeviceLink| {
//!             if let Ok(reading) = link.request(0x01, &[]) {
//!                 println!("reading: {:?}", reading);
//!             }
//!             true
//!         },
//!     )?;
//!
//!     std::thread::sleep(Duration::from_secs(5));
//!     sensor.stop()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod cli;
pub mod config;
pub mod core;
pub mod error;

// Re-exports for convenience
pub use crate::cli::{CliResult, ExitCodes, OutputFormat, ToExitCode};
pub use crate::config::{AppConfig, ConfigError};
pub use crate::core::device::{BindError, BoundDevice, DeviceApp, DeviceLink, DeviceSpec};
pub use crate::core::discovery::{
    DiscoveryCache, DiscoveryError, DiscoveryReport, DiscoverySettings, IdentityConflict, Snapshot,
};
pub use crate::core::liveness::Liveness;
pub use crate::core::probe::{IdentityProbe, IdentityRecord, Pid, ProbeError};
pub use crate::core::protocol::{Frame, FrameCodec, FrameError};
pub use crate::core::transport::{
    PortProvider, SerialConfig, SerialProvider, SerialTransport, Transport, TransportError,
};
pub use crate::core::worker::{ExitReason, Worker, WorkerError, WorkerHandle, WorkerState};
pub use crate::error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
