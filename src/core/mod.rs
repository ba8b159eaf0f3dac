//! Core module containing the main functionality of portbind
//!
//! This module provides:
//! - Transport layer over serial ports, behind a port provider
//! - Checksum-framed device protocol
//! - Run-loop workers and the host liveness context
//! - Identity probes and the discovery cache
//! - Devices bound to the port hosting their PID
//! - Simulated ports for tests and demos

pub mod device;
pub mod discovery;
pub mod liveness;
pub mod probe;
pub mod protocol;
pub mod simulator;
pub mod transport;
pub mod worker;
