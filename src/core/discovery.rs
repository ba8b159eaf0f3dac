//! Discovery cache
//!
//! A discovery cycle probes every enumerated port concurrently, one
//! [`IdentityProbe`] thread per port, and blocks until all of them are done.
//! Results travel back over a channel and are aggregated on the calling thread
//! in enumeration order; a PID reported by two ports stays bound to the first
//! one. The resulting [`Snapshot`] replaces the previous one as a whole, so
//! readers always see either the old or the new mapping.

use super::liveness::Liveness;
use super::probe::{IdentityProbe, IdentityRecord, Pid, ProbeError};
use super::protocol::FrameError;
use super::transport::{PortProvider, TransportError};
use crossbeam_channel::unbounded;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default baud rate for identity probes
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Default time a probe waits for the identity reply
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Discovery errors
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// Ports could not be enumerated
    #[error("Port enumeration failed: {0}")]
    Enumeration(#[from] TransportError),

    /// The host shut down before the cycle started
    #[error("Discovery cancelled: host is shutting down")]
    HostGone,

    /// Background discovery task failed
    #[error("Discovery task failed: {0}")]
    Task(String),
}

/// Settings for one discovery cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySettings {
    /// Baud rate used to open each port
    pub baud_rate: u32,
    /// How long each probe waits for its reply
    pub timeout: Duration,
    /// Only probe ports whose name contains one of these (all ports if empty)
    pub include: Vec<String>,
    /// Never probe ports whose name contains one of these
    pub exclude: Vec<String>,
}

impl DiscoverySettings {
    /// Probe every port at `baud_rate`, waiting `timeout` per reply
    pub fn new(baud_rate: u32, timeout: Duration) -> Self {
        Self {
            baud_rate,
            timeout,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }

    /// Add an include filter
    #[must_use]
    pub fn include(mut self, pattern: impl Into<String>) -> Self {
        self.include.push(pattern.into());
        self
    }

    /// Add an exclude filter
    #[must_use]
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Whether `port` passes the filters
    pub fn matches(&self, port: &str) -> bool {
        let included =
            self.include.is_empty() || self.include.iter().any(|p| port.contains(p.as_str()));
        included && !self.exclude.iter().any(|p| port.contains(p.as_str()))
    }
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self::new(DEFAULT_BAUD_RATE, DEFAULT_PROBE_TIMEOUT)
    }
}

/// Two ports reported the same PID
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConflict {
    /// Contested identity
    pub pid: Pid,
    /// Port that keeps the binding (enumerated first)
    pub kept: String,
    /// Port that was ignored
    pub rejected: String,
}

impl fmt::Display for IdentityConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PID {} reported by both {} and {}; keeping {}",
            self.pid, self.kept, self.rejected, self.kept
        )
    }
}

/// Why a port produced no identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Port could not be opened
    Unopenable,
    /// Identity query could not be written
    WriteFailed,
    /// Nothing came back before the timeout
    NoResponse,
    /// Reply body was empty
    EmptyIdentity,
    /// Reply failed its checksum
    ChecksumFault,
    /// Reply was malformed or cut short
    InvalidReply,
    /// Probe thread failed or was cancelled
    Worker,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unopenable => "unopenable",
            Self::WriteFailed => "write failed",
            Self::NoResponse => "no response",
            Self::EmptyIdentity => "empty identity",
            Self::ChecksumFault => "checksum fault",
            Self::InvalidReply => "invalid reply",
            Self::Worker => "probe failed",
        };
        f.write_str(s)
    }
}

/// A port that produced no identity this cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeFailure {
    /// Port
    pub port: String,
    /// Failure class
    pub kind: FailureKind,
    /// Human readable detail
    pub message: String,
}

impl From<&ProbeError> for ProbeFailure {
    fn from(err: &ProbeError) -> Self {
        let kind = match err {
            ProbeError::Connection { .. } => FailureKind::Unopenable,
            ProbeError::Write { .. } => FailureKind::WriteFailed,
            ProbeError::NoResponse { .. } => FailureKind::NoResponse,
            ProbeError::EmptyIdentity { .. } => FailureKind::EmptyIdentity,
            ProbeError::Frame {
                source: FrameError::ChecksumFault { .. },
                ..
            } => FailureKind::ChecksumFault,
            ProbeError::Frame { .. } => FailureKind::InvalidReply,
            ProbeError::Worker { .. } => FailureKind::Worker,
        };
        Self {
            port: err.port().to_string(),
            kind,
            message: err.to_string(),
        }
    }
}

/// Immutable PID → port mapping published by one discovery cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    cycle: u64,
    entries: BTreeMap<Pid, String>,
}

impl Snapshot {
    /// Port hosting `pid`
    pub fn get(&self, pid: &Pid) -> Option<&str> {
        self.entries.get(pid).map(String::as_str)
    }

    /// Whether `pid` was found
    pub fn contains(&self, pid: &Pid) -> bool {
        self.entries.contains_key(pid)
    }

    /// Number of identified devices
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no device was identified
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries ordered by PID
    pub fn iter(&self) -> impl Iterator<Item = (&Pid, &str)> {
        self.entries.iter().map(|(pid, port)| (pid, port.as_str()))
    }

    /// Discovery cycle that produced this snapshot (0 = never refreshed)
    pub fn cycle(&self) -> u64 {
        self.cycle
    }
}

/// Full outcome of one discovery cycle
#[derive(Debug, Clone)]
pub struct DiscoveryReport {
    /// Published mapping
    pub snapshot: Arc<Snapshot>,
    /// Ports probed, in enumeration order
    pub ports: Vec<String>,
    /// Ports without an identity
    pub failures: Vec<ProbeFailure>,
    /// Duplicate PIDs
    pub conflicts: Vec<IdentityConflict>,
    /// Wall time of the cycle
    pub elapsed: Duration,
}

/// Process-wide PID → port cache
pub struct DiscoveryCache {
    provider: Arc<dyn PortProvider>,
    liveness: Liveness,
    current: RwLock<Arc<Snapshot>>,
    refreshing: Mutex<()>,
    cycles: AtomicU64,
}

impl DiscoveryCache {
    /// Empty cache over `provider`; probes watch `liveness`
    pub fn new(provider: Arc<dyn PortProvider>, liveness: Liveness) -> Self {
        Self {
            provider,
            liveness,
            current: RwLock::new(Arc::new(Snapshot::default())),
            refreshing: Mutex::new(()),
            cycles: AtomicU64::new(0),
        }
    }

    /// Port provider used for probing and binding
    pub fn provider(&self) -> Arc<dyn PortProvider> {
        Arc::clone(&self.provider)
    }

    /// Liveness context probes are started with
    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.current.read())
    }

    /// Port currently hosting `pid`
    pub fn lookup(&self, pid: &Pid) -> Option<String> {
        self.current.read().get(pid).map(str::to_string)
    }

    /// Number of devices in the current snapshot
    pub fn len(&self) -> usize {
        self.current.read().len()
    }

    /// Whether the current snapshot is empty
    pub fn is_empty(&self) -> bool {
        self.current.read().is_empty()
    }

    /// Run a discovery cycle over every port and return the new mapping
    pub fn refresh(&self, baud_rate: u32, timeout: Duration) -> Result<Arc<Snapshot>, DiscoveryError> {
        self.refresh_with(&DiscoverySettings::new(baud_rate, timeout))
            .map(|report| report.snapshot)
    }

    /// Run a discovery cycle and return the full report.
    ///
    /// Blocks until every probe has finished. Concurrent callers are
    /// serialized; each publishes its own snapshot.
    pub fn refresh_with(&self, settings: &DiscoverySettings) -> Result<DiscoveryReport, DiscoveryError> {
        let _guard = self.refreshing.lock();
        if !self.liveness.is_host_alive() {
            return Err(DiscoveryError::HostGone);
        }

        let started = Instant::now();
        let ports: Vec<String> = self
            .provider
            .list_ports()?
            .into_iter()
            .filter(|port| settings.matches(port))
            .collect();
        debug!("Probing {} port(s)", ports.len());

        let outcomes = self.probe_all(&ports, settings);

        let mut entries: BTreeMap<Pid, String> = BTreeMap::new();
        let mut failures = Vec::new();
        let mut conflicts = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(IdentityRecord { port, pid }) => match entries.get(&pid) {
                    Some(kept) => {
                        let conflict = IdentityConflict {
                            pid,
                            kept: kept.clone(),
                            rejected: port,
                        };
                        warn!("{}", conflict);
                        conflicts.push(conflict);
                    }
                    None => {
                        entries.insert(pid, port);
                    }
                },
                Err(e) => {
                    if matches!(e, ProbeError::Connection { .. }) {
                        warn!("{}", e);
                    }
                    failures.push(ProbeFailure::from(&e));
                }
            }
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(Snapshot { cycle, entries });
        *self.current.write() = Arc::clone(&snapshot);

        info!("Found {} serial devices", snapshot.len());
        for (pid, port) in snapshot.iter() {
            info!("{} | {}", port, pid);
        }

        Ok(DiscoveryReport {
            snapshot,
            ports,
            failures,
            conflicts,
            elapsed: started.elapsed(),
        })
    }

    /// Run [`refresh_with`](Self::refresh_with) on the blocking thread pool
    pub async fn refresh_async(
        self: &Arc<Self>,
        settings: DiscoverySettings,
    ) -> Result<DiscoveryReport, DiscoveryError> {
        let cache = Arc::clone(self);
        tokio::task::spawn_blocking(move || cache.refresh_with(&settings))
            .await
            .map_err(|e| DiscoveryError::Task(e.to_string()))?
    }

    /// Probe every port concurrently; outcomes come back in enumeration order
    fn probe_all(
        &self,
        ports: &[String],
        settings: &DiscoverySettings,
    ) -> Vec<Result<IdentityRecord, ProbeError>> {
        let (tx, rx) = unbounded();
        let mut slots: Vec<Option<Result<IdentityRecord, ProbeError>>> =
            ports.iter().map(|_| None).collect();
        let mut workers = Vec::with_capacity(ports.len());

        for (index, port) in ports.iter().enumerate() {
            let spawned = IdentityProbe::new(port.clone(), settings.baud_rate, settings.timeout)
                .spawn_reporting(
                    Arc::clone(&self.provider),
                    self.liveness.clone(),
                    index,
                    tx.clone(),
                );
            match spawned {
                Ok(worker) => workers.push((index, worker)),
                Err(source) => {
                    slots[index] = Some(Err(ProbeError::Worker {
                        port: port.clone(),
                        source,
                    }))
                }
            }
        }
        drop(tx);

        let mut join_errors = Vec::new();
        for (index, worker) in workers {
            if let Err(source) = worker.join() {
                join_errors.push((index, source));
            }
        }

        for (index, result) in rx.try_iter() {
            slots[index] = Some(result);
        }
        for (index, source) in join_errors {
            if slots[index].is_none() {
                slots[index] = Some(Err(ProbeError::Worker {
                    port: ports[index].clone(),
                    source,
                }));
            }
        }

        slots
            .into_iter()
            .zip(ports)
            .map(|(slot, port)| {
                slot.unwrap_or_else(|| Err(ProbeError::NoResponse { port: port.clone() }))
            })
            .collect()
    }
}

impl fmt::Debug for DiscoveryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveryCache")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
