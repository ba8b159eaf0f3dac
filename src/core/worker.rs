//! Run-loop workers
//!
//! A worker owns one background thread that repeatedly calls an iteration
//! function. The loop continues while all of the following hold:
//!
//! - the iteration function returned `true`
//! - the host is alive (see [`Liveness`])
//! - no exit has been requested
//!
//! Exit requests are advisory and observed at loop boundaries only; an
//! iteration blocked in a read finishes (bounded by the port timeout) first.
//! When the loop ends, everything the iteration function owns is dropped
//! (closing its transport) and the worker is marked done. `done` never resets.

use super::liveness::Liveness;
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, trace};

/// Worker lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, thread not yet running
    Created,
    /// Loop running
    Running,
    /// Loop exited; terminal
    Done,
}

/// Why a worker loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The iteration function returned `false`
    Finished,
    /// An exit was requested
    ExitRequested,
    /// The liveness context was shut down
    HostGone,
    /// The iteration function panicked
    Panicked,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Finished => write!(f, "finished"),
            Self::ExitRequested => write!(f, "exit requested"),
            Self::HostGone => write!(f, "host gone"),
            Self::Panicked => write!(f, "panicked"),
        }
    }
}

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    /// The OS refused to start the thread
    #[error("Failed to spawn worker '{name}': {source}")]
    Spawn {
        /// Worker name
        name: String,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The worker body panicked
    #[error("Worker '{0}' panicked")]
    Panicked(String),

    /// The worker was stopped before its body ran
    #[error("Worker '{0}' stopped before running")]
    Cancelled(String),
}

struct Status {
    state: WorkerState,
    reason: Option<ExitReason>,
}

struct Shared {
    name: String,
    exit_request: AtomicBool,
    iterations: AtomicU64,
    status: Mutex<Status>,
    changed: Condvar,
}

impl Shared {
    fn new(name: String) -> Arc<Self> {
        Arc::new(Self {
            name,
            exit_request: AtomicBool::new(false),
            iterations: AtomicU64::new(0),
            status: Mutex::new(Status {
                state: WorkerState::Created,
                reason: None,
            }),
            changed: Condvar::new(),
        })
    }

    fn set_running(&self) {
        let mut status = self.status.lock();
        if status.state == WorkerState::Created {
            status.state = WorkerState::Running;
        }
    }

    fn finish(&self, reason: ExitReason) {
        let mut status = self.status.lock();
        if status.state == WorkerState::Done {
            return;
        }
        status.state = WorkerState::Done;
        status.reason = Some(reason);
        self.changed.notify_all();
    }
}

/// Cloneable reference to a worker's shared flags
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
}

impl WorkerHandle {
    /// Worker (and thread) name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Ask the worker to stop at its next loop boundary
    pub fn request_exit(&self) {
        self.shared.exit_request.store(true, Ordering::Release);
    }

    /// Whether an exit has been requested
    pub fn exit_requested(&self) -> bool {
        self.shared.exit_request.load(Ordering::Acquire)
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.shared.status.lock().state
    }

    /// Whether the loop has exited
    pub fn is_done(&self) -> bool {
        self.state() == WorkerState::Done
    }

    /// Why the loop exited, once done
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.shared.status.lock().reason
    }

    /// Completed iterations
    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Relaxed)
    }

    /// Block until the worker is done
    pub fn wait(&self) {
        let mut status = self.shared.status.lock();
        while status.state != WorkerState::Done {
            self.shared.changed.wait(&mut status);
        }
    }

    /// Block until the worker is done or `timeout` elapses; returns whether it is done
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut status = self.shared.status.lock();
        while status.state != WorkerState::Done {
            if self.shared.changed.wait_until(&mut status, deadline).timed_out() {
                return status.state == WorkerState::Done;
            }
        }
        true
    }
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("name", &self.shared.name)
            .field("state", &self.state())
            .field("exit_requested", &self.exit_requested())
            .finish()
    }
}

/// Worker configuration
pub struct WorkerBuilder {
    name: String,
    liveness: Liveness,
    connected: bool,
    interval: Option<Duration>,
}

impl WorkerBuilder {
    /// Start building a worker named `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            liveness: Liveness::new(),
            connected: true,
            interval: None,
        }
    }

    /// Liveness context the worker watches
    #[must_use]
    pub fn liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    /// Whether the worker's transport is connected.
    ///
    /// An unconnected worker has its exit requested up front, so its first
    /// iteration is also its last.
    #[must_use]
    pub fn connected(mut self, connected: bool) -> Self {
        self.connected = connected;
        self
    }

    /// Pause between iterations
    #[must_use]
    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    /// Start a looping worker
    pub fn spawn<F>(self, f: F) -> Result<Worker, WorkerError>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let shared = Shared::new(self.name.clone());
        if !self.connected {
            debug!("Worker '{}' has no connected transport; running once", self.name);
            shared.exit_request.store(true, Ordering::Release);
        }

        let thread_shared = Arc::clone(&shared);
        let liveness = self.liveness;
        let interval = self.interval;
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                thread_shared.set_running();
                trace!("Worker '{}' started", thread_shared.name);
                let reason = run_loop(&thread_shared, &liveness, interval, f);
                debug!("Worker '{}' stopped: {}", thread_shared.name, reason);
                thread_shared.finish(reason);
                reason
            })
            .map_err(|source| WorkerError::Spawn {
                name: self.name,
                source,
            })?;

        Ok(Worker {
            handle: WorkerHandle { shared },
            join: Some(join),
        })
    }

    /// Start a single-shot worker that runs `f` once and yields its result.
    ///
    /// If the host is gone or an exit was requested before the thread starts,
    /// `f` is not run and [`OnceWorker::join`] reports [`WorkerError::Cancelled`].
    pub fn spawn_once<T, F>(self, f: F) -> Result<OnceWorker<T>, WorkerError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let shared = Shared::new(self.name.clone());
        let thread_shared = Arc::clone(&shared);
        let liveness = self.liveness;
        let join = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                thread_shared.set_running();
                if !liveness.is_host_alive() {
                    thread_shared.finish(ExitReason::HostGone);
                    return Err(WorkerError::Cancelled(thread_shared.name.clone()));
                }
                if thread_shared.exit_request.load(Ordering::Acquire) {
                    thread_shared.finish(ExitReason::ExitRequested);
                    return Err(WorkerError::Cancelled(thread_shared.name.clone()));
                }

                let result = panic::catch_unwind(AssertUnwindSafe(f));
                thread_shared.iterations.fetch_add(1, Ordering::Relaxed);
                match result {
                    Ok(value) => {
                        thread_shared.finish(ExitReason::Finished);
                        Ok(value)
                    }
                    Err(_) => {
                        error!("Worker '{}' panicked", thread_shared.name);
                        thread_shared.finish(ExitReason::Panicked);
                        Err(WorkerError::Panicked(thread_shared.name.clone()))
                    }
                }
            })
            .map_err(|source| WorkerError::Spawn {
                name: self.name,
                source,
            })?;

        Ok(OnceWorker {
            handle: WorkerHandle { shared },
            join: Some(join),
        })
    }
}

fn run_loop<F>(shared: &Shared, liveness: &Liveness, interval: Option<Duration>, mut f: F) -> ExitReason
where
    F: FnMut() -> bool,
{
    loop {
        let keep_going = match panic::catch_unwind(AssertUnwindSafe(&mut f)) {
            Ok(keep_going) => keep_going,
            Err(_) => {
                error!("Worker '{}' panicked; stopping", shared.name);
                return ExitReason::Panicked;
            }
        };
        shared.iterations.fetch_add(1, Ordering::Relaxed);

        if !keep_going {
            return ExitReason::Finished;
        }
        if let Some(interval) = interval {
            thread::sleep(interval);
        }
        if !liveness.is_host_alive() {
            return ExitReason::HostGone;
        }
        if shared.exit_request.load(Ordering::Acquire) {
            return ExitReason::ExitRequested;
        }
    }
}

/// A looping background worker.
///
/// Dropping a worker requests an exit and joins its thread.
pub struct Worker {
    handle: WorkerHandle,
    join: Option<JoinHandle<ExitReason>>,
}

impl Worker {
    /// Start configuring a worker
    pub fn builder(name: impl Into<String>) -> WorkerBuilder {
        WorkerBuilder::new(name)
    }

    /// Cloneable handle to this worker's flags
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Worker name
    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Ask the worker to stop at its next loop boundary
    pub fn request_exit(&self) {
        self.handle.request_exit();
    }

    /// Whether the loop has exited
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.handle.state()
    }

    /// Why the loop exited, once done
    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.handle.exit_reason()
    }

    /// Completed iterations
    pub fn iterations(&self) -> u64 {
        self.handle.iterations()
    }

    /// Block until done
    pub fn wait(&self) {
        self.handle.wait();
    }

    /// Block until done or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.handle.wait_timeout(timeout)
    }

    /// Wait for the thread to exit
    pub fn join(mut self) -> Result<ExitReason, WorkerError> {
        self.join_thread()
    }

    /// Request an exit and wait for the thread
    pub fn stop(self) -> Result<ExitReason, WorkerError> {
        self.request_exit();
        self.join()
    }

    fn join_thread(&mut self) -> Result<ExitReason, WorkerError> {
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| WorkerError::Panicked(self.handle.name().to_string())),
            None => Ok(self.handle.exit_reason().unwrap_or(ExitReason::Finished)),
        }
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Worker").field(&self.handle).finish()
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.join.is_some() {
            self.handle.request_exit();
            let _ = self.join_thread();
        }
    }
}

/// A single-shot background worker yielding one value
pub struct OnceWorker<T> {
    handle: WorkerHandle,
    join: Option<JoinHandle<Result<T, WorkerError>>>,
}

impl<T> OnceWorker<T> {
    /// Cloneable handle to this worker's flags
    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Whether the body has run (or been skipped)
    pub fn is_done(&self) -> bool {
        self.handle.is_done()
    }

    /// Ask the worker not to run if it has not started yet
    pub fn request_exit(&self) {
        self.handle.request_exit();
    }

    /// Block until done or `timeout` elapses
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.handle.wait_timeout(timeout)
    }

    /// Wait for the result
    pub fn join(mut self) -> Result<T, WorkerError> {
        match self.join.take() {
            Some(join) => join
                .join()
                .unwrap_or_else(|_| Err(WorkerError::Panicked(self.handle.name().to_string()))),
            None => Err(WorkerError::Cancelled(self.handle.name().to_string())),
        }
    }
}

impl<T> Drop for OnceWorker<T> {
    fn drop(&mut self) {
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct DropFlag(Arc<AtomicBool>);

    impl Drop for DropFlag {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_runs_until_iteration_returns_false() {
        let mut remaining = 5;
        let worker = Worker::builder("countdown")
            .spawn(move || {
                remaining -= 1;
                remaining > 0
            })
            .unwrap();

        worker.wait();
        assert!(worker.is_done());
        assert_eq!(worker.iterations(), 5);
        assert_eq!(worker.exit_reason(), Some(ExitReason::Finished));
        assert_eq!(worker.join().unwrap(), ExitReason::Finished);
    }

    #[test]
    fn test_exit_request_observed_at_boundary() {
        let worker = Worker::builder("spinner")
            .spawn(|| {
                thread::sleep(Duration::from_millis(2));
                true
            })
            .unwrap();

        assert!(!worker.wait_timeout(Duration::from_millis(20)));
        assert_eq!(worker.state(), WorkerState::Running);

        worker.request_exit();
        assert!(worker.wait_timeout(Duration::from_secs(2)));
        assert_eq!(worker.exit_reason(), Some(ExitReason::ExitRequested));
    }

    #[test]
    fn test_exit_request_through_cloned_handle() {
        let worker = Worker::builder("cloned")
            .interval(Duration::from_millis(1))
            .spawn(|| true)
            .unwrap();
        let handle = worker.handle();
        thread::spawn(move || handle.request_exit()).join().unwrap();
        assert_eq!(worker.join().unwrap(), ExitReason::ExitRequested);
    }

    #[test]
    fn test_host_shutdown_stops_worker() {
        let liveness = Liveness::new();
        let worker = Worker::builder("watched")
            .liveness(liveness.child())
            .interval(Duration::from_millis(1))
            .spawn(|| true)
            .unwrap();

        liveness.shutdown();
        assert!(worker.wait_timeout(Duration::from_secs(2)));
        assert_eq!(worker.exit_reason(), Some(ExitReason::HostGone));
    }

    #[test]
    fn test_unconnected_worker_runs_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let worker = Worker::builder("unconnected")
            .connected(false)
            .spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            })
            .unwrap();

        assert_eq!(worker.join().unwrap(), ExitReason::ExitRequested);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_owned_resources_released_before_done() {
        let released = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&released));
        let worker = Worker::builder("owner")
            .spawn(move || {
                let _keep = &guard;
                false
            })
            .unwrap();

        worker.wait();
        assert!(released.load(Ordering::SeqCst));
    }

    #[test]
    fn test_panicking_iteration_marks_done() {
        let worker = Worker::builder("panicky")
            .spawn(|| panic!("iteration failed"))
            .unwrap();

        worker.wait();
        assert_eq!(worker.exit_reason(), Some(ExitReason::Panicked));
        assert_eq!(worker.join().unwrap(), ExitReason::Panicked);
    }

    #[test]
    fn test_drop_stops_worker() {
        let stopped = Arc::new(AtomicBool::new(false));
        let guard = DropFlag(Arc::clone(&stopped));
        let worker = Worker::builder("dropped")
            .interval(Duration::from_millis(1))
            .spawn(move || {
                let _keep = &guard;
                true
            })
            .unwrap();
        let handle = worker.handle();

        drop(worker);
        assert!(handle.is_done());
        assert!(stopped.load(Ordering::SeqCst));
    }

    #[test]
    fn test_done_is_terminal() {
        let worker = Worker::builder("terminal").spawn(|| false).unwrap();
        let handle = worker.handle();
        assert_eq!(worker.join().unwrap(), ExitReason::Finished);
        handle.request_exit();
        assert_eq!(handle.state(), WorkerState::Done);
        assert_eq!(handle.exit_reason(), Some(ExitReason::Finished));
    }

    #[test]
    fn test_spawn_once_yields_value() {
        let worker = Worker::builder("once").spawn_once(|| 6 * 7).unwrap();
        let handle = worker.handle();
        assert_eq!(worker.join().unwrap(), 42);
        assert!(handle.is_done());
        assert_eq!(handle.iterations(), 1);
    }

    #[test]
    fn test_spawn_once_skipped_when_host_gone() {
        let liveness = Liveness::new();
        liveness.shutdown();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let worker = Worker::builder("late")
            .liveness(liveness)
            .spawn_once(move || flag.store(true, Ordering::SeqCst))
            .unwrap();

        assert!(matches!(worker.join(), Err(WorkerError::Cancelled(_))));
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_spawn_once_panic_reported() {
        let worker = Worker::builder("once-panic")
            .spawn_once(|| -> u8 { panic!("probe failed") })
            .unwrap();
        assert!(matches!(worker.join(), Err(WorkerError::Panicked(_))));
    }
}
