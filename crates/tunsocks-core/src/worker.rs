//! Forwarding worker threads with panic isolation.
//!
//! Each engine runs to completion on its own named thread. The worker
//! reports how the engine exited through a callback and exposes a
//! cooperative stop signal; the owner joins the thread after stopping it.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info, warn};

use crate::engine::EngineError;

/// Which engine a worker drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerKind {
    /// TUN-to-SOCKS5 packet engine
    Tunnel,
    /// DNS-to-SOCKS5 forwarder
    Dns,
}

impl WorkerKind {
    fn thread_name(&self) -> &'static str {
        match self {
            WorkerKind::Tunnel => "tun2socks-worker",
            WorkerKind::Dns => "dns2socks-worker",
        }
    }
}

impl std::fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerKind::Tunnel => f.write_str("tunnel"),
            WorkerKind::Dns => f.write_str("dns"),
        }
    }
}

/// How an engine run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// Engine returned normally
    Finished,
    /// Engine returned an error
    Failed(EngineError),
    /// Engine panicked
    Panicked(String),
}

impl WorkerExit {
    pub fn is_failure(&self) -> bool {
        !matches!(self, WorkerExit::Finished)
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to launch {kind} worker: {source}")]
    LaunchFailed {
        kind: WorkerKind,
        #[source]
        source: std::io::Error,
    },
}

type StopFn = Box<dyn Fn() + Send + Sync>;

/// Body of a worker thread
pub type ThreadBody = Box<dyn FnOnce() + Send + 'static>;

/// Starts the OS threads workers run on
pub trait ThreadSpawner: Send + Sync {
    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<thread::JoinHandle<()>>;
}

/// Plain named `std` threads
#[derive(Debug, Clone, Copy, Default)]
pub struct NamedThreads;

impl ThreadSpawner for NamedThreads {
    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<thread::JoinHandle<()>> {
        thread::Builder::new().name(name.to_string()).spawn(body)
    }
}

/// Handle to one running engine
pub struct Worker {
    kind: WorkerKind,
    running: Arc<AtomicBool>,
    terminated: AtomicBool,
    stop: StopFn,
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    /// Spawn `run` on a dedicated thread.
    ///
    /// `stop` must make `run` return. `on_exit` is called on the worker
    /// thread once `run` has returned, panics included.
    pub fn spawn<R, S, E>(kind: WorkerKind, run: R, stop: S, on_exit: E) -> Result<Self, WorkerError>
    where
        R: FnOnce() -> Result<(), EngineError> + Send + 'static,
        S: Fn() + Send + Sync + 'static,
        E: FnOnce(WorkerKind, WorkerExit) + Send + 'static,
    {
        Self::spawn_on(&NamedThreads, kind, run, stop, on_exit)
    }

    /// [`spawn`](Self::spawn) with an explicit thread source
    pub fn spawn_on<R, S, E>(
        spawner: &dyn ThreadSpawner,
        kind: WorkerKind,
        run: R,
        stop: S,
        on_exit: E,
    ) -> Result<Self, WorkerError>
    where
        R: FnOnce() -> Result<(), EngineError> + Send + 'static,
        S: Fn() + Send + Sync + 'static,
        E: FnOnce(WorkerKind, WorkerExit) + Send + 'static,
    {
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();

        let handle = spawner
            .spawn(
                kind.thread_name(),
                Box::new(move || {
                    info!("{} worker started", kind);
                    let exit = run_isolated(kind, run);
                    flag.store(false, Ordering::Release);
                    info!("{} worker stopped", kind);
                    on_exit(kind, exit);
                }),
            )
            .map_err(|source| {
                running.store(false, Ordering::Release);
                WorkerError::LaunchFailed { kind, source }
            })?;

        Ok(Self {
            kind,
            running,
            terminated: AtomicBool::new(false),
            stop: Box::new(stop),
            handle: Some(handle),
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    /// Is the engine still inside its run call?
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the engine to stop. Only the first call signals the engine.
    pub fn terminate(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("Terminating {} worker", self.kind);
        (self.stop)();
    }

    /// Wait for the worker thread to exit
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                // run_isolated catches engine panics; this is the exit callback
                error!("{} worker thread panicked", self.kind);
            }
        }
    }

    /// Terminate, then join
    pub fn shutdown(&mut self) {
        self.terminate();
        self.join();
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            warn!("{} worker dropped while still attached", self.kind);
            self.shutdown();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("kind", &self.kind)
            .field("running", &self.is_running())
            .finish()
    }
}

/// Run the engine inside a panic isolation boundary
fn run_isolated<R>(kind: WorkerKind, run: R) -> WorkerExit
where
    R: FnOnce() -> Result<(), EngineError>,
{
    match panic::catch_unwind(AssertUnwindSafe(run)) {
        Ok(Ok(())) => WorkerExit::Finished,
        Ok(Err(e)) => {
            warn!("{} engine exited with error: {}", kind, e);
            WorkerExit::Failed(e)
        }
        Err(panic_info) => {
            let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_info.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!("{} engine panicked: {}", kind, msg);
            WorkerExit::Panicked(msg)
        }
    }
}
