//! Instrumented fakes for the host collaborators.
//!
//! Every fake writes into a shared [`Journal`] so tests can assert the
//! order of calls across threads.

use crate::engine::{DnsEngine, DnsEngineConfig, EngineError, TunnelEngine, TunnelEngineConfig};
use crate::network::{NetworkCallback, NetworkError, NetworkMonitor, UnderlyingNetwork};
use crate::policy::{PackageNotFound, PackageResolver};
use crate::provision::{
    HostCapabilities, InterfaceHost, InterfaceRequest, RawDescriptor, TunDevice,
};
use crate::session::Collaborators;
use crate::worker::{NamedThreads, ThreadBody, ThreadSpawner};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Ordered record of calls
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: &str) {
        self.entries.lock().unwrap().push(entry.to_string());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().unwrap().clone()
    }

    pub fn count(&self, entry: &str) -> usize {
        self.entries.lock().unwrap().iter().filter(|e| *e == entry).count()
    }

    /// Index of the first occurrence
    pub fn position(&self, entry: &str) -> Option<usize> {
        self.entries.lock().unwrap().iter().position(|e| e == entry)
    }
}

pub struct FakeTun {
    fd: RawDescriptor,
    journal: Journal,
}

impl TunDevice for FakeTun {
    fn fd(&self) -> RawDescriptor {
        self.fd
    }

    fn close(self: Box<Self>) {
        self.journal.record("close_tun");
    }
}

pub struct FakeHost {
    journal: Journal,
    capabilities: HostCapabilities,
    consent: AtomicBool,
    establish_ok: AtomicBool,
    requests: Mutex<Vec<InterfaceRequest>>,
    underlying: Mutex<Vec<Option<Vec<UnderlyingNetwork>>>>,
    during_establish: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FakeHost {
    pub const TUN_FD: RawDescriptor = 37;

    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            capabilities: HostCapabilities::full(),
            consent: AtomicBool::new(true),
            establish_ok: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
            underlying: Mutex::new(Vec::new()),
            during_establish: Mutex::new(None),
        }
    }

    pub fn with_capabilities(mut self, capabilities: HostCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn deny_consent(&self) {
        self.consent.store(false, Ordering::SeqCst);
    }

    /// Make `establish` return no descriptor
    pub fn fail_establish(&self) {
        self.establish_ok.store(false, Ordering::SeqCst);
    }

    /// Run `hook` inside the next `establish`, before the device is returned
    pub fn during_establish(&self, hook: impl FnOnce() + Send + 'static) {
        *self.during_establish.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn last_request(&self) -> Option<InterfaceRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn underlying_updates(&self) -> Vec<Option<Vec<UnderlyingNetwork>>> {
        self.underlying.lock().unwrap().clone()
    }
}

impl InterfaceHost for FakeHost {
    fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    fn consent_granted(&self) -> bool {
        self.consent.load(Ordering::SeqCst)
    }

    fn establish(&self, request: &InterfaceRequest) -> Option<Box<dyn TunDevice>> {
        self.journal.record("establish");
        self.requests.lock().unwrap().push(request.clone());
        let hook = self.during_establish.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        if !self.establish_ok.load(Ordering::SeqCst) {
            return None;
        }
        Some(Box::new(FakeTun {
            fd: Self::TUN_FD,
            journal: self.journal.clone(),
        }))
    }

    fn set_underlying_networks(&self, networks: Option<&[UnderlyingNetwork]>) {
        self.journal.record("set_underlying_networks");
        self.underlying
            .lock()
            .unwrap()
            .push(networks.map(<[UnderlyingNetwork]>::to_vec));
    }

    fn set_metered(&self, _metered: bool) {
        self.journal.record("set_metered");
    }
}

type SharedCallback = Arc<dyn Fn(Option<UnderlyingNetwork>) + Send + Sync>;

pub struct FakeMonitor {
    journal: Journal,
    callback: Mutex<Option<SharedCallback>>,
    subscriptions: AtomicUsize,
    refuse: AtomicBool,
}

impl FakeMonitor {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            callback: Mutex::new(None),
            subscriptions: AtomicUsize::new(0),
            refuse: AtomicBool::new(false),
        }
    }

    /// Deliver a network change to the subscriber, if any
    pub fn fire(&self, network: Option<UnderlyingNetwork>) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(network);
        }
    }

    pub fn refuse_subscriptions(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.callback.lock().unwrap().is_some()
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }
}

impl NetworkMonitor for FakeMonitor {
    fn subscribe(&self, callback: NetworkCallback) -> Result<(), NetworkError> {
        if self.refuse.load(Ordering::SeqCst) {
            return Err(NetworkError::SubscribeFailed("refused".to_string()));
        }
        self.journal.record("subscribe");
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.callback.lock().unwrap() = Some(Arc::from(callback));
        Ok(())
    }

    fn unsubscribe(&self) {
        self.journal.record("unsubscribe");
        *self.callback.lock().unwrap() = None;
    }
}

/// Resolver with a fixed set of installed packages
pub struct FakePackages {
    installed: HashSet<String>,
}

impl FakePackages {
    pub fn installed(packages: &[&str]) -> Self {
        Self {
            installed: packages.iter().map(|p| p.to_string()).collect(),
        }
    }
}

impl PackageResolver for FakePackages {
    fn check(&self, package: &str) -> Result<(), PackageNotFound> {
        if self.installed.contains(package) {
            Ok(())
        } else {
            Err(PackageNotFound(package.to_string()))
        }
    }
}

/// Spawner that refuses one thread name and starts the rest
pub struct FailingSpawner {
    refuse: &'static str,
}

impl FailingSpawner {
    pub fn refusing(thread_name: &'static str) -> Self {
        Self {
            refuse: thread_name,
        }
    }
}

impl ThreadSpawner for FailingSpawner {
    fn spawn(&self, name: &str, body: ThreadBody) -> std::io::Result<thread::JoinHandle<()>> {
        if name == self.refuse {
            return Err(std::io::Error::other("thread limit reached"));
        }
        NamedThreads.spawn(name, body)
    }
}

/// Engine that blocks until stopped or crashed
pub struct FakeEngine<C> {
    name: &'static str,
    journal: Journal,
    configs: Mutex<Vec<C>>,
    /// A crash already ended the run; the teardown stop finds nothing to stop
    crashed: AtomicBool,
    exit_tx: Sender<Result<(), EngineError>>,
    exit_rx: Receiver<Result<(), EngineError>>,
}

pub type FakeTunnelEngine = FakeEngine<TunnelEngineConfig>;
pub type FakeDnsEngine = FakeEngine<DnsEngineConfig>;

impl<C: Clone> FakeEngine<C> {
    pub fn new(name: &'static str, journal: Journal) -> Self {
        let (exit_tx, exit_rx) = bounded(1);
        Self {
            name,
            journal,
            configs: Mutex::new(Vec::new()),
            crashed: AtomicBool::new(false),
            exit_tx,
            exit_rx,
        }
    }

    /// Configs of every run so far
    pub fn configs(&self) -> Vec<C> {
        self.configs.lock().unwrap().clone()
    }

    /// Make the running engine exit with an error
    pub fn crash(&self, error: EngineError) {
        self.crashed.store(true, Ordering::SeqCst);
        let _ = self.exit_tx.try_send(Err(error));
    }

    fn serve(&self, config: &C) -> Result<(), EngineError> {
        self.journal.record(&format!("{}_run", self.name));
        self.configs.lock().unwrap().push(config.clone());
        let result = self.exit_rx.recv().unwrap_or(Ok(()));
        self.journal.record(&format!("{}_exit", self.name));
        result
    }

    fn signal_stop(&self) {
        self.journal.record(&format!("{}_stop", self.name));
        if !self.crashed.swap(false, Ordering::SeqCst) {
            let _ = self.exit_tx.try_send(Ok(()));
        }
    }
}

impl TunnelEngine for FakeTunnelEngine {
    fn run(&self, config: &TunnelEngineConfig) -> Result<(), EngineError> {
        self.serve(config)
    }

    fn stop(&self) {
        self.signal_stop();
    }
}

impl DnsEngine for FakeDnsEngine {
    fn start(&self, config: &DnsEngineConfig) -> Result<(), EngineError> {
        self.serve(config)
    }

    fn stop(&self) {
        self.signal_stop();
    }
}

/// One full set of fakes sharing a journal
pub struct Fakes {
    pub journal: Journal,
    pub host: Arc<FakeHost>,
    pub monitor: Arc<FakeMonitor>,
    pub packages: Arc<FakePackages>,
    pub tunnel: Arc<FakeTunnelEngine>,
    pub dns: Arc<FakeDnsEngine>,
}

impl Fakes {
    pub fn new() -> Self {
        Self::with_capabilities(HostCapabilities::full())
    }

    pub fn with_capabilities(capabilities: HostCapabilities) -> Self {
        let journal = Journal::new();
        Self {
            host: Arc::new(FakeHost::new(journal.clone()).with_capabilities(capabilities)),
            monitor: Arc::new(FakeMonitor::new(journal.clone())),
            packages: Arc::new(FakePackages::installed(&[])),
            tunnel: Arc::new(FakeEngine::new("tunnel", journal.clone())),
            dns: Arc::new(FakeEngine::new("dns", journal.clone())),
            journal,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            host: self.host.clone(),
            monitor: self.monitor.clone(),
            packages: self.packages.clone(),
            tunnel_engine: self.tunnel.clone(),
            dns_engine: self.dns.clone(),
        }
    }
}
