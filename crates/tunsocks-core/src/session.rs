//! Tunnel Session
//!
//! Owns one activation of the VPN: the routing plan, the TUN device, the
//! network tracker subscription and both forwarding workers.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──start──▶ Starting ──▶ Active ──stop / revoke / worker exit──▶ Stopping ──▶ Idle
//!                    │                                                    ▲
//!                    └──────────────── any start failure ─────────────────┘
//! ```
//!
//! Start order: plan → network tracker → TUN device → packet worker → DNS
//! worker. Teardown runs in reverse: both workers are stopped and joined,
//! then the device is released, then the tracker unsubscribes. The engines
//! use the descriptor until they return, so the device must outlive them.
//!
//! A session instance is single-use: once it is back in `Idle` after a
//! start, create a new one for the next activation.

use crate::config::ServiceConfig;
use crate::engine::{
    DnsEngine, DnsEngineConfig, DnsStrategy, TunnelEngine, TunnelEngineConfig, Verbosity,
    DNS_LISTEN_ADDR, DNS_TIMEOUT,
};
use crate::error::SessionError;
use crate::hosts::HostsFile;
use crate::network::{NetworkMonitor, NetworkTracker};
use crate::policy::{self, PackageResolver, RoutingPlan};
use crate::profile::Profile;
use crate::provision::{InterfaceHost, ProvisionedInterface, Provisioner, RawDescriptor};
use crate::worker::{NamedThreads, ThreadSpawner, Worker, WorkerExit, WorkerKind};
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Nothing acquired
    Idle,
    /// Acquiring resources
    Starting,
    /// Device established, both workers launched
    Active,
    /// Releasing resources
    Stopping,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    fn to_u8(self) -> u8 {
        match self {
            SessionState::Idle => 0,
            SessionState::Starting => 1,
            SessionState::Active => 2,
            SessionState::Stopping => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Starting,
            2 => SessionState::Active,
            3 => SessionState::Stopping,
            _ => SessionState::Idle,
        }
    }
}

/// Session state readable from other threads
#[derive(Debug, Clone)]
struct PublishedState(Arc<AtomicU8>);

impl PublishedState {
    fn new() -> Self {
        Self(Arc::new(AtomicU8::new(SessionState::Idle.to_u8())))
    }

    fn load(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::Acquire))
    }

    fn store(&self, state: SessionState) {
        self.0.store(state.to_u8(), Ordering::Release);
    }
}

/// Host-side collaborators a session drives
#[derive(Clone)]
pub struct Collaborators {
    pub host: Arc<dyn InterfaceHost>,
    pub monitor: Arc<dyn NetworkMonitor>,
    pub packages: Arc<dyn PackageResolver>,
    pub tunnel_engine: Arc<dyn TunnelEngine>,
    pub dns_engine: Arc<dyn DnsEngine>,
}

/// Events delivered to a supervised session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    WorkerExited { kind: WorkerKind, exit: WorkerExit },
    /// Host withdrew VPN consent
    Revoked,
    StopRequested,
    /// Metered classification changed; the session keeps running
    MeteredChanged(bool),
}

/// Why a supervised session stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    Revoked,
    WorkerExited { kind: WorkerKind, exit: WorkerExit },
}

/// Cloneable handle for posting events from any thread
#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: Sender<SessionEvent>,
    state: PublishedState,
}

impl SessionHandle {
    /// VPN consent was revoked out-of-band
    pub fn revoke(&self) {
        let _ = self.events.send(SessionEvent::Revoked);
    }

    pub fn request_stop(&self) {
        let _ = self.events.send(SessionEvent::StopRequested);
    }

    /// Applied by the supervising thread without stopping the session
    pub fn set_metered(&self, metered: bool) {
        let _ = self.events.send(SessionEvent::MeteredChanged(metered));
    }

    /// Last state the session published
    pub fn state(&self) -> SessionState {
        self.state.load()
    }
}

/// Launch parameters for the packet engine
pub fn tunnel_engine_config(
    config: &ServiceConfig,
    profile: &Profile,
    plan: &RoutingPlan,
    tun_fd: RawDescriptor,
) -> TunnelEngineConfig {
    TunnelEngineConfig {
        proxy_url: config.proxy_url(),
        tun_fd,
        tun_mtu: plan.mtu,
        verbosity: Verbosity::from_debug(config.debug),
        dns_strategy: if profile.over_tls {
            DnsStrategy::OverTcp
        } else {
            DnsStrategy::Direct
        },
    }
}

/// Launch parameters for the DNS engine
pub fn dns_engine_config(config: &ServiceConfig, plan: &RoutingPlan, hosts: &HostsFile) -> DnsEngineConfig {
    DnsEngineConfig {
        listen_addr: DNS_LISTEN_ADDR,
        upstream: hosts.resolve_endpoint(&plan.upstream_dns),
        socks5_server: config.socks5_server(),
        username: None,
        password: None,
        force_tcp: true,
        cache_records: false,
        verbosity: Verbosity::from_debug(config.debug),
        timeout: DNS_TIMEOUT,
    }
}

/// Posts a worker's exit into the session event queue
fn exit_reporter(events: Sender<SessionEvent>) -> impl FnOnce(WorkerKind, WorkerExit) + Send + 'static {
    move |kind, exit| {
        let _ = events.send(SessionEvent::WorkerExited { kind, exit });
    }
}

/// One VPN activation
pub struct TunnelSession {
    config: ServiceConfig,
    profile: Profile,
    packages: Arc<dyn PackageResolver>,
    tunnel_engine: Arc<dyn TunnelEngine>,
    dns_engine: Arc<dyn DnsEngine>,
    tracker: NetworkTracker,
    provisioner: Arc<Provisioner>,
    spawner: Arc<dyn ThreadSpawner>,
    state: SessionState,
    published: PublishedState,
    /// `start` has been called on this instance
    used: bool,
    plan: Option<RoutingPlan>,
    interface: Option<ProvisionedInterface>,
    tunnel_worker: Option<Worker>,
    dns_worker: Option<Worker>,
    events_tx: Sender<SessionEvent>,
    events_rx: Receiver<SessionEvent>,
}

impl TunnelSession {
    pub fn new(config: ServiceConfig, profile: Profile, collaborators: Collaborators) -> Self {
        let (events_tx, events_rx) = unbounded();

        Self {
            config,
            profile,
            packages: collaborators.packages,
            tunnel_engine: collaborators.tunnel_engine,
            dns_engine: collaborators.dns_engine,
            tracker: NetworkTracker::new(collaborators.monitor),
            provisioner: Arc::new(Provisioner::new(collaborators.host)),
            spawner: Arc::new(NamedThreads),
            state: SessionState::Idle,
            published: PublishedState::new(),
            used: false,
            plan: None,
            interface: None,
            tunnel_worker: None,
            dns_worker: None,
            events_tx,
            events_rx,
        }
    }

    /// Start worker threads through `spawner`
    pub fn with_spawner(mut self, spawner: Arc<dyn ThreadSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Routing plan of the running session
    pub fn plan(&self) -> Option<&RoutingPlan> {
        self.plan.as_ref()
    }

    /// Descriptor of the established TUN device
    pub fn interface_fd(&self) -> Option<RawDescriptor> {
        self.interface.as_ref().map(ProvisionedInterface::fd)
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            events: self.events_tx.clone(),
            state: self.published.clone(),
        }
    }

    /// Subscribe to network changes ahead of `start`.
    ///
    /// Lets the tracker learn the current network before the device is
    /// established. `start` subscribes on its own if this was skipped.
    pub fn pre_init(&mut self) -> Result<(), SessionError> {
        let provisioner = self.provisioner.clone();
        self.tracker
            .start(move |network| provisioner.on_network_changed(network))?;
        Ok(())
    }

    /// Start the session.
    ///
    /// On failure every resource acquired so far is released and the
    /// session is back in `Idle` before the error is returned.
    pub fn start(&mut self, hosts: &HostsFile) -> Result<(), SessionError> {
        if self.state != SessionState::Idle {
            return Err(SessionError::InvalidState(self.state));
        }
        if self.used {
            return Err(SessionError::SessionFinished);
        }
        self.used = true;

        info!("Starting VPN session {}", self.profile.formatted_name());
        self.set_state(SessionState::Starting);

        match self.start_inner(hosts) {
            Ok(()) => {
                self.set_state(SessionState::Active);
                info!("VPN session active");
                Ok(())
            }
            Err(e) => {
                error!("VPN session failed to start: {}", e);
                self.teardown();
                Err(e)
            }
        }
    }

    fn start_inner(&mut self, hosts: &HostsFile) -> Result<(), SessionError> {
        self.config.validate()?;
        let local_dns = self.config.local_dns()?;
        let plan = policy::build(
            &self.profile,
            local_dns,
            &self.config.package_id,
            self.packages.as_ref(),
        )?;

        self.pre_init()?;

        let current = self.tracker.current_network();
        let interface = self.provisioner.establish(&plan, current)?;
        let tun_fd = interface.fd();
        self.interface = Some(interface);

        // Changes that arrived before the device went live were not propagated
        let latest = self.tracker.current_network();
        if latest != current {
            self.provisioner.on_network_changed(latest);
        }

        let tunnel_config = tunnel_engine_config(&self.config, &self.profile, &plan, tun_fd);
        debug!("Packet engine config: {:?}", tunnel_config);
        self.launch_tunnel(tunnel_config)?;

        let dns_config = dns_engine_config(&self.config, &plan, hosts);
        debug!("DNS engine config: {:?}", dns_config);
        self.launch_dns(dns_config)?;

        self.plan = Some(plan);
        Ok(())
    }

    fn launch_tunnel(&mut self, config: TunnelEngineConfig) -> Result<(), SessionError> {
        let engine = self.tunnel_engine.clone();
        let stopper = self.tunnel_engine.clone();
        let worker = Worker::spawn_on(
            self.spawner.as_ref(),
            WorkerKind::Tunnel,
            move || engine.run(&config),
            move || stopper.stop(),
            exit_reporter(self.events_tx.clone()),
        )?;
        self.tunnel_worker = Some(worker);
        Ok(())
    }

    fn launch_dns(&mut self, config: DnsEngineConfig) -> Result<(), SessionError> {
        let engine = self.dns_engine.clone();
        let stopper = self.dns_engine.clone();
        let worker = Worker::spawn_on(
            self.spawner.as_ref(),
            WorkerKind::Dns,
            move || engine.start(&config),
            move || stopper.stop(),
            exit_reporter(self.events_tx.clone()),
        )?;
        self.dns_worker = Some(worker);
        Ok(())
    }

    /// Stop the session. Safe to call in any state; a stopped session
    /// stays `Idle`.
    pub fn stop(&mut self) {
        if self.state == SessionState::Idle && !self.holds_resources() {
            debug!("VPN session already stopped");
            return;
        }
        info!("Stopping VPN session");
        self.teardown();
    }

    /// Host revoked VPN consent; same as `stop`
    pub fn on_revoke(&mut self) {
        info!("VPN consent revoked");
        self.stop();
    }

    /// Change the metered classification of the live device.
    ///
    /// The reported underlying-network set is recomputed as well, since on
    /// some hosts it depends on the metered flag.
    pub fn set_metered(&mut self, metered: bool) {
        if let Some(plan) = self.plan.as_mut() {
            plan.metered = metered;
        }
        self.provisioner.update_metered(metered);
        self.provisioner
            .on_network_changed(self.tracker.current_network());
    }

    /// Block until something ends the session, then tear it down.
    ///
    /// Non-terminal events are applied along the way. Returns `None` right
    /// away if the session is not active.
    pub fn supervise(&mut self) -> Option<StopReason> {
        while self.state.is_active() {
            let event = self
                .events_rx
                .recv()
                .unwrap_or(SessionEvent::StopRequested);
            if let Some(reason) = self.apply(event) {
                return self.finish(reason);
            }
        }
        None
    }

    /// Non-blocking variant of [`supervise`](Self::supervise)
    pub fn try_supervise(&mut self) -> Option<StopReason> {
        while self.state.is_active() {
            let event = match self.events_rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => SessionEvent::StopRequested,
            };
            if let Some(reason) = self.apply(event) {
                return self.finish(reason);
            }
        }
        None
    }

    /// Apply `event`; returns why the session must stop, if it must
    fn apply(&mut self, event: SessionEvent) -> Option<StopReason> {
        match event {
            SessionEvent::MeteredChanged(metered) => {
                self.set_metered(metered);
                None
            }
            SessionEvent::WorkerExited { kind, exit } => Some(StopReason::WorkerExited { kind, exit }),
            SessionEvent::Revoked => Some(StopReason::Revoked),
            SessionEvent::StopRequested => Some(StopReason::Requested),
        }
    }

    fn finish(&mut self, reason: StopReason) -> Option<StopReason> {
        match &reason {
            StopReason::WorkerExited { kind, exit } if exit.is_failure() => {
                error!("{} worker failed ({:?}), stopping session", kind, exit);
            }
            StopReason::WorkerExited { kind, .. } => {
                warn!("{} worker exited, stopping session", kind);
            }
            StopReason::Revoked => info!("VPN consent revoked"),
            StopReason::Requested => info!("Stop requested"),
        }
        self.stop();
        Some(reason)
    }

    fn holds_resources(&self) -> bool {
        self.tunnel_worker.is_some()
            || self.dns_worker.is_some()
            || self.interface.is_some()
            || self.tracker.is_running()
    }

    /// Release everything in reverse start order
    fn teardown(&mut self) {
        self.set_state(SessionState::Stopping);

        if let Some(worker) = &self.dns_worker {
            worker.terminate();
        }
        if let Some(worker) = &self.tunnel_worker {
            worker.terminate();
        }
        if let Some(mut worker) = self.dns_worker.take() {
            worker.join();
        }
        if let Some(mut worker) = self.tunnel_worker.take() {
            worker.join();
        }

        if let Some(mut interface) = self.interface.take() {
            interface.release();
        }

        self.tracker.stop();
        self.plan = None;

        for event in self.events_rx.try_iter() {
            debug!("Discarding session event after teardown: {:?}", event);
        }

        self.set_state(SessionState::Idle);
        info!("VPN session stopped");
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.published.store(state);
        }
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        self.stop();
    }
}
