//! VPN Service
//!
//! The object the host talks to. It plays two roles, each behind its own
//! trait so callers pick one explicitly:
//!
//! - [`HostLifecycle`]: start commands, consent revocation and destruction
//!   delivered by the host.
//! - [`SessionControl`]: the generic start/stop interface shared with the
//!   other service modes.
//!
//! Each activation gets a fresh [`TunnelSession`]. Once started, the session
//! moves to a `session-supervisor` thread that waits for its first stop
//! event (worker exit, revoke, stop request) and tears it down there, off
//! the host's notification threads.

use crate::config::{ServiceConfig, ServiceMode};
use crate::error::{SessionError, UserAction};
use crate::hosts::HostsFile;
use crate::policy::RoutingPlan;
use crate::profile::Profile;
use crate::session::{Collaborators, SessionHandle, SessionState, StopReason, TunnelSession};
use std::thread;
use tracing::{debug, error, info, warn};

/// Generic start/stop interface
pub trait SessionControl {
    fn start(&mut self, hosts: &HostsFile) -> Result<(), SessionError>;

    /// Idempotent
    fn stop(&mut self);

    fn state(&self) -> SessionState;
}

/// Callbacks delivered by the host
pub trait HostLifecycle {
    /// Host asked the service to run
    fn on_start_command(&mut self, hosts: &HostsFile) -> StartOutcome;

    /// Host revoked VPN consent
    fn on_revoke(&mut self);

    /// Host is destroying the service
    fn on_destroy(&mut self);
}

/// Result of a start command, as the user-facing layer needs it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Session is active (freshly started or already running)
    Started,
    /// Show the VPN consent screen; the service stays stopped
    RequestConsent,
    /// Report that a service restart is required
    RestartRequired,
    /// Service stopped; the host should not restart it on its own
    NotSticky,
}

impl SessionControl for TunnelSession {
    fn start(&mut self, hosts: &HostsFile) -> Result<(), SessionError> {
        TunnelSession::start(self, hosts)
    }

    fn stop(&mut self) {
        TunnelSession::stop(self)
    }

    fn state(&self) -> SessionState {
        TunnelSession::state(self)
    }
}

/// Active session owned by its supervising thread
struct RunningSession {
    handle: SessionHandle,
    plan: Option<RoutingPlan>,
    supervisor: Option<thread::JoinHandle<Option<StopReason>>>,
}

impl RunningSession {
    fn launch(mut session: TunnelSession) -> Result<Self, SessionError> {
        let handle = session.handle();
        let plan = session.plan().cloned();

        // On spawn failure the closure is dropped and the session with it
        let supervisor = thread::Builder::new()
            .name("session-supervisor".to_string())
            .spawn(move || {
                debug!("Session supervisor started");
                let reason = session.supervise();
                debug!("Session supervisor stopped");
                reason
            })
            .map_err(SessionError::SupervisorLaunch)?;

        Ok(Self {
            handle,
            plan,
            supervisor: Some(supervisor),
        })
    }

    fn state(&self) -> SessionState {
        self.handle.state()
    }

    fn is_finished(&self) -> bool {
        self.supervisor
            .as_ref()
            .map_or(true, thread::JoinHandle::is_finished)
    }

    /// Wait for the supervisor to tear the session down
    fn join(&mut self) -> Option<StopReason> {
        let supervisor = self.supervisor.take()?;
        match supervisor.join() {
            Ok(reason) => reason,
            Err(_) => {
                error!("Session supervisor panicked");
                None
            }
        }
    }
}

/// VPN service
pub struct VpnService {
    config: ServiceConfig,
    profile: Profile,
    collaborators: Collaborators,
    running: Option<RunningSession>,
}

impl VpnService {
    pub fn new(config: ServiceConfig, profile: Profile, collaborators: Collaborators) -> Self {
        Self {
            config,
            profile,
            collaborators,
            running: None,
        }
    }

    /// Profile used by the next activation
    pub fn set_profile(&mut self, profile: Profile) {
        self.profile = profile;
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Routing plan of the active session
    pub fn plan(&self) -> Option<&RoutingPlan> {
        self.running
            .as_ref()
            .filter(|running| running.state().is_active())
            .and_then(|running| running.plan.as_ref())
    }

    /// Event handle of the current session
    pub fn session_handle(&self) -> Option<SessionHandle> {
        self.running.as_ref().map(|running| running.handle.clone())
    }

    /// Change the metered classification.
    ///
    /// Applied live to the active session and kept for later activations.
    pub fn set_metered(&mut self, metered: bool) {
        self.profile.metered = metered;
        if let Some(running) = &self.running {
            running.handle.set_metered(metered);
        }
    }

    /// Block until the current session ends and return why it ended
    pub fn wait(&mut self) -> Option<StopReason> {
        let mut running = self.running.take()?;
        let reason = running.join();
        log_stop(reason.as_ref());
        reason
    }

    /// Collect a session whose supervisor already finished
    fn reap(&mut self) {
        if self.running.as_ref().is_some_and(RunningSession::is_finished) {
            self.wait();
        }
    }
}

fn log_stop(reason: Option<&StopReason>) {
    match reason {
        Some(StopReason::WorkerExited { kind, exit }) if exit.is_failure() => {
            warn!("VPN session ended: {} worker failed ({:?})", kind, exit)
        }
        Some(reason) => info!("VPN session ended: {:?}", reason),
        None => debug!("VPN session ended"),
    }
}

impl SessionControl for VpnService {
    fn start(&mut self, hosts: &HostsFile) -> Result<(), SessionError> {
        self.reap();
        if let Some(running) = &self.running {
            return Err(SessionError::InvalidState(running.state()));
        }

        let mut session = TunnelSession::new(
            self.config.clone(),
            self.profile.clone(),
            self.collaborators.clone(),
        );
        session.pre_init()?;
        session.start(hosts)?;
        self.running = Some(RunningSession::launch(session)?);
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(running) = &self.running {
            running.handle.request_stop();
        }
        self.wait();
    }

    fn state(&self) -> SessionState {
        self.running
            .as_ref()
            .map(RunningSession::state)
            .unwrap_or(SessionState::Idle)
    }
}

impl HostLifecycle for VpnService {
    fn on_start_command(&mut self, hosts: &HostsFile) -> StartOutcome {
        if self.config.service_mode != ServiceMode::Vpn {
            info!("Service mode is {:?}, not starting VPN", self.config.service_mode);
            SessionControl::stop(self);
            return StartOutcome::NotSticky;
        }

        self.reap();
        if SessionControl::state(self) != SessionState::Idle {
            debug!("VPN session already running");
            return StartOutcome::Started;
        }

        if !self.collaborators.host.consent_granted() {
            warn!("VPN consent missing, requesting it");
            return StartOutcome::RequestConsent;
        }

        match SessionControl::start(self, hosts) {
            Ok(()) => StartOutcome::Started,
            Err(e) => {
                error!("Failed to start VPN service: {}", e);
                SessionControl::stop(self);
                match e.user_action() {
                    UserAction::RequestConsent => StartOutcome::RequestConsent,
                    UserAction::RestartRequired => StartOutcome::RestartRequired,
                    UserAction::None => StartOutcome::NotSticky,
                }
            }
        }
    }

    fn on_revoke(&mut self) {
        if let Some(running) = &self.running {
            running.handle.revoke();
        }
        self.wait();
    }

    fn on_destroy(&mut self) {
        SessionControl::stop(self);
        info!("VPN service destroyed");
    }
}

impl Drop for VpnService {
    fn drop(&mut self) {
        SessionControl::stop(self);
    }
}
