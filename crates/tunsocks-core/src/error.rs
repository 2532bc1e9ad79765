//! Session-level error type.
//!
//! Every failure a session can hit while starting, grouped so callers can
//! decide what to show the user.

use crate::config::ConfigError;
use crate::network::NetworkError;
use crate::policy::PolicyError;
use crate::provision::ProvisioningError;
use crate::session::SessionState;
use crate::worker::WorkerError;
use thiserror::Error;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// Service configuration is unusable
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Routing plan could not be built
    #[error("Routing policy error: {0}")]
    Policy(#[from] PolicyError),

    /// TUN device could not be established
    #[error("Provisioning error: {0}")]
    Provisioning(#[from] ProvisioningError),

    /// A forwarding worker could not be launched
    #[error("Worker error: {0}")]
    WorkerLaunch(#[from] WorkerError),

    /// Network change subscription failed
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Start requested outside `Idle`
    #[error("Session is {0:?}, expected Idle")]
    InvalidState(SessionState),

    /// This session instance already ran; create a new one
    #[error("Session already finished")]
    SessionFinished,

    /// The thread supervising an active session could not be launched
    #[error("Failed to launch session supervisor: {0}")]
    SupervisorLaunch(#[source] std::io::Error),
}

/// What the user has to do after a failed start
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserAction {
    /// Nothing beyond reading the error
    None,
    /// Show the VPN consent screen
    RequestConsent,
    /// Restart the service
    RestartRequired,
}

impl SessionError {
    /// Classify for the user-facing layer
    #[must_use]
    pub fn user_action(&self) -> UserAction {
        match self {
            Self::Provisioning(ProvisioningError::UserDenied) => UserAction::RequestConsent,
            Self::Provisioning(ProvisioningError::EstablishFailed)
            | Self::WorkerLaunch(_)
            | Self::SupervisorLaunch(_) => UserAction::RestartRequired,
            _ => UserAction::None,
        }
    }

    /// Can the caller simply try again?
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Provisioning(ProvisioningError::UserDenied) | Self::Network(_)
        )
    }
}
