//! Interface Provisioning
//!
//! Adapter between a [`RoutingPlan`] and the host facility that owns TUN
//! devices. The host allocates the descriptor and enforces routes and app
//! filters; we translate the plan into a request, hold the returned device
//! and forward live updates while it is established.

use crate::network::{self, UnderlyingNetwork};
use crate::policy::{AppFilter, RoutingPlan};
use ipnet::IpNet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Raw TUN file descriptor
pub type RawDescriptor = i32;

/// What the host networking facility supports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCapabilities {
    /// Host accepts an underlying-network set
    pub underlying_networks: bool,
    /// Host accepts a metered flag
    pub metered: bool,
    /// Clearing the underlying set makes the host treat the VPN as metered
    pub empty_networks_imply_metered: bool,
}

impl HostCapabilities {
    /// Capabilities of an Android host at the given API level
    pub fn android(api_level: u32) -> Self {
        Self {
            underlying_networks: api_level >= 22,
            metered: api_level >= 29,
            empty_networks_imply_metered: api_level == 28,
        }
    }

    /// Host with every live-update call available and no quirks
    pub fn full() -> Self {
        Self {
            underlying_networks: true,
            metered: true,
            empty_networks_imply_metered: false,
        }
    }
}

/// Everything the host needs to establish a TUN device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub session_name: String,
    pub mtu: u16,
    pub addresses: Vec<IpNet>,
    pub routes: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
    pub app_filter: Option<AppFilter>,
    /// `None` when the host has no metered support
    pub metered: Option<bool>,
    /// `None` leaves the set unset
    pub underlying_networks: Option<Vec<UnderlyingNetwork>>,
}

/// A TUN device handed out by the host
pub trait TunDevice: Send {
    fn fd(&self) -> RawDescriptor;

    /// Close the descriptor
    fn close(self: Box<Self>);
}

/// Host VPN facility
pub trait InterfaceHost: Send + Sync {
    fn capabilities(&self) -> HostCapabilities;

    /// Has the user granted VPN consent?
    fn consent_granted(&self) -> bool;

    /// Establish the device; `None` means the host produced no descriptor
    fn establish(&self, request: &InterfaceRequest) -> Option<Box<dyn TunDevice>>;

    fn set_underlying_networks(&self, networks: Option<&[UnderlyingNetwork]>);

    fn set_metered(&self, metered: bool);
}

/// Provisioning errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProvisioningError {
    /// VPN consent not granted; the user must go through the consent flow
    #[error("VPN permission has not been granted")]
    UserDenied,

    /// Host returned no descriptor; only a service restart recovers
    #[error("Failed to establish the VPN interface, a restart is required")]
    EstablishFailed,
}

/// Live TUN device owned by the session
///
/// The descriptor is closed exactly once, by [`release`](Self::release) or
/// on drop.
pub struct ProvisionedInterface {
    device: Option<Box<dyn TunDevice>>,
    fd: RawDescriptor,
    live: Arc<AtomicBool>,
}

impl ProvisionedInterface {
    pub fn fd(&self) -> RawDescriptor {
        self.fd
    }

    pub fn is_released(&self) -> bool {
        self.device.is_none()
    }

    /// Close the device. Later calls are no-ops.
    pub fn release(&mut self) {
        if let Some(device) = self.device.take() {
            self.live.store(false, Ordering::Release);
            device.close();
            info!("VPN interface released (fd {})", self.fd);
        }
    }
}

impl Drop for ProvisionedInterface {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for ProvisionedInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionedInterface")
            .field("fd", &self.fd)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Provisioner adapter
///
/// Shared between the session (establish) and the network tracker's
/// callback (live updates), so every method takes `&self`.
pub struct Provisioner {
    host: Arc<dyn InterfaceHost>,
    capabilities: HostCapabilities,
    /// Set once the host has returned a device, cleared on release
    live: Arc<AtomicBool>,
    metered: AtomicBool,
}

impl Provisioner {
    pub fn new(host: Arc<dyn InterfaceHost>) -> Self {
        let capabilities = host.capabilities();
        Self {
            host,
            capabilities,
            live: Arc::new(AtomicBool::new(false)),
            metered: AtomicBool::new(false),
        }
    }

    pub fn capabilities(&self) -> HostCapabilities {
        self.capabilities
    }

    /// Is a device currently established?
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    /// Host-side consent check
    pub fn consent_granted(&self) -> bool {
        self.host.consent_granted()
    }

    /// Translate a plan into a host request
    pub fn request(
        &self,
        plan: &RoutingPlan,
        current: Option<UnderlyingNetwork>,
    ) -> InterfaceRequest {
        let caps = self.capabilities;
        InterfaceRequest {
            session_name: plan.session_name.clone(),
            mtu: plan.mtu,
            addresses: plan.addresses(),
            routes: plan.routes.clone(),
            dns_servers: plan.dns_servers.clone(),
            app_filter: plan.app_filter.clone(),
            metered: caps.metered.then_some(plan.metered),
            underlying_networks: if caps.underlying_networks {
                network::underlying_networks(current, plan.metered, caps)
            } else {
                None
            },
        }
    }

    /// Establish the TUN device for `plan`
    pub fn establish(
        &self,
        plan: &RoutingPlan,
        current: Option<UnderlyingNetwork>,
    ) -> Result<ProvisionedInterface, ProvisioningError> {
        if self.is_live() {
            warn!("Establishing a VPN interface while another one is live");
        }
        if !self.host.consent_granted() {
            warn!("VPN consent not granted");
            return Err(ProvisioningError::UserDenied);
        }

        let request = self.request(plan, current);
        self.metered.store(plan.metered, Ordering::Release);

        let Some(device) = self.host.establish(&request) else {
            error!("Host returned no descriptor for {}", request.session_name);
            return Err(ProvisioningError::EstablishFailed);
        };

        let fd = device.fd();
        self.live.store(true, Ordering::Release);
        info!(
            "VPN interface established (fd {}, {} routes, mtu {})",
            fd,
            request.routes.len(),
            request.mtu
        );

        Ok(ProvisionedInterface {
            device: Some(device),
            fd,
            live: self.live.clone(),
        })
    }

    /// Report a new underlying-network set. No-op unless a device is live.
    pub fn update_underlying_networks(&self, networks: Option<&[UnderlyingNetwork]>) {
        if !self.is_live() || !self.capabilities.underlying_networks {
            return;
        }
        debug!("Updating underlying networks: {:?}", networks);
        self.host.set_underlying_networks(networks);
    }

    /// Change the metered flag. No-op unless a device is live.
    pub fn update_metered(&self, metered: bool) {
        self.metered.store(metered, Ordering::Release);
        if !self.is_live() || !self.capabilities.metered {
            return;
        }
        debug!("Updating metered flag: {}", metered);
        self.host.set_metered(metered);
    }

    /// Propagate a network change into the live device
    pub fn on_network_changed(&self, current: Option<UnderlyingNetwork>) {
        let metered = self.metered.load(Ordering::Acquire);
        let networks = network::underlying_networks(current, metered, self.capabilities);
        self.update_underlying_networks(networks.as_deref());
    }
}
