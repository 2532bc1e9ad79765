//! Network Identity Tracking
//!
//! Follows the host's preferred physical network so the TUN device can
//! report the right underlying network for its traffic.
//!
//! The host delivers change notifications on its own thread. The tracked
//! network lives in an `ArcSwapOption`: the callback swaps it in one store
//! and readers see either the old or the new value, never a torn one.

use crate::provision::HostCapabilities;
use arc_swap::ArcSwapOption;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Opaque handle to a host network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct UnderlyingNetwork(u64);

impl UnderlyingNetwork {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Host-assigned network id
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for UnderlyingNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "network#{}", self.0)
    }
}

/// Change callback; `None` means the host has no usable network
pub type NetworkCallback = Box<dyn Fn(Option<UnderlyingNetwork>) + Send + Sync>;

/// Host network-change facility
pub trait NetworkMonitor: Send + Sync {
    /// Register the single change callback for this session
    fn subscribe(&self, callback: NetworkCallback) -> Result<(), NetworkError>;

    /// Drop the registered callback
    fn unsubscribe(&self);
}

/// Network monitor errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    #[error("Network change subscription refused: {0}")]
    SubscribeFailed(String),
}

/// Underlying-network set to report for the TUN device.
///
/// `None` leaves the set unset. On hosts where clearing the set also
/// clears the metered classification, a metered session reports nothing so
/// the metered flag survives; routing-source selection is less accurate in
/// exchange.
pub fn underlying_networks(
    current: Option<UnderlyingNetwork>,
    metered: bool,
    capabilities: HostCapabilities,
) -> Option<Vec<UnderlyingNetwork>> {
    if capabilities.empty_networks_imply_metered && metered {
        None
    } else {
        current.map(|network| vec![network])
    }
}

/// Tracks the current underlying network for one session
pub struct NetworkTracker {
    monitor: Arc<dyn NetworkMonitor>,
    current: Arc<ArcSwapOption<UnderlyingNetwork>>,
    subscribed: AtomicBool,
}

impl NetworkTracker {
    pub fn new(monitor: Arc<dyn NetworkMonitor>) -> Self {
        Self {
            monitor,
            current: Arc::new(ArcSwapOption::empty()),
            subscribed: AtomicBool::new(false),
        }
    }

    /// Subscribe to host network changes.
    ///
    /// Every change is stored first and then handed to `on_change`. Calling
    /// this while already subscribed keeps the existing subscription.
    pub fn start<F>(&self, on_change: F) -> Result<(), NetworkError>
    where
        F: Fn(Option<UnderlyingNetwork>) + Send + Sync + 'static,
    {
        if self.subscribed.swap(true, Ordering::AcqRel) {
            debug!("Network tracker already running");
            return Ok(());
        }

        let current = self.current.clone();
        let callback: NetworkCallback = Box::new(move |network| {
            set_underlying_network(&current, network, &on_change);
        });

        if let Err(e) = self.monitor.subscribe(callback) {
            warn!("Network tracker failed to start: {}", e);
            self.subscribed.store(false, Ordering::Release);
            return Err(e);
        }

        info!("Network tracker started");
        Ok(())
    }

    /// Current underlying network, if any
    pub fn current_network(&self) -> Option<UnderlyingNetwork> {
        self.current.load().as_deref().copied()
    }

    pub fn is_running(&self) -> bool {
        self.subscribed.load(Ordering::Acquire)
    }

    /// Unsubscribe and forget the tracked network
    pub fn stop(&self) {
        if !self.subscribed.swap(false, Ordering::AcqRel) {
            return;
        }
        self.monitor.unsubscribe();
        self.current.store(None);
        info!("Network tracker stopped");
    }
}

impl Drop for NetworkTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Store the new network, then propagate it. Never blocks.
fn set_underlying_network(
    slot: &ArcSwapOption<UnderlyingNetwork>,
    network: Option<UnderlyingNetwork>,
    propagate: &dyn Fn(Option<UnderlyingNetwork>),
) {
    match network {
        Some(n) => debug!("Underlying network changed to {}", n),
        None => debug!("Underlying network lost"),
    }
    slot.store(network.map(Arc::new));
    propagate(network);
}
