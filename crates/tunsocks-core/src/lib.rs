//! tunsocks - TUN-to-SOCKS5 VPN Session Orchestrator
//!
//! Derives a routing policy from a proxy profile, establishes a TUN device
//! through the host's VPN facility and supervises the two forwarding
//! engines that move traffic between the device and a local SOCKS5 proxy.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        TunnelSession                         │
//! │                                                              │
//! │  Profile ──▶ policy::build ──▶ RoutingPlan                   │
//! │                                    │                         │
//! │  NetworkTracker ──▶ Provisioner ◀──┘                         │
//! │  (host callback)        │ establish                          │
//! │                         ▼                                    │
//! │                 ProvisionedInterface (TUN fd)                │
//! │                    │                                         │
//! │        ┌───────────┴────────────┐                            │
//! │        ▼                        ▼                            │
//! │  tunnel Worker             dns Worker                        │
//! │  (TUN → socks5://…)        (127.0.0.1:5353 → socks5)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The host facilities (TUN provisioning, network-change notifications,
//! package lookup) and both engines are traits; the host implements them.

mod config;
mod engine;
mod error;
mod hosts;
mod network;
mod policy;
mod profile;
mod provision;
mod service;
mod session;
mod worker;

#[cfg(test)]
mod testing;

pub use config::{ConfigError, ConfigFormat, ServiceConfig, ServiceMode};
pub use engine::{
    DnsEngine, DnsEngineConfig, DnsStrategy, EngineError, TunnelEngine, TunnelEngineConfig,
    Verbosity, DNS_LISTEN_ADDR, DNS_TIMEOUT,
};
pub use error::{SessionError, UserAction};
pub use hosts::HostsFile;
pub use network::{
    underlying_networks, NetworkCallback, NetworkError, NetworkMonitor, NetworkTracker,
    UnderlyingNetwork,
};
pub use policy::{
    build as build_routing_plan, AppFilter, AppFilterMode, AssumeInstalled, PackageNotFound,
    PackageResolver, PolicyError, RoutingPlan, BYPASS_IPV6_ROUTE, BYPASS_PRIVATE_ROUTES,
    PRIVATE_VLAN4_CLIENT, PRIVATE_VLAN4_PREFIX_LENGTH, PRIVATE_VLAN6_CLIENT,
    PRIVATE_VLAN6_PREFIX_LENGTH, PRIVATE_VLAN6_ROUTER, VPN_MTU,
};
pub use profile::{Profile, RouteMode};
pub use provision::{
    HostCapabilities, InterfaceHost, InterfaceRequest, ProvisionedInterface, Provisioner,
    ProvisioningError, RawDescriptor, TunDevice,
};
pub use service::{HostLifecycle, SessionControl, StartOutcome, VpnService};
pub use session::{
    dns_engine_config, tunnel_engine_config, Collaborators, SessionEvent, SessionHandle,
    SessionState, StopReason, TunnelSession,
};
pub use worker::{
    NamedThreads, ThreadBody, ThreadSpawner, Worker, WorkerError, WorkerExit, WorkerKind,
};
