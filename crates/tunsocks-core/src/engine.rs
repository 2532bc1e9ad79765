//! Forwarding Engines
//!
//! The packet engine (TUN → SOCKS5) and the DNS engine (local DNS → SOCKS5)
//! are native black boxes. We only see their launch parameters, a blocking
//! run call and a process-wide stop signal.

use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::provision::RawDescriptor;

/// Local listen address of the DNS forwarder
pub const DNS_LISTEN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 5353);

/// Upstream query timeout of the DNS forwarder
pub const DNS_TIMEOUT: Duration = Duration::from_secs(10);

/// Engine log verbosity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Verbosity {
    Info,
    Debug,
}

impl Verbosity {
    pub fn from_debug(debug: bool) -> Self {
        if debug { Verbosity::Debug } else { Verbosity::Info }
    }

    /// Numeric level understood by both engines
    pub fn level(&self) -> u8 {
        match self {
            Verbosity::Info => 3,
            Verbosity::Debug => 5,
        }
    }
}

/// How the packet engine handles DNS queries it sees on the TUN device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DnsStrategy {
    /// Carry queries over TCP through the proxy
    OverTcp,
    /// Forward queries as UDP
    Direct,
}

impl DnsStrategy {
    /// Engine wire value
    pub fn code(&self) -> u8 {
        match self {
            DnsStrategy::OverTcp => 1,
            DnsStrategy::Direct => 2,
        }
    }
}

/// Launch parameters of the packet engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelEngineConfig {
    /// `socks5://host:port`
    pub proxy_url: String,
    pub tun_fd: RawDescriptor,
    pub tun_mtu: u16,
    pub verbosity: Verbosity,
    pub dns_strategy: DnsStrategy,
}

/// Launch parameters of the DNS engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DnsEngineConfig {
    pub listen_addr: SocketAddr,
    /// Upstream DNS server, `host:port`
    pub upstream: String,
    /// SOCKS5 server, `host:port`
    pub socks5_server: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub force_tcp: bool,
    pub cache_records: bool,
    pub verbosity: Verbosity,
    pub timeout: Duration,
}

/// Engine exit errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("Engine exited with status {0}")]
    Exited(i32),

    #[error("Engine failed: {0}")]
    Failed(String),
}

/// TUN-to-SOCKS5 packet engine
pub trait TunnelEngine: Send + Sync {
    /// Run until the engine exits or [`stop`](Self::stop) is called
    fn run(&self, config: &TunnelEngineConfig) -> Result<(), EngineError>;

    /// Cooperative, idempotent stop signal
    fn stop(&self);
}

/// DNS-to-SOCKS5 forwarder
pub trait DnsEngine: Send + Sync {
    /// Serve until the engine exits or [`stop`](Self::stop) is called
    fn start(&self, config: &DnsEngineConfig) -> Result<(), EngineError>;

    fn stop(&self);
}
