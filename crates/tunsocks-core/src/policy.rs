//! Routing Policy
//!
//! Turns a profile into the routing plan the TUN device is established
//! with: client addresses, routes, DNS servers and the per-app filter.
//!
//! # Route selection
//!
//! ```text
//! all / bypass-china / custom-rules   →  0.0.0.0/0  (+ ::/0 with IPv6)
//! everything else                     →  public IPv4 table
//!                                        + local DNS /32
//!                                        (+ 2000::/3 with IPv6)
//! ```
//!
//! Building a plan is pure: no I/O beyond asking the package resolver
//! whether an app exists.

use crate::profile::Profile;
use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use tracing::{debug, warn};

/// Session MTU
pub const VPN_MTU: u16 = 1500;

/// Client IPv4 address on the private link
pub const PRIVATE_VLAN4_CLIENT: Ipv4Addr = Ipv4Addr::new(172, 19, 0, 2);
pub const PRIVATE_VLAN4_PREFIX_LENGTH: u8 = 30;

/// Client IPv6 address on the private link
pub const PRIVATE_VLAN6_CLIENT: Ipv6Addr = Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 1);
/// Router side of the IPv6 link
pub const PRIVATE_VLAN6_ROUTER: Ipv6Addr = Ipv6Addr::new(0xfdfe, 0xdcba, 0x9876, 0, 0, 0, 0, 2);
pub const PRIVATE_VLAN6_PREFIX_LENGTH: u8 = 126;

/// Public IPv4 space (everything except private, loopback, link-local and
/// other LAN ranges).
pub const BYPASS_PRIVATE_ROUTES: &[&str] = &[
    "1.0.0.0/8",
    "2.0.0.0/7",
    "4.0.0.0/6",
    "8.0.0.0/7",
    "11.0.0.0/8",
    "12.0.0.0/6",
    "16.0.0.0/4",
    "32.0.0.0/3",
    "64.0.0.0/3",
    "96.0.0.0/4",
    "112.0.0.0/5",
    "120.0.0.0/6",
    "124.0.0.0/7",
    "126.0.0.0/8",
    "128.0.0.0/3",
    "160.0.0.0/5",
    "168.0.0.0/8",
    "169.0.0.0/9",
    "169.128.0.0/10",
    "169.192.0.0/11",
    "169.224.0.0/12",
    "169.240.0.0/13",
    "169.248.0.0/14",
    "169.252.0.0/15",
    "169.255.0.0/16",
    "170.0.0.0/7",
    "172.0.0.0/12",
    "172.32.0.0/11",
    "172.64.0.0/10",
    "172.128.0.0/9",
    "173.0.0.0/8",
    "174.0.0.0/7",
    "176.0.0.0/4",
    "192.0.0.0/9",
    "192.128.0.0/11",
    "192.160.0.0/13",
    "192.169.0.0/16",
    "192.170.0.0/15",
    "192.172.0.0/14",
    "192.176.0.0/12",
    "192.192.0.0/10",
    "193.0.0.0/8",
    "194.0.0.0/7",
    "196.0.0.0/6",
    "200.0.0.0/5",
    "208.0.0.0/4",
    "224.0.0.0/3",
];

/// Global unicast IPv6. Routing `::/0` in bypass modes would also capture
/// link-local traffic.
pub const BYPASS_IPV6_ROUTE: &str = "2000::/3";

/// Port appended to upstream DNS servers given without one
const DNS_PORT: u16 = 53;

/// Per-app filter semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AppFilterMode {
    /// Only listed apps use the tunnel
    Allow,
    /// Listed apps bypass the tunnel
    Deny,
}

/// Per-app allow/deny list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppFilter {
    pub mode: AppFilterMode,
    pub packages: BTreeSet<String>,
}

impl AppFilter {
    /// Does traffic from `package` enter the tunnel?
    pub fn allows(&self, package: &str) -> bool {
        match self.mode {
            AppFilterMode::Allow => self.packages.contains(package),
            AppFilterMode::Deny => !self.packages.contains(package),
        }
    }
}

/// Everything needed to establish the TUN device
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoutingPlan {
    /// VPN session name shown by the host
    pub session_name: String,
    pub mtu: u16,
    pub ipv4_address: Ipv4Net,
    pub ipv6_address: Option<Ipv6Net>,
    pub routes: Vec<IpNet>,
    pub dns_servers: Vec<IpAddr>,
    /// `None` when per-app filtering is off
    pub app_filter: Option<AppFilter>,
    /// Upstream DNS server (`host:port`) for the DNS forwarder
    pub upstream_dns: String,
    pub ipv6: bool,
    pub metered: bool,
}

impl RoutingPlan {
    /// Client addresses, IPv4 first
    pub fn addresses(&self) -> Vec<IpNet> {
        let mut addrs = vec![IpNet::V4(self.ipv4_address)];
        if let Some(v6) = self.ipv6_address {
            addrs.push(IpNet::V6(v6));
        }
        addrs
    }

    /// Does the plan capture all IPv4 traffic?
    pub fn has_default_route(&self) -> bool {
        self.routes
            .iter()
            .any(|r| matches!(r, IpNet::V4(net) if net.prefix_len() == 0))
    }

    /// IPv4 routes only
    pub fn ipv4_routes(&self) -> impl Iterator<Item = &IpNet> {
        self.routes.iter().filter(|r| matches!(r, IpNet::V4(_)))
    }

    /// IPv6 routes only
    pub fn ipv6_routes(&self) -> impl Iterator<Item = &IpNet> {
        self.routes.iter().filter(|r| matches!(r, IpNet::V6(_)))
    }
}

/// Host package lookup
pub trait PackageResolver: Send + Sync {
    /// Check that an app with this package id is installed
    fn check(&self, package: &str) -> Result<(), PackageNotFound>;
}

/// App not installed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Package not found: {0}")]
pub struct PackageNotFound(pub String);

/// Resolver that accepts every package id
#[derive(Debug, Clone, Copy, Default)]
pub struct AssumeInstalled;

impl PackageResolver for AssumeInstalled {
    fn check(&self, _package: &str) -> Result<(), PackageNotFound> {
        Ok(())
    }
}

/// Policy errors
///
/// All of these are configuration-time failures; no resource has been
/// acquired when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("Invalid subnet in route table: {0}")]
    InvalidSubnet(String),

    #[error("Local DNS address {0} is IPv6 but the profile disables IPv6")]
    LocalDnsRequiresIpv6(IpAddr),

    #[error("No upstream DNS server configured")]
    MissingUpstreamDns,
}

/// Build the routing plan for a profile
pub fn build(
    profile: &Profile,
    local_dns: IpAddr,
    package_id: &str,
    packages: &dyn PackageResolver,
) -> Result<RoutingPlan, PolicyError> {
    if local_dns.is_ipv6() && !profile.ipv6 {
        return Err(PolicyError::LocalDnsRequiresIpv6(local_dns));
    }

    let ipv4_address = Ipv4Net::new(PRIVATE_VLAN4_CLIENT, PRIVATE_VLAN4_PREFIX_LENGTH)
        .map_err(|e| PolicyError::InvalidSubnet(e.to_string()))?;
    let ipv6_address = if profile.ipv6 {
        Some(
            Ipv6Net::new(PRIVATE_VLAN6_CLIENT, PRIVATE_VLAN6_PREFIX_LENGTH)
                .map_err(|e| PolicyError::InvalidSubnet(e.to_string()))?,
        )
    } else {
        None
    };

    let app_filter = if profile.proxy_apps {
        Some(app_filter(profile, package_id, packages))
    } else {
        None
    };

    let plan = RoutingPlan {
        session_name: profile.formatted_name(),
        mtu: VPN_MTU,
        ipv4_address,
        ipv6_address,
        routes: routes(profile, local_dns)?,
        dns_servers: vec![local_dns],
        app_filter,
        upstream_dns: upstream_dns(&profile.remote_dns)?,
        ipv6: profile.ipv6,
        metered: profile.metered,
    };

    debug!(
        "Routing plan for {}: {} routes, ipv6={}, metered={}, app filter={:?}",
        plan.session_name,
        plan.routes.len(),
        plan.ipv6,
        plan.metered,
        plan.app_filter.as_ref().map(|f| f.mode)
    );

    Ok(plan)
}

fn app_filter(profile: &Profile, package_id: &str, packages: &dyn PackageResolver) -> AppFilter {
    let mode = if profile.bypass {
        AppFilterMode::Deny
    } else {
        AppFilterMode::Allow
    };

    let mut filter = AppFilter {
        mode,
        packages: BTreeSet::new(),
    };

    for package in profile.individual_apps().filter(|p| *p != package_id) {
        match packages.check(package) {
            Ok(()) => {
                filter.packages.insert(package.to_string());
            }
            Err(e) => warn!("Skipping app filter entry: {}", e),
        }
    }

    // Our own sockets must always reach the proxy
    if mode == AppFilterMode::Allow {
        filter.packages.insert(package_id.to_string());
    }

    filter
}

fn routes(profile: &Profile, local_dns: IpAddr) -> Result<Vec<IpNet>, PolicyError> {
    let mut routes = Vec::new();

    if profile.route.routes_everything() {
        routes.push(parse_subnet("0.0.0.0/0")?);
        if profile.ipv6 {
            routes.push(parse_subnet("::/0")?);
        }
    } else {
        for cidr in BYPASS_PRIVATE_ROUTES {
            routes.push(parse_subnet(cidr)?);
        }
        let host_prefix = if local_dns.is_ipv4() { 32 } else { 128 };
        let dns_route =
            IpNet::new(local_dns, host_prefix).map_err(|e| PolicyError::InvalidSubnet(e.to_string()))?;
        routes.push(dns_route);
        if profile.ipv6 {
            routes.push(parse_subnet(BYPASS_IPV6_ROUTE)?);
        }
    }

    Ok(routes)
}

fn parse_subnet(cidr: &str) -> Result<IpNet, PolicyError> {
    cidr.parse()
        .map_err(|_| PolicyError::InvalidSubnet(cidr.to_string()))
}

/// Normalize the profile's remote DNS setting to `host:port`.
///
/// Only the first entry of a comma-separated list is used.
pub fn upstream_dns(remote_dns: &str) -> Result<String, PolicyError> {
    let first = remote_dns
        .split(',')
        .map(str::trim)
        .find(|s| !s.is_empty())
        .ok_or(PolicyError::MissingUpstreamDns)?;

    if first.parse::<std::net::SocketAddr>().is_ok() {
        return Ok(first.to_string());
    }
    match first.parse::<IpAddr>() {
        Ok(IpAddr::V4(addr)) => Ok(format!("{}:{}", addr, DNS_PORT)),
        Ok(IpAddr::V6(addr)) => Ok(format!("[{}]:{}", addr, DNS_PORT)),
        Err(_) => match first.rsplit_once(':') {
            Some((_, port)) if port.parse::<u16>().is_ok() => Ok(first.to_string()),
            _ => Ok(format!("{}:{}", first, DNS_PORT)),
        },
    }
}
