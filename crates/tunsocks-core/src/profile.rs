//! Server Profiles
//!
//! A profile describes one proxy server plus the per-session routing
//! preferences: route mode, IPv6, metered signaling and per-app filtering.

use crate::config::{ConfigError, ConfigFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Route mode
///
/// Selects whether the TUN device captures everything or only public
/// destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteMode {
    /// Global: route everything
    #[default]
    All,
    /// Bypass LAN addresses
    BypassLan,
    /// Bypass mainland China (remote ACL list)
    #[serde(rename = "bypass-china")]
    BypassChn,
    /// Bypass LAN and mainland China
    #[serde(rename = "bypass-lan-china")]
    BypassLanChn,
    /// GFW list
    Gfwlist,
    /// China list
    ChinaList,
    /// User-defined ACL
    CustomRules,
}

impl RouteMode {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMode::All => "all",
            RouteMode::BypassLan => "bypass-lan",
            RouteMode::BypassChn => "bypass-china",
            RouteMode::BypassLanChn => "bypass-lan-china",
            RouteMode::Gfwlist => "gfwlist",
            RouteMode::ChinaList => "china-list",
            RouteMode::CustomRules => "custom-rules",
        }
    }

    /// Does the TUN device take the default route?
    ///
    /// Global, remote-ACL and custom-rule modes capture everything and let
    /// the proxy decide; every other mode keeps private ranges off the tunnel.
    pub fn routes_everything(&self) -> bool {
        matches!(
            self,
            RouteMode::All | RouteMode::BypassChn | RouteMode::CustomRules
        )
    }
}

impl std::fmt::Display for RouteMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RouteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(RouteMode::All),
            "bypass-lan" => Ok(RouteMode::BypassLan),
            "bypass-china" => Ok(RouteMode::BypassChn),
            "bypass-lan-china" => Ok(RouteMode::BypassLanChn),
            "gfwlist" => Ok(RouteMode::Gfwlist),
            "china-list" => Ok(RouteMode::ChinaList),
            "custom-rules" => Ok(RouteMode::CustomRules),
            _ => Err(ConfigError::ParseError(format!("unknown route mode: {}", s))),
        }
    }
}

/// Proxy profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Display name
    pub name: String,
    /// Proxy server host
    pub host: String,
    /// Proxy server port
    pub remote_port: u16,
    /// Route mode
    pub route: RouteMode,
    /// Enable IPv6 inside the tunnel
    pub ipv6: bool,
    /// Mark the VPN network as metered
    pub metered: bool,
    /// Per-app filtering enabled
    pub proxy_apps: bool,
    /// `true`: listed apps bypass the tunnel, `false`: only listed apps use it
    pub bypass: bool,
    /// Newline-separated package ids
    pub individual: String,
    /// Upstream DNS server for the DNS forwarder
    pub remote_dns: String,
    /// Is the proxy connection TLS-terminated?
    pub over_tls: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "198.199.101.152".to_string(),
            remote_port: 8388,
            route: RouteMode::All,
            ipv6: false,
            metered: false,
            proxy_apps: false,
            bypass: false,
            individual: String::new(),
            remote_dns: "8.8.8.8".to_string(),
            over_tls: false,
        }
    }
}

impl Profile {
    /// Name shown to the host as the VPN session name
    pub fn formatted_name(&self) -> String {
        if self.name.is_empty() {
            if self.host.contains(':') {
                format!("[{}]:{}", self.host, self.remote_port)
            } else {
                format!("{}:{}", self.host, self.remote_port)
            }
        } else {
            self.name.clone()
        }
    }

    /// Configured package ids, blank lines dropped
    pub fn individual_apps(&self) -> impl Iterator<Item = &str> {
        self.individual
            .split('\n')
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from a `.toml` or `.json` file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let format = ConfigFormat::from_path(path)?;
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        match format {
            ConfigFormat::Toml => Self::from_toml(&content),
            ConfigFormat::Json => Self::from_json(&content),
        }
    }
}
