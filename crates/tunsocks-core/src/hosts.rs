//! Static host table in `/etc/hosts` format.

use std::collections::HashMap;
use std::net::IpAddr;

/// Parsed hosts file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostsFile {
    entries: HashMap<String, Vec<IpAddr>>,
}

impl HostsFile {
    /// Parse hosts-file text. Malformed lines are ignored.
    pub fn parse(content: &str) -> Self {
        let mut entries: HashMap<String, Vec<IpAddr>> = HashMap::new();

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("");
            let mut fields = line.split_whitespace();
            let Some(addr) = fields.next().and_then(|a| a.parse::<IpAddr>().ok()) else {
                continue;
            };
            for name in fields {
                let list = entries.entry(name.to_ascii_lowercase()).or_default();
                if !list.contains(&addr) {
                    list.push(addr);
                }
            }
        }

        Self { entries }
    }

    /// Addresses for a host name (case-insensitive)
    pub fn resolve(&self, host: &str) -> &[IpAddr] {
        self.entries
            .get(&host.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Resolve the host part of a `host:port` endpoint through the table.
    ///
    /// Literal addresses and names missing from the table pass through
    /// unchanged.
    pub fn resolve_endpoint(&self, endpoint: &str) -> String {
        let Some((host, port)) = endpoint.rsplit_once(':') else {
            return endpoint.to_string();
        };
        if host.starts_with('[') || host.parse::<IpAddr>().is_ok() {
            return endpoint.to_string();
        }
        match self.resolve(host).first() {
            Some(IpAddr::V4(addr)) => format!("{}:{}", addr, port),
            Some(IpAddr::V6(addr)) => format!("[{}]:{}", addr, port),
            None => endpoint.to_string(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
