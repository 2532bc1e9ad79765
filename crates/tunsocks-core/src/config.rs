//! Service Configuration
//!
//! Service-wide settings that outlive any single profile: where the local
//! SOCKS5 proxy listens, which address the tunnel advertises as its DNS
//! server, and our own package id for per-app filtering.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;

/// How the service exposes the proxy to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceMode {
    /// Capture traffic through a TUN device
    #[default]
    Vpn,
    /// Only run the local SOCKS5 proxy
    Proxy,
    /// Transparent proxy (no TUN device)
    Transproxy,
}

/// Service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Service mode
    pub service_mode: ServiceMode,
    /// Address the local SOCKS5 proxy listens on
    pub listen_address: String,
    /// Local SOCKS5 proxy port
    pub proxy_port: u16,
    /// DNS server address handed to the TUN device
    pub local_dns_address: String,
    /// Our own package id (kept out of the tunnel's bypass list)
    pub package_id: String,
    /// Verbose engine logging
    pub debug: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            service_mode: ServiceMode::Vpn,
            listen_address: "127.0.0.1".to_string(),
            proxy_port: 1080,
            local_dns_address: "172.19.0.1".to_string(),
            package_id: "com.github.shadowsocks".to_string(),
            debug: false,
        }
    }
}

impl ServiceConfig {
    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from a file, picking the format from its extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        match ConfigFormat::from_path(path)? {
            ConfigFormat::Toml => Self::from_toml_file(path),
            ConfigFormat::Json => Self::from_json_file(path),
        }
    }

    /// Proxy URL handed to the packet engine
    pub fn proxy_url(&self) -> String {
        format!("socks5://{}", self.socks5_server())
    }

    /// `host:port` of the local SOCKS5 proxy
    pub fn socks5_server(&self) -> String {
        match self.listen_address.parse::<IpAddr>() {
            Ok(IpAddr::V6(addr)) => format!("[{}]:{}", addr, self.proxy_port),
            _ => format!("{}:{}", self.listen_address, self.proxy_port),
        }
    }

    /// Parsed local DNS address
    pub fn local_dns(&self) -> Result<IpAddr, ConfigError> {
        self.local_dns_address
            .parse()
            .map_err(|_| ConfigError::InvalidDnsAddress(self.local_dns_address.clone()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.proxy_port == 0 {
            return Err(ConfigError::InvalidPort);
        }
        self.local_dns()?;
        Ok(())
    }
}

/// Supported on-disk formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Ok(ConfigFormat::Toml),
            "json" => Ok(ConfigFormat::Json),
            _ => Err(ConfigError::UnsupportedFormat),
        }
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid proxy port")]
    InvalidPort,

    #[error("Invalid local DNS address: {0}")]
    InvalidDnsAddress(String),

    #[error("Unsupported config format (use .toml or .json)")]
    UnsupportedFormat,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_default() {
        let config = ServiceConfig::default();

        assert_eq!(config.service_mode, ServiceMode::Vpn);
        assert_eq!(config.proxy_port, 1080);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_proxy_url() {
        let config = ServiceConfig::default();
        assert_eq!(config.proxy_url(), "socks5://127.0.0.1:1080");
        assert_eq!(config.socks5_server(), "127.0.0.1:1080");
    }

    #[test]
    fn test_proxy_url_ipv6_listen() {
        let config = ServiceConfig {
            listen_address: "::1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.proxy_url(), "socks5://[::1]:1080");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = ServiceConfig {
            proxy_port: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidPort)));

        let config = ServiceConfig {
            local_dns_address: "dns.local".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidDnsAddress(_))
        ));
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = ServiceConfig::from_toml("proxy_port = 1088\ndebug = true\n").unwrap();

        assert_eq!(config.proxy_port, 1088);
        assert!(config.debug);
        assert_eq!(config.listen_address, "127.0.0.1");
    }

    #[test]
    fn test_service_mode_names() {
        let config = ServiceConfig::from_json(r#"{"service_mode": "transproxy"}"#).unwrap();
        assert_eq!(config.service_mode, ServiceMode::Transproxy);
    }

    #[test]
    fn test_load_by_extension() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "local_dns_address = \"172.19.0.1\"").unwrap();
        writeln!(file, "package_id = \"org.example.vpn\"").unwrap();

        let config = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(config.package_id, "org.example.vpn");

        let other = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        assert!(matches!(
            ServiceConfig::load(other.path()),
            Err(ConfigError::UnsupportedFormat)
        ));
    }
}
