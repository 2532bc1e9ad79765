//! tunsocks: VPN session planner
//!
//! Loads a service config and a profile, computes the routing plan and the
//! launch parameters of both forwarding engines, and prints them as JSON.
//! Nothing is established; this is what a session would ask the host for.
//!
//! ```text
//! tunsocks <service.toml|json> <profile.toml|json> [hosts-file]
//! ```

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tunsocks_core::{
    build_routing_plan, dns_engine_config, tunnel_engine_config, AssumeInstalled,
    DnsEngineConfig, HostsFile, Profile, RoutingPlan, ServiceConfig, TunnelEngineConfig,
};

// Use mimalloc as the global allocator
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Descriptor shown in the printed packet-engine config
const PLACEHOLDER_FD: i32 = -1;

#[derive(Serialize)]
struct SessionPlan {
    routing: RoutingPlan,
    tunnel_engine: TunnelEngineConfig,
    dns_engine: DnsEngineConfig,
}

fn main() -> Result<()> {
    // Initialize logging
    FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.len() < 2 || args.len() > 3 {
        bail!("usage: tunsocks <service config> <profile> [hosts file]");
    }
    let config_path = PathBuf::from(&args[0]);
    let profile_path = PathBuf::from(&args[1]);

    let config = ServiceConfig::load(&config_path)
        .with_context(|| format!("loading service config {}", config_path.display()))?;
    config.validate().context("invalid service config")?;

    let profile = Profile::load(&profile_path)
        .with_context(|| format!("loading profile {}", profile_path.display()))?;

    let hosts = match args.get(2) {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading hosts file {}", path))?;
            HostsFile::parse(&content)
        }
        None => HostsFile::default(),
    };

    info!("Planning session for {}", profile.formatted_name());

    let local_dns = config.local_dns()?;
    let routing = build_routing_plan(&profile, local_dns, &config.package_id, &AssumeInstalled)
        .context("building routing plan")?;

    let plan = SessionPlan {
        tunnel_engine: tunnel_engine_config(&config, &profile, &routing, PLACEHOLDER_FD),
        dns_engine: dns_engine_config(&config, &routing, &hosts),
        routing,
    };

    info!(
        "{} routes, {} DNS servers, default route: {}",
        plan.routing.routes.len(),
        plan.routing.dns_servers.len(),
        plan.routing.has_default_route()
    );

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}
