//! Node assembly: builds every subsystem, runs until Ctrl-C, then tears
//! them down in reverse order.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

use anyhow::Context;
use netmesh_core::{NetConfig, TableEntry};
use netmesh_proxy::{ProxyTunnel, TunDevice};
use netmesh_resolve::{Environment, LocalBus};
use netmesh_table::TranslationTable;
use tokio::net::UdpSocket;
use tracing::{error, info, warn};

/// Probe target for outbound address detection. Nothing is sent.
const PROBE_ADDR: (Ipv4Addr, u16) = (Ipv4Addr::new(8, 8, 8, 8), 80);

pub async fn run_standalone(config: NetConfig) -> anyhow::Result<()> {
    info!(node_id = %config.node.node_id, "netmesh node starting in standalone mode");

    let local_ip = match config.node.public_address {
        Some(ip) => ip,
        None => detect_local_ip().await.context("detecting node address")?,
    };
    info!(%local_ip, "node address");

    // ── Routing environment ────────────────────────────────────

    let env = Environment::new(
        Arc::new(TranslationTable::new()),
        Arc::new(LocalBus::new()),
        &config.node.node_id,
        &config.resolution,
    );
    env.start().await?;
    let preloaded = preload_routes(&env, &config.routes);
    info!(preloaded, "translation table ready");

    // ── Tunnel ─────────────────────────────────────────────────

    let device = open_device(&config.tunnel.device_name)?;
    info!(
        device = %config.tunnel.device_name,
        tun_ipv4 = %config.tunnel.tun_ipv4,
        tun_ipv6 = %config.tunnel.tun_ipv6,
        mtu = config.tunnel.mtu,
        "TUN device open; addresses and MTU are assigned by the host"
    );
    let tunnel = ProxyTunnel::new(config.tunnel.clone(), env.clone(), local_ip);
    if let Some(mut errors) = tunnel.errors() {
        tokio::spawn(async move {
            while let Some(err) = errors.recv().await {
                warn!(error = %err, "tunnel reader reported an error");
            }
        });
    }
    tunnel.listen(device).await?;

    // ── Shutdown ───────────────────────────────────────────────

    tokio::signal::ctrl_c().await.context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    if let Err(e) = tunnel.stop().await {
        error!(error = %e, "tunnel did not stop cleanly");
    }
    env.shutdown().await;

    info!("netmesh node stopped");
    Ok(())
}

/// Insert the static routes. Returns how many were accepted.
fn preload_routes(env: &Environment, routes: &[TableEntry]) -> usize {
    for route in routes {
        env.add_table_query_entry(route.clone());
    }
    env.table().len()
}

/// The address of the interface used for outbound traffic.
async fn detect_local_ip() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.connect(PROBE_ADDR).await?;
    Ok(socket.local_addr()?.ip())
}

#[cfg(target_os = "linux")]
fn open_device(name: &str) -> anyhow::Result<Arc<dyn TunDevice>> {
    let device = netmesh_proxy::LinuxTun::open(name)
        .with_context(|| format!("opening TUN device {name}"))?;
    Ok(Arc::new(device))
}

#[cfg(not(target_os = "linux"))]
fn open_device(name: &str) -> anyhow::Result<Arc<dyn TunDevice>> {
    anyhow::bail!("TUN device {name} is only supported on Linux")
}
