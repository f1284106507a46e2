//! netmesh.toml configuration parser.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::TableEntry;

/// Tunnel port used when the configuration leaves it unset.
pub const DEFAULT_TUNNEL_PORT: u16 = 50103;

const MIN_LINK_MTU: usize = 1280;
const MAX_DATAGRAM: usize = 65535;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub node: NodeConfig,
    pub tunnel: TunnelConfig,
    pub resolution: ResolutionConfig,
    /// Static rows preloaded into the translation table.
    pub routes: Vec<TableEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity used in message bus topics.
    pub node_id: String,
    /// Address other nodes reach this node's tunnel on.
    pub public_address: Option<IpAddr>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "netmesh-node".to_string(),
            public_address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub device_name: String,
    pub tun_ipv4: Ipv4Addr,
    pub tun_ipv6: Ipv6Addr,
    pub proxy_subnetwork: Ipv4Addr,
    pub proxy_subnetwork_mask: Ipv4Addr,
    pub proxy_subnetwork_ipv6: Ipv6Addr,
    pub proxy_subnetwork_ipv6_prefix: u8,
    pub mtu: u32,
    pub tunnel_port: u16,
    /// Packets buffered per direction before readers block.
    pub queue_capacity: usize,
    /// Flow translations kept per local port.
    pub cache_slot_capacity: usize,
    pub max_forward_attempts: u32,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            device_name: "goProxyTun".to_string(),
            tun_ipv4: Ipv4Addr::new(10, 19, 1, 254),
            tun_ipv6: Ipv6Addr::new(0xfcef, 0, 0, 0, 0, 0, 0xdead, 0xbeef),
            proxy_subnetwork: Ipv4Addr::new(10, 30, 0, 0),
            proxy_subnetwork_mask: Ipv4Addr::new(255, 255, 0, 0),
            proxy_subnetwork_ipv6: Ipv6Addr::new(0xfc00, 0, 0, 0, 0, 0, 0, 0),
            proxy_subnetwork_ipv6_prefix: 7,
            mtu: 1450,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            queue_capacity: 1000,
            cache_slot_capacity: 10,
            max_forward_attempts: 10,
        }
    }
}

impl TunnelConfig {
    /// Whether packets addressed to `ip` belong to the service subnetwork.
    pub fn intercepts(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => {
                let mask = u32::from(self.proxy_subnetwork_mask);
                u32::from(v4) & mask == u32::from(self.proxy_subnetwork) & mask
            }
            IpAddr::V6(v6) => {
                let prefix = u32::from(self.proxy_subnetwork_ipv6_prefix.min(128));
                let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
                u128::from(v6) & mask == u128::from(self.proxy_subnetwork_ipv6) & mask
            }
        }
    }

    /// Read buffer for device and tunnel socket: one MTU-sized packet,
    /// never below the IPv6 minimum link MTU nor above the largest datagram.
    pub fn read_buffer_len(&self) -> usize {
        usize::try_from(self.mtu)
            .unwrap_or(MAX_DATAGRAM)
            .clamp(MIN_LINK_MTU, MAX_DATAGRAM)
    }

    /// The configured tunnel port, or the default when unset.
    pub fn effective_port(&self) -> u16 {
        if self.tunnel_port == 0 {
            DEFAULT_TUNNEL_PORT
        } else {
            self.tunnel_port
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub query_timeout_ms: u64,
    pub interest_idle_timeout_secs: u64,
    /// Buffered activity signals per event target.
    pub event_buffer: usize,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 5000,
            interest_idle_timeout_secs: 10,
            event_buffer: 10,
        }
    }
}

impl ResolutionConfig {
    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn interest_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.interest_idle_timeout_secs)
    }
}

impl NetConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NetConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty() {
        let config: NetConfig = toml::from_str("").unwrap();
        assert_eq!(config.tunnel.device_name, "goProxyTun");
        assert_eq!(config.tunnel.effective_port(), 50103);
        assert_eq!(config.resolution.query_timeout(), Duration::from_secs(5));
        assert!(config.routes.is_empty());
    }

    #[test]
    fn test_parse_partial() {
        let toml_str = r#"
[node]
node_id = "worker-7"

[tunnel]
tunnel_port = 0
mtu = 1400
"#;
        let config: NetConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.node.node_id, "worker-7");
        assert_eq!(config.tunnel.mtu, 1400);
        assert_eq!(config.tunnel.effective_port(), DEFAULT_TUNNEL_PORT);
        assert_eq!(config.tunnel.proxy_subnetwork, Ipv4Addr::new(10, 30, 0, 0));
    }

    #[test]
    fn test_intercepts_v4() {
        let tunnel = TunnelConfig::default();
        assert!(tunnel.intercepts("10.30.255.255".parse().unwrap()));
        assert!(tunnel.intercepts("10.30.0.1".parse().unwrap()));
        assert!(!tunnel.intercepts("10.20.1.1".parse().unwrap()));
        assert!(!tunnel.intercepts("10.19.2.12".parse().unwrap()));
    }

    #[test]
    fn test_intercepts_v6() {
        let mut tunnel = TunnelConfig::default();
        assert!(tunnel.intercepts("fdff::fe".parse().unwrap()));
        assert!(!tunnel.intercepts("2001:db8::1".parse().unwrap()));

        tunnel.proxy_subnetwork_ipv6 = "fdff::".parse().unwrap();
        tunnel.proxy_subnetwork_ipv6_prefix = 16;
        assert!(tunnel.intercepts("fdff:1000::ff".parse().unwrap()));
        assert!(!tunnel.intercepts("fc00::1".parse().unwrap()));
    }

    #[test]
    fn test_read_buffer_follows_mtu() {
        let mut tunnel = TunnelConfig::default();
        assert_eq!(tunnel.read_buffer_len(), 1450);
        tunnel.mtu = 9000;
        assert_eq!(tunnel.read_buffer_len(), 9000);
        tunnel.mtu = 500;
        assert_eq!(tunnel.read_buffer_len(), 1280);
        tunnel.mtu = u32::MAX;
        assert_eq!(tunnel.read_buffer_len(), 65535);
    }

    #[test]
    fn test_routes_roundtrip() {
        let toml_str = r#"
[[routes]]
job_name = "app.ns.svc.sns"
app_name = "app"
app_namespace = "ns"
service_name = "svc"
service_namespace = "sns"
instance_number = 0
node_ip = "10.0.0.2"
node_port = 50103
namespace_ip = "10.19.2.12"
service_ips = [{ kind = "round_robin", address = "10.30.1.1" }]
"#;
        let config: NetConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].namespace_ip, Some(Ipv4Addr::new(10, 19, 2, 12)));
        let rendered = config.to_toml_string().unwrap();
        assert!(rendered.contains("app.ns.svc.sns"));
    }
}
