//! Routing records shared by the table, the tunnel and the resolver.
//!
//! A [`TableEntry`] describes one running instance of one service: who it is,
//! which node hosts it, its private namespace address, and the service
//! addresses clients use to reach it.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::{Deserialize, Serialize};

/// Addressing policy behind a service IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceIpKind {
    /// Unique per instance; identifies the sender on the return path.
    InstanceNumber,
    /// Shared by all instances, nearest one preferred.
    Closest,
    /// Shared by all instances of a job.
    RoundRobin,
}

impl ServiceIpKind {
    /// Parse the kind tag used on the wire (`"RR"`, `"Closest"`, `"InstanceNumber"`).
    ///
    /// Unknown tags fall back to `InstanceNumber`.
    pub fn from_wire(tag: &str) -> Self {
        match tag {
            "RR" => Self::RoundRobin,
            "Closest" => Self::Closest,
            _ => Self::InstanceNumber,
        }
    }

    /// Wire tag for this kind.
    pub fn as_wire(&self) -> &'static str {
        match self {
            Self::RoundRobin => "RR",
            Self::Closest => "Closest",
            Self::InstanceNumber => "InstanceNumber",
        }
    }
}

impl fmt::Display for ServiceIpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire())
    }
}

/// One address a service is reachable at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceIp {
    pub kind: ServiceIpKind,
    pub address: Option<Ipv4Addr>,
    #[serde(default)]
    pub address_v6: Option<Ipv6Addr>,
}

impl ServiceIp {
    pub fn new(kind: ServiceIpKind, address: Ipv4Addr) -> Self {
        Self {
            kind,
            address: Some(address),
            address_v6: None,
        }
    }

    pub fn with_v6(mut self, address_v6: Ipv6Addr) -> Self {
        self.address_v6 = Some(address_v6);
        self
    }

    /// Whether `ip` is either of this service IP's addresses.
    pub fn matches(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.address == Some(v4),
            IpAddr::V6(v6) => self.address_v6 == Some(v6),
        }
    }

    /// The address of the requested family.
    pub fn address_for(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            self.address_v6.map(IpAddr::V6)
        } else {
            self.address.map(IpAddr::V4)
        }
    }
}

/// One known instance of one service, for one job.
///
/// Addresses are optional because rows can be built from remote responses
/// whose addresses fail to parse; such rows are rejected by the table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableEntry {
    pub job_name: String,
    pub app_name: String,
    pub app_namespace: String,
    pub service_name: String,
    pub service_namespace: String,
    pub instance_number: i32,
    #[serde(default)]
    pub cluster: i32,
    /// Physical node hosting the instance (tunnel endpoint).
    pub node_ip: Option<IpAddr>,
    pub node_port: u16,
    /// The instance's private address inside its network namespace.
    pub namespace_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub namespace_ipv6: Option<Ipv6Addr>,
    pub service_ips: Vec<ServiceIp>,
}

impl TableEntry {
    /// Whether `ip` is this instance's v4 or v6 namespace address.
    pub fn has_namespace_ip(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.namespace_ip == Some(v4),
            IpAddr::V6(v6) => self.namespace_ipv6 == Some(v6),
        }
    }

    /// Whether any of this entry's service IPs is `ip`, regardless of kind.
    pub fn exposes(&self, ip: IpAddr) -> bool {
        self.service_ips.iter().any(|sip| sip.matches(ip))
    }

    /// Namespace address of the requested family.
    pub fn namespace_ip_for(&self, v6: bool) -> Option<IpAddr> {
        if v6 {
            self.namespace_ipv6.map(IpAddr::V6)
        } else {
            self.namespace_ip.map(IpAddr::V4)
        }
    }

    /// The instance-kind service address of the requested family.
    ///
    /// When several instance-kind addresses exist the last one wins.
    pub fn instance_ip_for(&self, v6: bool) -> Option<IpAddr> {
        self.service_ips
            .iter()
            .filter(|sip| sip.kind == ServiceIpKind::InstanceNumber)
            .filter_map(|sip| sip.address_for(v6))
            .last()
    }

    /// `{job}.{instance}` key used to track local deployments.
    pub fn instance_key(&self) -> String {
        instance_key(&self.job_name, self.instance_number)
    }
}

/// Build the `{job}.{instance}` key for a deployed instance.
pub fn instance_key(job_name: &str, instance_number: i32) -> String {
    format!("{job_name}.{instance_number}")
}

/// Whether `ip` is still a namespace address of one of `candidates`.
///
/// Cached flow targets are only reused while this holds.
pub fn is_namespace_still_valid(ip: IpAddr, candidates: &[TableEntry]) -> bool {
    candidates.iter().any(|entry| entry.has_namespace_ip(ip))
}
