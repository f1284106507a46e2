//! JSON payloads exchanged with the cluster authority.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use netmesh_core::{ServiceIp, ServiceIpKind, TableEntry};
use serde::{Deserialize, Serialize};

use crate::error::{ResolveError, ResolveResult};

/// Lookup by service IP (`sip`) or by job name (`sname`); the other is empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQueryRequest {
    pub sname: String,
    pub sip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableQueryResponse {
    #[serde(rename = "app_name")]
    pub job_name: String,
    #[serde(default)]
    pub instance_list: Vec<ServiceInstance>,
    #[serde(default)]
    pub query_key: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_number: i32,
    #[serde(default)]
    pub namespace_ip: String,
    #[serde(rename = "namespace_ip_v6", default)]
    pub namespace_ipv6: String,
    #[serde(default)]
    pub host_ip: String,
    #[serde(default)]
    pub host_port: u16,
    #[serde(default)]
    pub service_ip: Vec<Sip>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sip {
    #[serde(rename = "IpType")]
    pub kind: String,
    #[serde(rename = "Address", default)]
    pub address: String,
    #[serde(rename = "Address_v6", default)]
    pub address_v6: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterestRemoveRequest {
    pub appname: String,
}

impl TableQueryResponse {
    /// Every key a pending query could be waiting under.
    pub fn correlation_keys(&self) -> Vec<String> {
        let mut keys = vec![self.job_name.clone(), self.query_key.clone()];
        for instance in &self.instance_list {
            for sip in &instance.service_ip {
                keys.push(sip.address.clone());
                keys.push(sip.address_v6.clone());
            }
        }
        keys.retain(|key| !key.is_empty());
        keys.sort();
        keys.dedup();
        keys
    }

    /// Convert into table rows, one per instance.
    ///
    /// Addresses that fail to parse become `None` and are rejected later by
    /// table validation.
    pub fn into_entries(self) -> ResolveResult<Vec<TableEntry>> {
        let parts: Vec<&str> = self.job_name.split('.').collect();
        let [app_name, app_namespace, service_name, service_namespace] = parts[..] else {
            return Err(ResolveError::MalformedJobName(self.job_name.clone()));
        };

        Ok(self
            .instance_list
            .iter()
            .map(|instance| TableEntry {
                job_name: self.job_name.clone(),
                app_name: app_name.to_string(),
                app_namespace: app_namespace.to_string(),
                service_name: service_name.to_string(),
                service_namespace: service_namespace.to_string(),
                instance_number: instance.instance_number,
                cluster: 0,
                node_ip: instance.host_ip.parse::<IpAddr>().ok(),
                node_port: instance.host_port,
                namespace_ip: instance.namespace_ip.parse::<Ipv4Addr>().ok(),
                namespace_ipv6: instance.namespace_ipv6.parse::<Ipv6Addr>().ok(),
                service_ips: instance
                    .service_ip
                    .iter()
                    .map(|sip| ServiceIp {
                        kind: ServiceIpKind::from_wire(&sip.kind),
                        address: sip.address.parse().ok(),
                        address_v6: sip.address_v6.parse().ok(),
                    })
                    .collect(),
            })
            .collect())
    }
}
