//! Lookup capability consumed by the packet tunnel.

use std::net::IpAddr;

use netmesh_core::TableEntry;

/// Read-side view of the routing table.
///
/// Implementations may have side effects on lookup (activity signals,
/// background resolution on a miss) but must never block on the network.
pub trait RouteDirectory: Send + Sync {
    /// Every known instance behind a service address.
    fn entries_by_service_ip(&self, ip: IpAddr) -> Vec<TableEntry>;

    /// The local instance owning a namespace address.
    fn entry_by_namespace_ip(&self, ip: IpAddr) -> Option<TableEntry>;

    /// The instance whose instance-kind service address is `ip`.
    fn entry_by_instance_ip(&self, ip: IpAddr) -> Option<TableEntry>;
}
