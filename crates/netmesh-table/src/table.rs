//! Concurrency-safe store of service routing records.
//!
//! One read-write lock guards the whole row vector. Searches are linear
//! scans; removals swap the victim with the last row, so row order carries
//! no meaning.

use std::net::IpAddr;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use netmesh_core::TableEntry;
use tracing::{debug, warn};

use crate::directory::RouteDirectory;
use crate::error::{TableError, TableResult};

/// Longest accepted app/service name or namespace.
pub const MAX_IDENTITY_LEN: usize = 10;

pub struct TranslationTable {
    rows: RwLock<Vec<TableEntry>>,
}

impl TranslationTable {
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(Vec::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<TableEntry>> {
        self.rows.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<TableEntry>> {
        self.rows.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a row after validating it. Invalid rows are never stored.
    pub fn add(&self, entry: TableEntry) -> TableResult<()> {
        if let Err(reason) = validate(&entry) {
            warn!(job = %entry.job_name, %reason, "rejected table entry");
            return Err(TableError::InvalidEntry(reason));
        }
        debug!(
            job = %entry.job_name,
            instance = entry.instance_number,
            namespace_ip = ?entry.namespace_ip,
            "added table entry"
        );
        self.write().push(entry);
        Ok(())
    }

    /// Remove every row whose namespace address is `ip`.
    pub fn remove_by_namespace_ip(&self, ip: IpAddr) -> TableResult<()> {
        let mut rows = self.write();
        let before = rows.len();
        let mut i = 0;
        while i < rows.len() {
            if rows[i].has_namespace_ip(ip) {
                rows.swap_remove(i);
            } else {
                i += 1;
            }
        }
        if rows.len() == before {
            debug!(namespace_ip = %ip, "no table entry to remove");
            return Err(TableError::NotFound(ip.to_string()));
        }
        Ok(())
    }

    /// Remove every row of a job. Removing an unknown job is a no-op.
    pub fn remove_by_job_name(&self, job_name: &str) {
        let mut rows = self.write();
        let mut i = 0;
        while i < rows.len() {
            if rows[i].job_name == job_name {
                rows.swap_remove(i);
            } else {
                i += 1;
            }
        }
        debug!(job = job_name, remaining = rows.len(), "removed job entries");
    }

    /// All rows exposing `ip` under any service IP kind.
    pub fn search_by_service_ip(&self, ip: IpAddr) -> Vec<TableEntry> {
        self.read()
            .iter()
            .filter(|entry| entry.exposes(ip))
            .cloned()
            .collect()
    }

    /// The row owning namespace address `ip`, if any.
    pub fn search_by_namespace_ip(&self, ip: IpAddr) -> Option<TableEntry> {
        self.read()
            .iter()
            .find(|entry| entry.has_namespace_ip(ip))
            .cloned()
    }

    pub fn search_by_job_name(&self, job_name: &str) -> Vec<TableEntry> {
        self.read()
            .iter()
            .filter(|entry| entry.job_name == job_name)
            .cloned()
            .collect()
    }

    /// The row whose instance-kind service address is `ip`.
    pub fn search_by_instance_ip(&self, ip: IpAddr) -> Option<TableEntry> {
        let v6 = ip.is_ipv6();
        self.read()
            .iter()
            .find(|entry| entry.instance_ip_for(v6) == Some(ip))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for TranslationTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteDirectory for TranslationTable {
    fn entries_by_service_ip(&self, ip: IpAddr) -> Vec<TableEntry> {
        self.search_by_service_ip(ip)
    }

    fn entry_by_namespace_ip(&self, ip: IpAddr) -> Option<TableEntry> {
        self.search_by_namespace_ip(ip)
    }

    fn entry_by_instance_ip(&self, ip: IpAddr) -> Option<TableEntry> {
        self.search_by_instance_ip(ip)
    }
}

fn validate(entry: &TableEntry) -> Result<(), String> {
    let identity = [
        ("app_name", &entry.app_name),
        ("app_namespace", &entry.app_namespace),
        ("service_name", &entry.service_name),
        ("service_namespace", &entry.service_namespace),
    ];
    for (field, value) in identity {
        if value.is_empty() || value.chars().count() > MAX_IDENTITY_LEN {
            return Err(format!("{field} must be 1..={MAX_IDENTITY_LEN} characters"));
        }
    }
    if entry.instance_number < 0 {
        return Err("instance_number must not be negative".to_string());
    }
    if entry.cluster < 0 {
        return Err("cluster must not be negative".to_string());
    }
    if entry.node_ip.is_none() {
        return Err("node_ip is missing".to_string());
    }
    if entry.namespace_ip.is_none() {
        return Err("namespace_ip is missing".to_string());
    }
    if entry.service_ips.is_empty() {
        return Err("service_ips is empty".to_string());
    }
    Ok(())
}
