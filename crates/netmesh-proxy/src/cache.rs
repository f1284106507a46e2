//! Flow affinity cache.
//!
//! One slot per possible local port, each a small ring of translations.
//! Adding a flow whose destination port is already in the slot overwrites
//! it; otherwise the ring's next position is taken, evicting whatever was
//! there. Entries are never deleted; stale targets are caught by callers
//! re-validating the target against fresh table results.

use std::net::IpAddr;
use std::sync::{PoisonError, RwLock};

use tracing::trace;

pub const PORT_SLOTS: usize = 1 << 16;
pub const DEFAULT_SLOT_CAPACITY: usize = 10;

/// One active flow translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversionEntry {
    pub src_ip: IpAddr,
    /// Chosen instance's namespace IP.
    pub dst_ip: IpAddr,
    /// The service IP the client addressed.
    pub dst_service_ip: IpAddr,
    /// The sender's own instance-kind service IP.
    pub src_instance_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
}

#[derive(Debug, Default)]
struct ConversionList {
    next: usize,
    entries: Vec<ConversionEntry>,
}

pub struct ProxyCache {
    slots: RwLock<Vec<ConversionList>>,
    capacity: usize,
}

impl ProxyCache {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SLOT_CAPACITY)
    }

    /// Cache keeping up to `capacity` flows per local port.
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(PORT_SLOTS);
        slots.resize_with(PORT_SLOTS, ConversionList::default);
        Self {
            slots: RwLock::new(slots),
            capacity: capacity.max(1),
        }
    }

    pub fn add(&self, entry: ConversionEntry) {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let list = &mut slots[usize::from(entry.src_port)];

        if let Some(existing) = list
            .entries
            .iter_mut()
            .find(|e| e.dst_port == entry.dst_port)
        {
            *existing = entry;
            return;
        }

        if list.entries.len() < self.capacity {
            list.entries.push(entry);
        } else {
            trace!(port = entry.src_port, position = list.next, "evicting flow");
            list.entries[list.next] = entry;
        }
        list.next = (list.next + 1) % self.capacity;
    }

    /// Forward-direction lookup: all four addresses and both ports must match.
    pub fn retrieve_by_service_flow(
        &self,
        src_ip: IpAddr,
        src_instance_ip: IpAddr,
        src_port: u16,
        dst_service_ip: IpAddr,
        dst_port: u16,
    ) -> Option<ConversionEntry> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots[usize::from(src_port)]
            .entries
            .iter()
            .find(|e| {
                e.dst_port == dst_port
                    && e.dst_service_ip == dst_service_ip
                    && e.src_ip == src_ip
                    && e.src_instance_ip == src_instance_ip
            })
            .copied()
    }

    /// Return-direction lookup keyed by the original sender's address and ports.
    ///
    /// The service IP is not part of the key: the reply only knows which
    /// instance answered.
    pub fn retrieve_by_instance_flow(
        &self,
        src_ip: IpAddr,
        src_port: u16,
        dst_port: u16,
    ) -> Option<ConversionEntry> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        slots[usize::from(src_port)]
            .entries
            .iter()
            .find(|e| e.dst_port == dst_port && e.src_ip == src_ip)
            .copied()
    }
}

impl Default for ProxyCache {
    fn default() -> Self {
        Self::new()
    }
}
