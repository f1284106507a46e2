//! IPv4 fragment reassembly.
//!
//! Fragments are grouped by `(src, dst, protocol, identification)`. Once
//! every byte between offset 0 and the end announced by the last fragment
//! has arrived, a single unfragmented datagram is rebuilt from the first
//! fragment's header. Incomplete datagrams are dropped after
//! [`FRAGMENT_TIMEOUT`].

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::checksum::Checksum;
use crate::error::CodecError;

pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on datagrams being reassembled at once.
pub const MAX_PENDING_DATAGRAMS: usize = 1024;

const MAX_DATAGRAM_LEN: usize = 65_535;
const FLAG_MORE_FRAGMENTS: u16 = 0x2000;
const FLAG_DONT_FRAGMENT: u16 = 0x4000;
const OFFSET_MASK: u16 = 0x1fff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FragmentKey {
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    id: u16,
}

#[derive(Debug)]
struct PendingDatagram {
    /// Header of the offset-0 fragment, once seen.
    header: Option<Vec<u8>>,
    /// Payload chunks keyed by byte offset.
    chunks: BTreeMap<usize, Vec<u8>>,
    /// Payload length, known once the final fragment arrives.
    total_len: Option<usize>,
    first_seen: Instant,
}

impl PendingDatagram {
    fn new(now: Instant) -> Self {
        Self {
            header: None,
            chunks: BTreeMap::new(),
            total_len: None,
            first_seen: now,
        }
    }

    fn is_complete(&self) -> bool {
        let (Some(total), Some(_)) = (self.total_len, &self.header) else {
            return false;
        };
        let mut covered = 0;
        for (offset, chunk) in &self.chunks {
            if *offset > covered {
                return false;
            }
            covered = covered.max(offset + chunk.len());
        }
        covered >= total
    }

    fn assemble(self) -> Result<Vec<u8>, CodecError> {
        let (Some(mut header), Some(total)) = (self.header, self.total_len) else {
            return Err(CodecError::Malformed("datagram is incomplete".to_string()));
        };
        // Fragments are bounded by their own header, not the first one's.
        let rebuilt_len = header.len() + total;
        if rebuilt_len > MAX_DATAGRAM_LEN {
            return Err(CodecError::Malformed(format!(
                "reassembled datagram is {rebuilt_len} bytes, above 65535"
            )));
        }
        let mut payload = vec![0u8; total];
        for (offset, chunk) in self.chunks {
            let end = (offset + chunk.len()).min(total);
            if offset < end {
                payload[offset..end].copy_from_slice(&chunk[..end - offset]);
            }
        }

        let total_len = rebuilt_len as u16;
        header[2..4].copy_from_slice(&total_len.to_be_bytes());
        let flags = u16::from_be_bytes([header[6], header[7]]) & FLAG_DONT_FRAGMENT;
        header[6..8].copy_from_slice(&flags.to_be_bytes());
        header[10..12].copy_from_slice(&[0, 0]);
        let csum = Checksum::compute(&header).header_value();
        header[10..12].copy_from_slice(&csum.to_be_bytes());

        header.extend_from_slice(&payload);
        Ok(header)
    }
}

#[derive(Debug, Default)]
pub struct Ipv4Defragmenter {
    pending: HashMap<FragmentKey, PendingDatagram>,
}

/// Whether an IPv4 header (at least 20 bytes) belongs to a fragment.
pub fn is_fragment(header: &[u8]) -> bool {
    let flags = u16::from_be_bytes([header[6], header[7]]);
    flags & FLAG_MORE_FRAGMENTS != 0 || flags & OFFSET_MASK != 0
}

impl Ipv4Defragmenter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one fragment. Returns the rebuilt datagram once it is complete.
    ///
    /// `datagram` must already be trimmed to its total length and carry a
    /// valid header length.
    pub fn push(&mut self, datagram: &[u8]) -> Result<Option<Vec<u8>>, CodecError> {
        self.push_at(datagram, Instant::now())
    }

    fn push_at(&mut self, datagram: &[u8], now: Instant) -> Result<Option<Vec<u8>>, CodecError> {
        self.evict_stale(now);

        let header_len = usize::from(datagram[0] & 0x0f) * 4;
        let flags = u16::from_be_bytes([datagram[6], datagram[7]]);
        let offset = usize::from(flags & OFFSET_MASK) * 8;
        let more = flags & FLAG_MORE_FRAGMENTS != 0;
        let payload = &datagram[header_len..];

        if offset + payload.len() + header_len > MAX_DATAGRAM_LEN {
            return Err(CodecError::Malformed(
                "reassembled datagram exceeds 65535 bytes".to_string(),
            ));
        }
        if more && payload.len() % 8 != 0 {
            return Err(CodecError::Malformed(
                "non-final fragment length is not a multiple of 8".to_string(),
            ));
        }

        let key = FragmentKey {
            src: Ipv4Addr::new(datagram[12], datagram[13], datagram[14], datagram[15]),
            dst: Ipv4Addr::new(datagram[16], datagram[17], datagram[18], datagram[19]),
            protocol: datagram[9],
            id: u16::from_be_bytes([datagram[4], datagram[5]]),
        };

        if !self.pending.contains_key(&key) && self.pending.len() >= MAX_PENDING_DATAGRAMS {
            debug!(pending = self.pending.len(), "fragment buffer full, dropping fragment");
            return Ok(None);
        }

        let entry = self
            .pending
            .entry(key)
            .or_insert_with(|| PendingDatagram::new(now));
        if offset == 0 {
            entry.header = Some(datagram[..header_len].to_vec());
        }
        if !more {
            entry.total_len = Some(offset + payload.len());
        }
        entry.chunks.insert(offset, payload.to_vec());

        if !entry.is_complete() {
            return Ok(None);
        }
        let Some(done) = self.pending.remove(&key) else {
            return Ok(None);
        };
        debug!(id = key.id, src = %key.src, dst = %key.dst, "reassembled IPv4 datagram");
        done.assemble().map(Some)
    }

    fn evict_stale(&mut self, now: Instant) {
        self.pending
            .retain(|_, datagram| now.duration_since(datagram.first_seen) < FRAGMENT_TIMEOUT);
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(id: u16, offset: usize, more: bool, payload: &[u8]) -> Vec<u8> {
        fragment_with_header(id, offset, more, payload, 20)
    }

    /// Fragment whose header is padded with NOP options to `header_len`.
    fn fragment_with_header(id: u16, offset: usize, more: bool, payload: &[u8], header_len: usize) -> Vec<u8> {
        let mut header = vec![
            0x45, 0, 0, 0, 0, 0, 0, 0, 64, 17, 0, 0, 10, 19, 1, 1, 10, 19, 2, 12,
        ];
        header[0] = 0x40 | (header_len / 4) as u8;
        header.resize(header_len, 1);
        let total = (header_len + payload.len()) as u16;
        header[2..4].copy_from_slice(&total.to_be_bytes());
        header[4..6].copy_from_slice(&id.to_be_bytes());
        let mut flags = (offset / 8) as u16;
        if more {
            flags |= FLAG_MORE_FRAGMENTS;
        }
        header[6..8].copy_from_slice(&flags.to_be_bytes());
        let csum = Checksum::compute(&header).header_value();
        header[10..12].copy_from_slice(&csum.to_be_bytes());
        header.extend_from_slice(payload);
        header
    }

    #[test]
    fn reassembles_out_of_order() {
        let payload: Vec<u8> = (0..40u8).collect();
        let mut defrag = Ipv4Defragmenter::new();

        assert!(defrag.push(&fragment(7, 32, false, &payload[32..])).unwrap().is_none());
        assert!(defrag.push(&fragment(7, 0, true, &payload[..16])).unwrap().is_none());
        let whole = defrag.push(&fragment(7, 16, true, &payload[16..32])).unwrap().unwrap();

        assert_eq!(whole.len(), 60);
        assert_eq!(&whole[20..], payload.as_slice());
        assert!(!is_fragment(&whole));
        assert_eq!(u16::from_be_bytes([whole[2], whole[3]]), 60);
        assert_eq!(Checksum::compute(&whole[..20]).finalize(), 0xffff);
        assert_eq!(defrag.pending_len(), 0);
    }

    #[test]
    fn separate_ids_do_not_mix() {
        let mut defrag = Ipv4Defragmenter::new();
        assert!(defrag.push(&fragment(1, 0, true, &[1; 8])).unwrap().is_none());
        assert!(defrag.push(&fragment(2, 8, false, &[2; 4])).unwrap().is_none());
        assert_eq!(defrag.pending_len(), 2);
    }

    #[test]
    fn stale_fragments_are_dropped() {
        let mut defrag = Ipv4Defragmenter::new();
        let start = Instant::now();
        defrag.push_at(&fragment(9, 0, true, &[0; 8]), start).unwrap();
        let later = start + FRAGMENT_TIMEOUT + Duration::from_secs(1);
        let out = defrag.push_at(&fragment(9, 8, false, &[0; 8]), later).unwrap();
        assert!(out.is_none());
        assert_eq!(defrag.pending_len(), 1);
    }

    #[test]
    fn oversized_rebuild_from_long_first_header_is_rejected() {
        let mut defrag = Ipv4Defragmenter::new();
        // Each fragment fits on its own; the 60-byte first header pushes
        // the rebuilt datagram past 65535.
        let first = fragment_with_header(4, 0, true, &vec![0; 65_472], 60);
        assert!(defrag.push(&first).unwrap().is_none());
        let err = defrag.push(&fragment(4, 65_472, false, &[0; 40])).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
        assert_eq!(defrag.pending_len(), 0);
    }

    #[test]
    fn long_first_header_is_kept() {
        let payload: Vec<u8> = (0..24u8).collect();
        let mut defrag = Ipv4Defragmenter::new();
        assert!(defrag
            .push(&fragment_with_header(5, 0, true, &payload[..16], 24))
            .unwrap()
            .is_none());
        let whole = defrag.push(&fragment(5, 16, false, &payload[16..])).unwrap().unwrap();
        assert_eq!(whole.len(), 48);
        assert_eq!(whole[0] & 0x0f, 6);
        assert_eq!(&whole[24..], payload.as_slice());
        assert_eq!(Checksum::compute(&whole[..24]).finalize(), 0xffff);
    }

    #[test]
    fn rejects_unaligned_middle_fragment() {
        let mut defrag = Ipv4Defragmenter::new();
        let err = defrag.push(&fragment(3, 0, true, &[0; 7])).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }
}
