//! Packet codec: just enough IPv4/IPv6 and TCP/UDP to rewrite addresses.
//!
//! Decoding never copies more than the datagram itself. Rewriting patches the
//! address fields in a copy of the original bytes and recomputes the IPv4
//! header checksum and the TCP/UDP checksum; payloads are never touched.
//!
//! IPv4 fragments are reassembled before decoding completes. IPv6 packets
//! whose next header is not TCP or UDP (fragments and other extension
//! headers included) decode without a transport layer and pass through
//! untranslated.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Mutex, PoisonError};

use crate::checksum::{pseudo_header, Checksum};
use crate::defrag::{is_fragment, Ipv4Defragmenter};
use crate::error::CodecError;

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkHeader {
    V4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        protocol: u8,
        header_len: usize,
    },
    V6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        next_header: u8,
    },
}

impl NetworkHeader {
    pub fn src(&self) -> IpAddr {
        match self {
            Self::V4 { src, .. } => IpAddr::V4(*src),
            Self::V6 { src, .. } => IpAddr::V6(*src),
        }
    }

    pub fn dst(&self) -> IpAddr {
        match self {
            Self::V4 { dst, .. } => IpAddr::V4(*dst),
            Self::V6 { dst, .. } => IpAddr::V6(*dst),
        }
    }

    pub fn is_v6(&self) -> bool {
        matches!(self, Self::V6 { .. })
    }

    fn header_len(&self) -> usize {
        match self {
            Self::V4 { header_len, .. } => *header_len,
            Self::V6 { .. } => IPV6_HEADER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHeader {
    Tcp { src_port: u16, dst_port: u16 },
    Udp { src_port: u16, dst_port: u16 },
}

impl TransportHeader {
    pub fn src_port(&self) -> u16 {
        match self {
            Self::Tcp { src_port, .. } | Self::Udp { src_port, .. } => *src_port,
        }
    }

    pub fn dst_port(&self) -> u16 {
        match self {
            Self::Tcp { dst_port, .. } | Self::Udp { dst_port, .. } => *dst_port,
        }
    }

    fn protocol(&self) -> u8 {
        match self {
            Self::Tcp { .. } => PROTO_TCP,
            Self::Udp { .. } => PROTO_UDP,
        }
    }
}

/// A decoded datagram together with its wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub network: NetworkHeader,
    /// `None` for anything other than TCP or UDP.
    pub transport: Option<TransportHeader>,
    bytes: Vec<u8>,
}

impl Packet {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn payload(&self) -> &[u8] {
        let start = self.network.header_len()
            + match self.transport {
                Some(TransportHeader::Tcp { .. }) => {
                    usize::from(self.bytes[self.network.header_len() + 12] >> 4) * 4
                }
                Some(TransportHeader::Udp { .. }) => UDP_HEADER,
                None => 0,
            };
        &self.bytes[start..]
    }
}

/// Decoder holding the IPv4 reassembly state.
pub struct PacketCodec {
    defrag: Mutex<Ipv4Defragmenter>,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            defrag: Mutex::new(Ipv4Defragmenter::new()),
        }
    }

    /// Decode one datagram.
    ///
    /// `Ok(None)` means the bytes were an IPv4 fragment and the datagram is
    /// not complete yet.
    pub fn decode(&self, bytes: &[u8]) -> Result<Option<Packet>, CodecError> {
        let first = *bytes.first().ok_or(CodecError::Truncated {
            needed: 1,
            actual: 0,
        })?;
        match first >> 4 {
            4 => self.decode_v4(bytes),
            6 => decode_v6(bytes).map(Some),
            version => Err(CodecError::UnsupportedVersion(version)),
        }
    }

    fn decode_v4(&self, bytes: &[u8]) -> Result<Option<Packet>, CodecError> {
        require(bytes, IPV4_MIN_HEADER)?;
        let header_len = usize::from(bytes[0] & 0x0f) * 4;
        if header_len < IPV4_MIN_HEADER {
            return Err(CodecError::Malformed(format!(
                "IPv4 header length {header_len} below minimum"
            )));
        }
        require(bytes, header_len)?;
        let total_len = usize::from(u16::from_be_bytes([bytes[2], bytes[3]]));
        if total_len < header_len {
            return Err(CodecError::Malformed(format!(
                "IPv4 total length {total_len} shorter than header"
            )));
        }
        require(bytes, total_len)?;
        let datagram = &bytes[..total_len];

        if is_fragment(datagram) {
            let whole = self
                .defrag
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(datagram)?;
            return match whole {
                Some(whole) => parse_v4(whole).map(Some),
                None => Ok(None),
            };
        }
        parse_v4(datagram.to_vec()).map(Some)
    }

    /// Copy `packet` with new source and destination addresses.
    ///
    /// Both addresses must be of the packet's family.
    pub fn rewrite(
        &self,
        packet: &Packet,
        new_src: IpAddr,
        new_dst: IpAddr,
    ) -> Result<Vec<u8>, CodecError> {
        let mut out = packet.bytes.clone();
        match (packet.network, new_src, new_dst) {
            (NetworkHeader::V4 { header_len, .. }, IpAddr::V4(src), IpAddr::V4(dst)) => {
                out[12..16].copy_from_slice(&src.octets());
                out[16..20].copy_from_slice(&dst.octets());
                out[10..12].copy_from_slice(&[0, 0]);
                let csum = Checksum::compute(&out[..header_len]).header_value();
                out[10..12].copy_from_slice(&csum.to_be_bytes());
            }
            (NetworkHeader::V6 { .. }, IpAddr::V6(src), IpAddr::V6(dst)) => {
                out[8..24].copy_from_slice(&src.octets());
                out[24..40].copy_from_slice(&dst.octets());
            }
            _ => return Err(CodecError::AddressFamilyMismatch),
        }
        if let Some(transport) = packet.transport {
            fill_transport_checksum(
                &mut out,
                packet.network.header_len(),
                transport.protocol(),
                new_src,
                new_dst,
            );
        }
        Ok(out)
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// Build a complete datagram carrying `payload`.
///
/// TCP segments get a bare 20-byte header with PSH|ACK set and zero
/// sequence numbers; enough for tests and synthetic probes.
pub fn encode(
    src: IpAddr,
    dst: IpAddr,
    transport: TransportHeader,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let mut segment = match transport {
        TransportHeader::Tcp { src_port, dst_port } => {
            let mut tcp = vec![0u8; TCP_MIN_HEADER];
            tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
            tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
            tcp[12] = 5 << 4;
            tcp[13] = 0x18;
            tcp[14..16].copy_from_slice(&u16::MAX.to_be_bytes());
            tcp
        }
        TransportHeader::Udp { src_port, dst_port } => {
            let mut udp = vec![0u8; UDP_HEADER];
            udp[0..2].copy_from_slice(&src_port.to_be_bytes());
            udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
            let len = (UDP_HEADER + payload.len()) as u16;
            udp[4..6].copy_from_slice(&len.to_be_bytes());
            udp
        }
    };
    segment.extend_from_slice(payload);

    let mut out = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total = IPV4_MIN_HEADER + segment.len();
            if total > usize::from(u16::MAX) {
                return Err(CodecError::Malformed("payload too large".to_string()));
            }
            let mut header = vec![0u8; IPV4_MIN_HEADER];
            header[0] = 0x45;
            header[2..4].copy_from_slice(&(total as u16).to_be_bytes());
            header[6] = 0x40;
            header[8] = 64;
            header[9] = transport.protocol();
            header[12..16].copy_from_slice(&s.octets());
            header[16..20].copy_from_slice(&d.octets());
            let csum = Checksum::compute(&header).header_value();
            header[10..12].copy_from_slice(&csum.to_be_bytes());
            header
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            if segment.len() > usize::from(u16::MAX) {
                return Err(CodecError::Malformed("payload too large".to_string()));
            }
            let mut header = vec![0u8; IPV6_HEADER];
            header[0] = 0x60;
            header[4..6].copy_from_slice(&(segment.len() as u16).to_be_bytes());
            header[6] = transport.protocol();
            header[7] = 64;
            header[8..24].copy_from_slice(&s.octets());
            header[24..40].copy_from_slice(&d.octets());
            header
        }
        _ => return Err(CodecError::AddressFamilyMismatch),
    };
    let offset = out.len();
    out.extend_from_slice(&segment);
    fill_transport_checksum(&mut out, offset, transport.protocol(), src, dst);
    Ok(out)
}

fn require(bytes: &[u8], needed: usize) -> Result<(), CodecError> {
    if bytes.len() < needed {
        return Err(CodecError::Truncated {
            needed,
            actual: bytes.len(),
        });
    }
    Ok(())
}

fn parse_v4(bytes: Vec<u8>) -> Result<Packet, CodecError> {
    let header_len = usize::from(bytes[0] & 0x0f) * 4;
    let protocol = bytes[9];
    let network = NetworkHeader::V4 {
        src: Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]),
        dst: Ipv4Addr::new(bytes[16], bytes[17], bytes[18], bytes[19]),
        protocol,
        header_len,
    };
    let transport = parse_transport(&bytes[header_len..], protocol)?;
    Ok(Packet {
        network,
        transport,
        bytes,
    })
}

fn decode_v6(bytes: &[u8]) -> Result<Packet, CodecError> {
    require(bytes, IPV6_HEADER)?;
    let payload_len = usize::from(u16::from_be_bytes([bytes[4], bytes[5]]));
    require(bytes, IPV6_HEADER + payload_len)?;
    let bytes = &bytes[..IPV6_HEADER + payload_len];

    let octets = |range: std::ops::Range<usize>| -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(&bytes[range]);
        out
    };
    let next_header = bytes[6];
    let network = NetworkHeader::V6 {
        src: Ipv6Addr::from(octets(8..24)),
        dst: Ipv6Addr::from(octets(24..40)),
        next_header,
    };
    let transport = parse_transport(&bytes[IPV6_HEADER..], next_header)?;
    Ok(Packet {
        network,
        transport,
        bytes: bytes.to_vec(),
    })
}

fn parse_transport(segment: &[u8], protocol: u8) -> Result<Option<TransportHeader>, CodecError> {
    let ports = |s: &[u8]| {
        (
            u16::from_be_bytes([s[0], s[1]]),
            u16::from_be_bytes([s[2], s[3]]),
        )
    };
    match protocol {
        PROTO_TCP => {
            require(segment, TCP_MIN_HEADER)?;
            let data_offset = usize::from(segment[12] >> 4) * 4;
            if data_offset < TCP_MIN_HEADER || data_offset > segment.len() {
                return Err(CodecError::Malformed(format!(
                    "TCP data offset {data_offset} out of range"
                )));
            }
            let (src_port, dst_port) = ports(segment);
            Ok(Some(TransportHeader::Tcp { src_port, dst_port }))
        }
        PROTO_UDP => {
            require(segment, UDP_HEADER)?;
            let (src_port, dst_port) = ports(segment);
            Ok(Some(TransportHeader::Udp { src_port, dst_port }))
        }
        _ => Ok(None),
    }
}

fn fill_transport_checksum(out: &mut [u8], offset: usize, protocol: u8, src: IpAddr, dst: IpAddr) {
    let field = match protocol {
        PROTO_TCP => offset + 16,
        PROTO_UDP => offset + 6,
        _ => return,
    };
    out[field..field + 2].copy_from_slice(&[0, 0]);
    let segment = &out[offset..];
    let mut csum = pseudo_header(src, dst, protocol, segment.len());
    csum.add_bytes(segment);
    let mut value = csum.header_value();
    if protocol == PROTO_UDP && value == 0 {
        value = 0xffff;
    }
    out[field..field + 2].copy_from_slice(&value.to_be_bytes());
}
