//! Internet checksum (RFC 1071).
//!
//! [`Checksum`] accumulates a one's complement sum over big-endian 16-bit
//! words and delays folding the carries until [`Checksum::finalize`]. The
//! value written into a header is the complement of the folded sum.

use std::net::IpAddr;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Checksum {
    sum: u32,
    /// A trailing odd byte waiting for its partner.
    pending: Option<u8>,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn compute(bytes: &[u8]) -> Self {
        let mut csum = Self::new();
        csum.add_bytes(bytes);
        csum
    }

    pub fn add_bytes(&mut self, mut bytes: &[u8]) {
        if let Some(hi) = self.pending.take() {
            match bytes.split_first() {
                Some((lo, rest)) => {
                    self.add_word(u16::from_be_bytes([hi, *lo]));
                    bytes = rest;
                }
                None => {
                    self.pending = Some(hi);
                    return;
                }
            }
        }

        let mut chunks = bytes.chunks_exact(2);
        for word in &mut chunks {
            self.add_word(u16::from_be_bytes([word[0], word[1]]));
        }
        if let [last] = chunks.remainder() {
            self.pending = Some(*last);
        }
    }

    fn add_word(&mut self, word: u16) {
        self.sum = self.sum.wrapping_add(u32::from(word));
        // Fold early so long payloads cannot overflow the accumulator.
        if self.sum & 0x8000_0000 != 0 {
            self.sum = (self.sum & 0xFFFF) + (self.sum >> 16);
        }
    }

    /// The folded one's complement sum, before complementing.
    pub fn finalize(&self) -> u16 {
        let mut sum = self.sum;
        if let Some(hi) = self.pending {
            sum += u32::from(hi) << 8;
        }
        while sum > 0xFFFF {
            sum = (sum & 0xFFFF) + (sum >> 16);
        }
        sum as u16
    }

    /// The value stored in a header checksum field.
    pub fn header_value(&self) -> u16 {
        !self.finalize()
    }
}

/// Start a transport checksum with the pseudo-header for `src`/`dst`.
///
/// IPv4 uses the 12-byte form, IPv6 the 40-byte form of RFC 8200 §8.1.
pub fn pseudo_header(src: IpAddr, dst: IpAddr, protocol: u8, upper_len: usize) -> Checksum {
    let mut csum = Checksum::new();
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            csum.add_bytes(&s.octets());
            csum.add_bytes(&d.octets());
            csum.add_bytes(&[0, protocol]);
            csum.add_bytes(&(upper_len as u16).to_be_bytes());
        }
        _ => {
            csum.add_bytes(&ip_octets(src));
            csum.add_bytes(&ip_octets(dst));
            csum.add_bytes(&(upper_len as u32).to_be_bytes());
            csum.add_bytes(&[0, 0, 0, protocol]);
        }
    }
    csum
}

fn ip_octets(ip: IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc1071_example() {
        // RFC 1071 §3 sample data.
        let data = [0x00, 0x01, 0xf2, 0x03, 0xf4, 0xf5, 0xf6, 0xf7];
        assert_eq!(Checksum::compute(&data).finalize(), 0xddf2);
        assert_eq!(Checksum::compute(&data).header_value(), !0xddf2);
    }

    #[test]
    fn split_input_matches_whole() {
        let data: Vec<u8> = (0u8..=250).collect();
        let whole = Checksum::compute(&data);
        let mut parts = Checksum::new();
        parts.add_bytes(&data[..3]);
        parts.add_bytes(&data[3..4]);
        parts.add_bytes(&data[4..101]);
        parts.add_bytes(&data[101..]);
        assert_eq!(whole.finalize(), parts.finalize());
    }

    #[test]
    fn known_ipv4_header() {
        // 192.168.0.1 -> 192.168.0.199, UDP, checksum field zeroed.
        let header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(Checksum::compute(&header).header_value(), 0xb861);
    }
}
