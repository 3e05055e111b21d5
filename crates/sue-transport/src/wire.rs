//! # SUE Wire Format
//!
//! Codecs for every header a link frame can carry, outermost first:
//!
//! ```text
//! +-----+------+----------+------+-----+-----+---------+
//! | PPP | CBFC | Ethernet | IPv4 | UDP | SUE | payload |
//! +-----+------+----------+------+-----+-----+---------+
//!   1B     2B      14B       20B    8B    8B
//! ```
//!
//! Credit updates and ACK/NACK stop after the Ethernet header. The link
//! sequence number is carried as a packet side-tag, never inside the PPP
//! byte.
//!
//! All fields are MSB-first on the wire.

use bytes::{Buf, BufMut, BytesMut};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

// ─── Protocol numbers ───────────────────────────────────────────────────────

/// Ethernet-level protocol id for IPv4 data frames.
pub const ETH_P_IPV4: u16 = 0x0800;
/// Ethernet-level protocol id for IPv6 (recognised, never generated).
pub const ETH_P_IPV6: u16 = 0x86DD;
/// Credit-update frames.
pub const PROT_CBFC_UPDATE: u16 = 0xCBFC;
/// LLR acknowledgement frames.
pub const ACK_REV: u16 = 0x1111;
/// LLR negative-acknowledgement frames.
pub const NACK_REV: u16 = 0x2222;

/// Map an Ethernet-level protocol number to its 1-byte PPP id.
pub fn ether_to_ppp(proto: u16) -> Option<u8> {
    match proto {
        ETH_P_IPV4 => Some(0x21),
        ETH_P_IPV6 => Some(0x57),
        PROT_CBFC_UPDATE => Some(0xFB),
        ACK_REV => Some(0x11),
        NACK_REV => Some(0x22),
        _ => None,
    }
}

/// Map a 1-byte PPP id back to its Ethernet-level protocol number.
pub fn ppp_to_ether(ppp: u8) -> Option<u16> {
    match ppp {
        0x21 => Some(ETH_P_IPV4),
        0x57 => Some(ETH_P_IPV6),
        0xFB => Some(PROT_CBFC_UPDATE),
        0x11 => Some(ACK_REV),
        0x22 => Some(NACK_REV),
        _ => None,
    }
}

// ─── Mac48 ──────────────────────────────────────────────────────────────────

/// A 48-bit MAC address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Mac48(pub [u8; 6]);

impl Mac48 {
    pub const BROADCAST: Mac48 = Mac48([0xFF; 6]);

    /// Sequential allocator used at topology construction.
    pub fn from_index(idx: u32) -> Self {
        let b = idx.to_be_bytes();
        Mac48([0x02, 0x00, b[0], b[1], b[2], b[3]])
    }
}

impl fmt::Display for Mac48 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

impl fmt::Debug for Mac48 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mac48({self})")
    }
}

impl FromStr for Mac48 {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut out {
            let p = parts.next().ok_or(())?;
            *byte = u8::from_str_radix(p, 16).map_err(|_| ())?;
        }
        if parts.next().is_some() {
            return Err(());
        }
        Ok(Mac48(out))
    }
}

// ─── Header trait ───────────────────────────────────────────────────────────

/// A fixed-size header that can be stacked onto a packet.
pub trait WireHeader: Sized {
    /// Encoded size in bytes.
    const SIZE: usize;

    /// Append the encoded header to `buf`.
    fn encode(&self, buf: &mut BytesMut);

    /// Decode from the front of `buf`. Returns `None` if `buf` is too short
    /// or the bytes are not a valid instance.
    fn decode(buf: &[u8]) -> Option<Self>;
}

// ─── PPP wrapper ────────────────────────────────────────────────────────────

/// Point-to-point protocol wrapper: a single protocol-id byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PppHeader {
    /// Ethernet-level protocol number (converted to the PPP id on the wire).
    pub protocol: u16,
}

impl PppHeader {
    pub fn new(protocol: u16) -> Self {
        PppHeader { protocol }
    }
}

impl WireHeader for PppHeader {
    const SIZE: usize = 1;

    fn encode(&self, buf: &mut BytesMut) {
        let id = ether_to_ppp(self.protocol).unwrap_or(0x21);
        buf.put_u8(id);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        let protocol = ppp_to_ether(*buf.first()?)?;
        Some(PppHeader { protocol })
    }
}

// ─── CBFC header ────────────────────────────────────────────────────────────

/// Credit-based flow control header. `credits == 0` marks a data frame;
/// nonzero marks a credit update carrying that many credits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbfcHeader {
    pub vc_id: u8,
    pub credits: u8,
}

impl CbfcHeader {
    pub fn data(vc_id: u8) -> Self {
        CbfcHeader { vc_id, credits: 0 }
    }

    pub fn update(vc_id: u8, credits: u8) -> Self {
        CbfcHeader { vc_id, credits }
    }

    pub fn is_data(&self) -> bool {
        self.credits == 0
    }
}

impl WireHeader for CbfcHeader {
    const SIZE: usize = 2;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.vc_id);
        buf.put_u8(self.credits);
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }
        Some(CbfcHeader {
            vc_id: buf[0],
            credits: buf[1],
        })
    }
}

// ─── Ethernet header ────────────────────────────────────────────────────────

/// Ethernet II header; length/type is always IPv4 in this model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: Mac48,
    pub src: Mac48,
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn new(src: Mac48, dst: Mac48) -> Self {
        EthernetHeader {
            dst,
            src,
            ethertype: ETH_P_IPV4,
        }
    }
}

impl WireHeader for EthernetHeader {
    const SIZE: usize = 14;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.dst.0);
        buf.put_slice(&self.src.0);
        buf.put_u16(self.ethertype);
    }

    fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        buf.copy_to_slice(&mut dst);
        buf.copy_to_slice(&mut src);
        let ethertype = buf.get_u16();
        Some(EthernetHeader {
            dst: Mac48(dst),
            src: Mac48(src),
            ethertype,
        })
    }
}

// ─── IPv4 header ────────────────────────────────────────────────────────────

/// Minimal IPv4 header: fixed 20 bytes, UDP payload, no options, checksum
/// left zero (corruption is modelled above this layer).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Header {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub total_len: u16,
}

impl Ipv4Header {
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Self {
        Ipv4Header {
            src,
            dst,
            total_len: (Self::SIZE + payload_len) as u16,
        }
    }
}

impl WireHeader for Ipv4Header {
    const SIZE: usize = 20;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(0x45); // version 4, IHL 5
        buf.put_u8(0); // DSCP/ECN
        buf.put_u16(self.total_len);
        buf.put_u16(0); // identification
        buf.put_u16(0); // flags/fragment offset
        buf.put_u8(64); // TTL
        buf.put_u8(17); // protocol: UDP
        buf.put_u16(0); // checksum (unused in the model)
        buf.put_slice(&self.src.octets());
        buf.put_slice(&self.dst.octets());
    }

    fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE || buf[0] != 0x45 {
            return None;
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]);
        let src = Ipv4Addr::new(buf[12], buf[13], buf[14], buf[15]);
        let dst = Ipv4Addr::new(buf[16], buf[17], buf[18], buf[19]);
        Some(Ipv4Header {
            src,
            dst,
            total_len,
        })
    }
}

// ─── UDP header ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub len: u16,
}

impl UdpHeader {
    pub fn new(src_port: u16, dst_port: u16, payload_len: usize) -> Self {
        UdpHeader {
            src_port,
            dst_port,
            len: (Self::SIZE + payload_len) as u16,
        }
    }
}

impl WireHeader for UdpHeader {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.src_port);
        buf.put_u16(self.dst_port);
        buf.put_u16(self.len);
        buf.put_u16(0); // checksum (unused in the model)
    }

    fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let src_port = buf.get_u16();
        let dst_port = buf.get_u16();
        let len = buf.get_u16();
        Some(UdpHeader {
            src_port,
            dst_port,
            len,
        })
    }
}

// ─── SUE header ─────────────────────────────────────────────────────────────

/// SUE opcode values.
pub const SUE_OP_DATA: u8 = 0;
pub const SUE_OP_ACK: u8 = 1;
pub const SUE_OP_NACK: u8 = 2;

/// The Scale-Up Ethernet reliability header, 8 bytes.
///
/// ```text
/// word0 = op[2] | ver+rsv[4] | xpuid[10] | psn[16]
/// word1 = vc[2] | rsvd[14]               | rpsn[16]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SueHeader {
    /// Operation code: 0=data, 1=ACK, 2=NACK.
    pub op: u8,
    /// Destination XPU id (10 bits).
    pub xpu_id: u16,
    /// Packet sequence number.
    pub psn: u16,
    /// Virtual channel (2 bits).
    pub vc: u8,
    /// Response PSN (used by ACK/NACK opcodes).
    pub rpsn: u16,
}

impl SueHeader {
    pub fn data(psn: u16, xpu_id: u16, vc: u8) -> Self {
        SueHeader {
            op: SUE_OP_DATA,
            xpu_id: xpu_id & 0x03FF,
            psn,
            vc: vc & 0x03,
            rpsn: 0,
        }
    }
}

impl WireHeader for SueHeader {
    const SIZE: usize = 8;

    fn encode(&self, buf: &mut BytesMut) {
        let word0: u32 = (u32::from(self.op & 0x03) << 30)
            | (u32::from(self.xpu_id & 0x03FF) << 16)
            | u32::from(self.psn);
        let word1: u32 = (u32::from(self.vc & 0x03) << 30) | u32::from(self.rpsn);
        buf.put_u32(word0);
        buf.put_u32(word1);
    }

    fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::SIZE {
            return None;
        }
        let word0 = buf.get_u32();
        let word1 = buf.get_u32();
        Some(SueHeader {
            op: ((word0 >> 30) & 0x03) as u8,
            xpu_id: ((word0 >> 16) & 0x03FF) as u16,
            psn: (word0 & 0xFFFF) as u16,
            vc: ((word1 >> 30) & 0x03) as u8,
            rpsn: (word1 & 0xFFFF) as u16,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode<H: WireHeader>(h: &H) -> BytesMut {
        let mut buf = BytesMut::new();
        h.encode(&mut buf);
        assert_eq!(buf.len(), H::SIZE);
        buf
    }

    // ─── Protocol mapping ───────────────────────────────────────────────

    #[test]
    fn ppp_mapping_is_bijective() {
        for proto in [ETH_P_IPV4, ETH_P_IPV6, PROT_CBFC_UPDATE, ACK_REV, NACK_REV] {
            let id = ether_to_ppp(proto).unwrap();
            assert_eq!(ppp_to_ether(id), Some(proto));
        }
        assert_eq!(ether_to_ppp(0x1234), None);
        assert_eq!(ppp_to_ether(0x00), None);
    }

    // ─── Mac48 ──────────────────────────────────────────────────────────

    #[test]
    fn mac_display_and_parse() {
        let mac = Mac48([0x02, 0x00, 0x00, 0x00, 0x00, 0x07]);
        assert_eq!(mac.to_string(), "02:00:00:00:00:07");
        assert_eq!("02:00:00:00:00:07".parse::<Mac48>().unwrap(), mac);
        assert!("02:00:zz:00:00:07".parse::<Mac48>().is_err());
    }

    #[test]
    fn mac_from_index_is_unique() {
        assert_ne!(Mac48::from_index(1), Mac48::from_index(2));
        assert_ne!(Mac48::from_index(255), Mac48::from_index(256));
    }

    // ─── Headers ────────────────────────────────────────────────────────

    #[test]
    fn ppp_carries_only_protocol_id() {
        let buf = encode(&PppHeader::new(PROT_CBFC_UPDATE));
        assert_eq!(&buf[..], &[0xFB]);
        let h = PppHeader::decode(&buf).unwrap();
        assert_eq!(h.protocol, PROT_CBFC_UPDATE);
    }

    #[test]
    fn cbfc_credits_distinguish_data_from_update() {
        let data = CbfcHeader::data(2);
        assert!(data.is_data());
        let upd = CbfcHeader::update(1, 16);
        assert!(!upd.is_data());

        let buf = encode(&upd);
        assert_eq!(&buf[..], &[1, 16]);
        assert_eq!(CbfcHeader::decode(&buf).unwrap(), upd);
    }

    #[test]
    fn ethernet_roundtrip_preserves_macs() {
        let h = EthernetHeader::new(Mac48::from_index(3), Mac48::from_index(9));
        let buf = encode(&h);
        // dst first on the wire
        assert_eq!(&buf[..6], &Mac48::from_index(9).0);
        assert_eq!(EthernetHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn ipv4_layout() {
        let h = Ipv4Header::new(
            Ipv4Addr::new(10, 1, 1, 1),
            Ipv4Addr::new(10, 2, 1, 1),
            100,
        );
        let buf = encode(&h);
        assert_eq!(buf[0], 0x45);
        assert_eq!(buf[9], 17); // UDP
        let back = Ipv4Header::decode(&buf).unwrap();
        assert_eq!(back.total_len, 120);
        assert_eq!(back.dst, Ipv4Addr::new(10, 2, 1, 1));
    }

    #[test]
    fn udp_ports_roundtrip() {
        let h = UdpHeader::new(49152, 8081, 256);
        let back = UdpHeader::decode(&encode(&h)).unwrap();
        assert_eq!(back.src_port, 49152);
        assert_eq!(back.dst_port, 8081);
        assert_eq!(back.len, 264);
    }

    #[test]
    fn sue_header_bit_packing() {
        let h = SueHeader {
            op: 2,
            xpu_id: 0x3FF,
            psn: 0xABCD,
            vc: 3,
            rpsn: 0x1234,
        };
        let buf = encode(&h);
        let word0 = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        assert_eq!(word0 >> 30, 2);
        assert_eq!((word0 >> 16) & 0x3FF, 0x3FF);
        assert_eq!(word0 & 0xFFFF, 0xABCD);
        assert_eq!(SueHeader::decode(&buf).unwrap(), h);
    }

    #[test]
    fn sue_header_masks_oversized_fields() {
        let h = SueHeader::data(1, 0x7FF, 7);
        assert_eq!(h.xpu_id, 0x3FF);
        assert_eq!(h.vc, 3);
    }
}
