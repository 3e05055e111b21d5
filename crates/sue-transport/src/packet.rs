//! # Packet store
//!
//! An opaque byte buffer with stacked headers plus typed side-tags. Headers
//! are prepended/stripped front-first, so the outermost header is always at
//! offset zero — mirroring how frames look on the wire.
//!
//! Side-tags travel with the packet (and its clones) but never appear in the
//! bytes: the send timestamp feeds end-to-end delay measurement, and the
//! link sequence number carries LLR numbering between ports.

use crate::wire::WireHeader;
use bytes::BytesMut;
use sue_common::Nanos;

/// Out-of-band metadata attached to a packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketTags {
    /// Simulated time the frame last started transmission at an XPU port.
    pub sent_at: Option<Nanos>,
    /// Link-layer sequence number assigned by the LLR sender.
    pub link_seq: Option<u32>,
}

/// A simulated network packet: header stack + payload bytes + tags.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    buf: BytesMut,
    pub tags: PacketTags,
}

impl Packet {
    /// A packet with `len` zero bytes of payload.
    pub fn new(len: usize) -> Self {
        Packet {
            buf: BytesMut::zeroed(len),
            tags: PacketTags::default(),
        }
    }

    /// An empty packet (headers only, e.g. credit updates and ACK/NACK).
    pub fn empty() -> Self {
        Packet::new(0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Prepend a header to the front of the packet.
    pub fn add_header<H: WireHeader>(&mut self, header: &H) {
        let mut front = BytesMut::with_capacity(H::SIZE + self.buf.len());
        header.encode(&mut front);
        front.extend_from_slice(&self.buf);
        self.buf = front;
    }

    /// Decode the front header without removing it.
    pub fn peek_header<H: WireHeader>(&self) -> Option<H> {
        H::decode(&self.buf)
    }

    /// Decode and strip the front header.
    pub fn remove_header<H: WireHeader>(&mut self) -> Option<H> {
        let h = H::decode(&self.buf)?;
        let _ = self.buf.split_to(H::SIZE);
        Some(h)
    }

    /// Append another packet's bytes to the end (burst packing).
    pub fn append(&mut self, other: &Packet) {
        self.buf.extend_from_slice(&other.buf);
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{CbfcHeader, EthernetHeader, Mac48, PppHeader, SueHeader, PROT_CBFC_UPDATE};

    #[test]
    fn header_stack_is_lifo() {
        let mut p = Packet::new(64);
        p.add_header(&SueHeader::data(1, 2, 1));
        p.add_header(&CbfcHeader::data(1));
        p.add_header(&PppHeader::new(PROT_CBFC_UPDATE));
        assert_eq!(p.len(), 64 + 8 + 2 + 1);

        let ppp = p.remove_header::<PppHeader>().unwrap();
        assert_eq!(ppp.protocol, PROT_CBFC_UPDATE);
        let cbfc = p.remove_header::<CbfcHeader>().unwrap();
        assert_eq!(cbfc.vc_id, 1);
        let sue = p.remove_header::<SueHeader>().unwrap();
        assert_eq!(sue.psn, 1);
        assert_eq!(p.len(), 64);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut p = Packet::empty();
        p.add_header(&EthernetHeader::new(Mac48::from_index(1), Mac48::from_index(2)));
        let before = p.len();
        let h = p.peek_header::<EthernetHeader>().unwrap();
        assert_eq!(h.src, Mac48::from_index(1));
        assert_eq!(p.len(), before);
    }

    #[test]
    fn remove_from_short_buffer_fails() {
        let mut p = Packet::new(3);
        assert!(p.remove_header::<SueHeader>().is_none());
        assert_eq!(p.len(), 3);
    }

    #[test]
    fn append_concatenates_payloads() {
        let mut a = Packet::new(10);
        let b = Packet::new(20);
        a.append(&b);
        assert_eq!(a.len(), 30);
    }

    #[test]
    fn tags_travel_with_clones() {
        let mut p = Packet::new(8);
        p.tags.sent_at = Some(Nanos(42));
        p.tags.link_seq = Some(7);
        let c = p.clone();
        assert_eq!(c.tags.sent_at, Some(Nanos(42)));
        assert_eq!(c.tags.link_seq, Some(7));
    }
}
