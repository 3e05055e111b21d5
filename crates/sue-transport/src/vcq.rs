//! # VC queue bank
//!
//! A bank of byte-bounded FIFO queues, one per virtual channel, with a
//! reservation sub-allocator. Upper layers reserve space before packing a
//! burst so a port is guaranteed to accept the frame once it is built;
//! reservations count against capacity but hold no bytes.
//!
//! Invariant: `bytes(vc) + reserved(vc) <= max_bytes` for every VC.

use crate::packet::Packet;
use std::collections::VecDeque;
use sue_common::Vc;
use tracing::warn;

pub struct VcQueueBank {
    max_bytes: u32,
    /// Extra bytes added to every reservation to cover link-layer headers.
    additional_header_size: u32,
    queues: Vec<VecDeque<Packet>>,
    bytes: Vec<u32>,
    reserved: Vec<u32>,
}

impl VcQueueBank {
    pub fn new(num_vcs: u8, max_bytes: u32, additional_header_size: u32) -> Self {
        let n = num_vcs as usize;
        VcQueueBank {
            max_bytes,
            additional_header_size,
            queues: (0..n).map(|_| VecDeque::new()).collect(),
            bytes: vec![0; n],
            reserved: vec![0; n],
        }
    }

    pub fn num_vcs(&self) -> u8 {
        self.queues.len() as u8
    }

    pub fn max_bytes(&self) -> u32 {
        self.max_bytes
    }

    /// Enqueue a packet; the packet is handed back on a full queue so the
    /// caller can record the drop.
    pub fn enqueue(&mut self, vc: Vc, pkt: Packet) -> Result<(), Packet> {
        let i = vc.index();
        let len = pkt.len() as u32;
        if self.bytes[i] + len > self.max_bytes {
            return Err(pkt);
        }
        self.bytes[i] += len;
        self.queues[i].push_back(pkt);
        Ok(())
    }

    pub fn dequeue(&mut self, vc: Vc) -> Option<Packet> {
        let i = vc.index();
        let pkt = self.queues[i].pop_front()?;
        self.bytes[i] -= pkt.len() as u32;
        Some(pkt)
    }

    pub fn is_empty(&self, vc: Vc) -> bool {
        self.queues[vc.index()].is_empty()
    }

    pub fn len(&self, vc: Vc) -> usize {
        self.queues[vc.index()].len()
    }

    pub fn bytes(&self, vc: Vc) -> u32 {
        self.bytes[vc.index()]
    }

    pub fn reserved(&self, vc: Vc) -> u32 {
        self.reserved[vc.index()]
    }

    /// Capacity not yet used or reserved.
    pub fn available(&self, vc: Vc) -> u32 {
        let used = self.bytes[vc.index()] + self.reserved[vc.index()];
        self.max_bytes.saturating_sub(used)
    }

    /// Reserve `amount + additional_header_size` bytes if they fit.
    pub fn reserve(&mut self, vc: Vc, amount: u32) -> bool {
        let total = amount + self.additional_header_size;
        if self.available(vc) < total {
            return false;
        }
        self.reserved[vc.index()] += total;
        true
    }

    /// Release a matching reservation. An overshoot clamps to zero with a
    /// warning rather than corrupting the allocator.
    pub fn release(&mut self, vc: Vc, amount: u32) {
        let total = amount + self.additional_header_size;
        let r = &mut self.reserved[vc.index()];
        if *r >= total {
            *r -= total;
        } else {
            warn!(
                %vc,
                reserved = *r,
                releasing = total,
                "releasing more VC capacity than reserved; clamping to zero"
            );
            *r = 0;
        }
    }
}
