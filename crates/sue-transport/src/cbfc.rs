//! # CBFC — Credit-Based Flow Control
//!
//! Symmetric per-(peer MAC, VC) credit accounting between two connected
//! ports. The sender side tracks how many frames may still be put on the
//! wire; the receiver side accumulates consumed frames until a batch is
//! worth signalling back as a credit-update frame.
//!
//! This is pure accounting: building the credit-update frame and scheduling
//! it onto the main queue is the port pipeline's job.

use crate::wire::Mac48;
use std::collections::BTreeMap;
use sue_common::Vc;
use thiserror::Error;

/// Credit invariant violations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CreditError {
    #[error("credit overflow for peer {peer} {vc}: {credits} exceeds ceiling {ceiling}")]
    Overflow {
        peer: Mac48,
        vc: Vc,
        credits: u64,
        ceiling: u32,
    },
}

/// Per-port credit manager.
pub struct CbfcManager {
    enabled: bool,
    num_vcs: u8,
    batch_size: u32,
    /// Credits above this are an invariant breach.
    ceiling: u32,
    tx_credits: BTreeMap<(Mac48, Vc), u32>,
    rx_to_return: BTreeMap<(Mac48, Vc), u32>,
}

impl CbfcManager {
    pub fn new(enabled: bool, num_vcs: u8, batch_size: u32, ceiling: u32) -> Self {
        CbfcManager {
            enabled,
            num_vcs,
            batch_size: batch_size.max(1),
            ceiling,
            tx_credits: BTreeMap::new(),
            rx_to_return: BTreeMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Seed both maps for a peer device with `initial` credits on every VC.
    pub fn add_peer(&mut self, peer: Mac48, initial: u32) {
        for vc in 0..self.num_vcs {
            self.tx_credits.insert((peer, Vc(vc)), initial);
            self.rx_to_return.insert((peer, Vc(vc)), 0);
        }
    }

    pub fn tx_credits(&self, peer: Mac48, vc: Vc) -> u32 {
        self.tx_credits.get(&(peer, vc)).copied().unwrap_or(0)
    }

    /// Atomically consume one transmit credit. Always succeeds when CBFC is
    /// disabled; never drives a balance below zero.
    pub fn try_consume(&mut self, peer: Mac48, vc: Vc) -> bool {
        if !self.enabled {
            return true;
        }
        match self.tx_credits.get_mut(&(peer, vc)) {
            Some(c) if *c > 0 => {
                *c -= 1;
                true
            }
            _ => false,
        }
    }

    /// Add credits granted by a peer's credit-update frame. Returns the new
    /// balance; a balance beyond the ceiling is clamped and reported.
    pub fn grant(&mut self, peer: Mac48, vc: Vc, n: u32) -> Result<u32, CreditError> {
        let entry = self.tx_credits.entry((peer, vc)).or_insert(0);
        let raised = u64::from(*entry) + u64::from(n);
        if raised > u64::from(self.ceiling) {
            *entry = self.ceiling;
            return Err(CreditError::Overflow {
                peer,
                vc,
                credits: raised,
                ceiling: self.ceiling,
            });
        }
        *entry = raised as u32;
        Ok(*entry)
    }

    /// Record one frame consumed from `peer` on `vc`, to be returned later.
    pub fn account_rx(&mut self, peer: Mac48, vc: Vc) {
        if !self.enabled {
            return;
        }
        *self.rx_to_return.entry((peer, vc)).or_insert(0) += 1;
    }

    pub fn credits_to_return(&self, peer: Mac48, vc: Vc) -> u32 {
        self.rx_to_return.get(&(peer, vc)).copied().unwrap_or(0)
    }

    /// If the accumulated count has reached the batch size, take up to one
    /// credit-update frame's worth (the header field is a single byte) and
    /// return it. Below the batch threshold, or with CBFC disabled, nothing
    /// happens.
    pub fn take_batch(&mut self, peer: Mac48, vc: Vc) -> Option<u8> {
        if !self.enabled {
            return None;
        }
        let counter = self.rx_to_return.get_mut(&(peer, vc))?;
        if *counter < self.batch_size {
            return None;
        }
        let take = (*counter).min(u8::MAX as u32);
        *counter -= take;
        Some(take as u8)
    }

    /// Snapshot of all transmit balances, for the credit log sink.
    pub fn tx_snapshot(&self) -> impl Iterator<Item = (Mac48, Vc, u32)> + '_ {
        self.tx_credits.iter().map(|(&(m, v), &c)| (m, v, c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mgr(enabled: bool, batch: u32) -> CbfcManager {
        let mut m = CbfcManager::new(enabled, 4, batch, 1 << 20);
        m.add_peer(Mac48::from_index(1), 8);
        m
    }

    const PEER: fn() -> Mac48 = || Mac48::from_index(1);

    // ─── Consume / grant ────────────────────────────────────────────────

    #[test]
    fn consume_decrements_until_empty() {
        let mut m = mgr(true, 1);
        for _ in 0..8 {
            assert!(m.try_consume(PEER(), Vc(0)));
        }
        assert!(!m.try_consume(PEER(), Vc(0)));
        assert_eq!(m.tx_credits(PEER(), Vc(0)), 0);
        // Other VCs untouched.
        assert_eq!(m.tx_credits(PEER(), Vc(1)), 8);
    }

    #[test]
    fn disabled_always_consumes() {
        let mut m = mgr(false, 1);
        for _ in 0..100 {
            assert!(m.try_consume(PEER(), Vc(0)));
        }
        assert_eq!(m.tx_credits(PEER(), Vc(0)), 8);
    }

    #[test]
    fn unknown_peer_has_no_credits() {
        let mut m = mgr(true, 1);
        assert!(!m.try_consume(Mac48::from_index(99), Vc(0)));
    }

    #[test]
    fn grant_raises_balance() {
        let mut m = mgr(true, 1);
        assert_eq!(m.grant(PEER(), Vc(2), 5).unwrap(), 13);
    }

    #[test]
    fn grant_past_ceiling_clamps_and_errors() {
        let mut m = CbfcManager::new(true, 1, 1, 10);
        m.add_peer(PEER(), 8);
        let err = m.grant(PEER(), Vc(0), 5).unwrap_err();
        assert!(matches!(err, CreditError::Overflow { .. }));
        assert_eq!(m.tx_credits(PEER(), Vc(0)), 10);
    }

    // ─── Receive-side batching ──────────────────────────────────────────

    #[test]
    fn batch_released_only_at_threshold() {
        let mut m = mgr(true, 4);
        for _ in 0..3 {
            m.account_rx(PEER(), Vc(0));
            assert_eq!(m.take_batch(PEER(), Vc(0)), None);
        }
        m.account_rx(PEER(), Vc(0));
        assert_eq!(m.take_batch(PEER(), Vc(0)), Some(4));
        assert_eq!(m.credits_to_return(PEER(), Vc(0)), 0);
    }

    #[test]
    fn batch_caps_at_header_width() {
        let mut m = mgr(true, 1);
        for _ in 0..300 {
            m.account_rx(PEER(), Vc(0));
        }
        assert_eq!(m.take_batch(PEER(), Vc(0)), Some(255));
        // Remainder stays accumulated for the next batch.
        assert_eq!(m.credits_to_return(PEER(), Vc(0)), 45);
    }

    #[test]
    fn disabled_never_accumulates() {
        let mut m = mgr(false, 1);
        m.account_rx(PEER(), Vc(0));
        assert_eq!(m.credits_to_return(PEER(), Vc(0)), 0);
        assert_eq!(m.take_batch(PEER(), Vc(0)), None);
    }

    // ─── Conservation (law L2 shape) ────────────────────────────────────

    #[test]
    fn consumed_equals_returned_plus_pending() {
        let mut sender = mgr(true, 3);
        let mut receiver = mgr(true, 3);
        let me = Mac48::from_index(2);
        receiver.add_peer(me, 0);

        let mut consumed = 0u32;
        let mut returned = 0u32;
        for _ in 0..10 {
            if sender.try_consume(PEER(), Vc(0)) {
                consumed += 1;
                receiver.account_rx(me, Vc(0));
                if let Some(batch) = receiver.take_batch(me, Vc(0)) {
                    returned += u32::from(batch);
                    sender.grant(PEER(), Vc(0), u32::from(batch)).unwrap();
                }
            }
        }
        let pending = receiver.credits_to_return(me, Vc(0));
        assert_eq!(consumed, returned + pending);
        assert!(pending < 3, "pending return credits stay under batch size");
    }
}
