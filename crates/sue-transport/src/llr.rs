//! # LLR — Link-Layer Retransmission
//!
//! Per-(peer MAC, VC) go-back-N retransmission with in-order delivery.
//! The sender retains a copy of every unacknowledged frame in a sequence-
//! keyed send list; the receiver accepts only the expected sequence, NACKs
//! the first out-of-order frame, and coalesces ACKs.
//!
//! The manager is a pure state machine: every transition returns a verdict
//! and leaves timer arming, frame construction, and transmission to the
//! port pipeline. The same state serves both the node flavour (retransmits
//! through the port's own TX path) and the switch-port flavour (retransmits
//! across the ingress→egress handoff); only the routing of the resulting
//! actions differs.

use crate::packet::Packet;
use crate::wire::Mac48;
use std::collections::BTreeMap;
use sue_common::{Nanos, Vc};
use tracing::debug;

/// ACKs are coalesced until this many frames are pending acknowledgement.
pub const ACK_COALESCE_THRESHOLD: u32 = 4;

/// Receiver verdict for an arriving data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxVerdict {
    /// In order: deliver upward. `ack` carries a sequence to acknowledge
    /// when the coalescing window closed.
    Deliver { ack: Option<u32> },
    /// Already seen; drop silently.
    Duplicate,
    /// Out of order: drop and NACK `nack_seq` (the first missing frame).
    Gap { nack_seq: u32 },
}

/// Outcome of processing an ACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    /// Stale or unknown sequence; nothing to do.
    Ignore,
    /// Window advanced; the caller cancels the retransmit timer.
    Accepted,
}

/// Outcome of processing a NACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Stale or unknown sequence; nothing to do.
    Ignore,
    /// Retransmission armed from the NACKed sequence; the caller rearms the
    /// retransmit timer and kicks the transmit path.
    Resend,
}

#[derive(Default)]
struct PeerState {
    send_seq: u32,
    expected_seq: u32,
    unacked: u32,
    send_list: BTreeMap<u32, Packet>,
    resend_seq: u32,
    resending: bool,
    waiting_resync: bool,
    last_ack_sent: Nanos,
}

/// Per-port LLR manager. Peer state is kept in key order so retransmission
/// scans are deterministic.
#[derive(Default)]
pub struct LlrManager {
    peers: BTreeMap<(Mac48, Vc), PeerState>,
}

impl LlrManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&mut self, peer: Mac48, vc: Vc) -> &mut PeerState {
        self.peers.entry((peer, vc)).or_default()
    }

    // ─── Sender side ────────────────────────────────────────────────────

    /// Assign the next outgoing sequence toward `peer` on `vc`, tag the
    /// packet with it, and retain a copy for retransmission. The caller
    /// must cancel and rearm the (peer, vc) retransmit timer.
    pub fn register_send(&mut self, peer: Mac48, vc: Vc, pkt: &mut Packet) -> u32 {
        let st = self.state(peer, vc);
        let seq = st.send_seq;
        st.send_seq += 1;
        pkt.tags.link_seq = Some(seq);
        st.send_list.insert(seq, pkt.clone());
        seq
    }

    /// Take the next frame due for retransmission, advancing the resend
    /// pointer. `None` when retransmission is not (or no longer) active.
    pub fn take_resend(&mut self, peer: Mac48, vc: Vc) -> Option<Packet> {
        let st = self.peers.get_mut(&(peer, vc))?;
        if !st.resending {
            return None;
        }
        match st.send_list.get(&st.resend_seq) {
            Some(pkt) => {
                let pkt = pkt.clone();
                st.resend_seq += 1;
                Some(pkt)
            }
            None => {
                st.resending = false;
                None
            }
        }
    }

    /// Retransmit-timer expiry: restart retransmission from the oldest
    /// retained frame. Returns false (clearing the resending flag) when
    /// everything has been acknowledged in the meantime.
    pub fn on_timer(&mut self, peer: Mac48, vc: Vc) -> bool {
        let st = self.state(peer, vc);
        match st.send_list.keys().next() {
            Some(&oldest) => {
                st.resend_seq = oldest;
                st.resending = true;
                true
            }
            None => {
                st.resending = false;
                false
            }
        }
    }

    /// Whether any (peer, vc) on this port has an active retransmission.
    pub fn find_resending(&self) -> Option<(Mac48, Vc)> {
        self.peers
            .iter()
            .find(|(_, st)| st.resending)
            .map(|(&key, _)| key)
    }

    // ─── Receiver side ──────────────────────────────────────────────────

    /// Process an arriving data frame's sequence number.
    pub fn on_receive(
        &mut self,
        peer: Mac48,
        vc: Vc,
        seq: u32,
        now: Nanos,
        ack_timeout: Nanos,
    ) -> RxVerdict {
        let st = self.state(peer, vc);
        if seq == st.expected_seq {
            st.expected_seq += 1;
            st.unacked += 1;
            let ack = if st.unacked > ACK_COALESCE_THRESHOLD
                || now.saturating_sub(st.last_ack_sent) > ack_timeout
            {
                st.unacked = 0;
                st.last_ack_sent = now;
                Some(seq)
            } else {
                None
            };
            st.waiting_resync = false;
            st.resending = false;
            RxVerdict::Deliver { ack }
        } else if seq < st.expected_seq {
            debug!(%peer, %vc, seq, expected = st.expected_seq, "duplicate frame discarded");
            RxVerdict::Duplicate
        } else {
            let nack_seq = st.expected_seq;
            st.resend_seq = nack_seq;
            st.waiting_resync = true;
            debug!(%peer, %vc, seq, expected = nack_seq, "sequence gap; requesting resync");
            RxVerdict::Gap { nack_seq }
        }
    }

    // ─── ACK / NACK processing ──────────────────────────────────────────

    /// Cumulative ACK: everything up to and including `seq` is released.
    ///
    /// Staleness is judged against the send list itself: a sequence no
    /// longer retained is either already acknowledged or was never sent,
    /// and both are ignored. The receiver-side `expected_seq` is never
    /// consulted or written here; on a bidirectional link the two streams
    /// share a (peer, VC) pair and aliasing them corrupts in-order
    /// delivery.
    pub fn on_ack(&mut self, peer: Mac48, vc: Vc, seq: u32) -> AckAction {
        let st = self.state(peer, vc);
        if !st.send_list.contains_key(&seq) {
            return AckAction::Ignore;
        }
        st.send_list = st.send_list.split_off(&(seq + 1));
        st.resending = false;
        AckAction::Accepted
    }

    /// NACK for `seq`: everything before it is implicitly acknowledged and
    /// retransmission restarts at `seq`.
    pub fn on_nack(&mut self, peer: Mac48, vc: Vc, seq: u32) -> NackAction {
        let st = self.state(peer, vc);
        if !st.send_list.contains_key(&seq) {
            return NackAction::Ignore;
        }
        st.send_list = st.send_list.split_off(&seq);
        st.resend_seq = seq;
        st.resending = true;
        NackAction::Resend
    }

    // ─── Introspection ──────────────────────────────────────────────────

    pub fn expected_seq(&self, peer: Mac48, vc: Vc) -> u32 {
        self.peers
            .get(&(peer, vc))
            .map(|s| s.expected_seq)
            .unwrap_or(0)
    }

    pub fn send_list_len(&self, peer: Mac48, vc: Vc) -> usize {
        self.peers
            .get(&(peer, vc))
            .map(|s| s.send_list.len())
            .unwrap_or(0)
    }

    pub fn is_resending(&self, peer: Mac48, vc: Vc) -> bool {
        self.peers
            .get(&(peer, vc))
            .map(|s| s.resending)
            .unwrap_or(false)
    }

    /// Whether the receive side is waiting for the peer to resync after a
    /// sequence gap.
    pub fn is_waiting_resync(&self, peer: Mac48, vc: Vc) -> bool {
        self.peers
            .get(&(peer, vc))
            .map(|s| s.waiting_resync)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEER: fn() -> Mac48 = || Mac48::from_index(5);
    const TIMEOUT: Nanos = Nanos(1_000);

    fn send_one(llr: &mut LlrManager, vc: Vc) -> u32 {
        let mut p = Packet::new(64);
        llr.register_send(PEER(), vc, &mut p)
    }

    // ─── Sender ─────────────────────────────────────────────────────────

    #[test]
    fn sequences_increment_per_peer_vc() {
        let mut llr = LlrManager::new();
        assert_eq!(send_one(&mut llr, Vc(0)), 0);
        assert_eq!(send_one(&mut llr, Vc(0)), 1);
        // Independent sequence space per VC.
        assert_eq!(send_one(&mut llr, Vc(1)), 0);
        assert_eq!(llr.send_list_len(PEER(), Vc(0)), 2);
    }

    #[test]
    fn register_send_tags_the_packet() {
        let mut llr = LlrManager::new();
        let mut p = Packet::new(64);
        let seq = llr.register_send(PEER(), Vc(0), &mut p);
        assert_eq!(p.tags.link_seq, Some(seq));
    }

    // ─── Receiver ───────────────────────────────────────────────────────

    #[test]
    fn in_order_stream_delivers_with_coalesced_acks() {
        let mut llr = LlrManager::new();
        let mut acks = 0;
        for seq in 0..10u32 {
            match llr.on_receive(PEER(), Vc(0), seq, Nanos(seq as u64), TIMEOUT) {
                RxVerdict::Deliver { ack } => {
                    if ack.is_some() {
                        acks += 1;
                    }
                }
                other => panic!("expected Deliver, got {other:?}"),
            }
        }
        assert_eq!(llr.expected_seq(PEER(), Vc(0)), 10);
        // One ACK per 5 frames (threshold 4 exceeded on the 5th).
        assert_eq!(acks, 2);
    }

    #[test]
    fn ack_forced_after_timeout() {
        let mut llr = LlrManager::new();
        llr.on_receive(PEER(), Vc(0), 0, Nanos(0), TIMEOUT);
        // Well past the ACK timeout: even a single frame gets acknowledged.
        let v = llr.on_receive(PEER(), Vc(0), 1, Nanos(10_000), TIMEOUT);
        assert_eq!(v, RxVerdict::Deliver { ack: Some(1) });
    }

    #[test]
    fn duplicate_is_dropped_without_state_change() {
        let mut llr = LlrManager::new();
        llr.on_receive(PEER(), Vc(0), 0, Nanos(0), TIMEOUT);
        llr.on_receive(PEER(), Vc(0), 1, Nanos(1), TIMEOUT);
        let before = llr.expected_seq(PEER(), Vc(0));
        assert_eq!(
            llr.on_receive(PEER(), Vc(0), 0, Nanos(2), TIMEOUT),
            RxVerdict::Duplicate
        );
        assert_eq!(llr.expected_seq(PEER(), Vc(0)), before);
    }

    #[test]
    fn gap_nacks_first_missing_sequence() {
        let mut llr = LlrManager::new();
        llr.on_receive(PEER(), Vc(0), 0, Nanos(0), TIMEOUT);
        // Frame 1 lost; 2 arrives.
        let v = llr.on_receive(PEER(), Vc(0), 2, Nanos(1), TIMEOUT);
        assert_eq!(v, RxVerdict::Gap { nack_seq: 1 });
        // The out-of-order frame is not buffered: expected stays at 1.
        assert_eq!(llr.expected_seq(PEER(), Vc(0)), 1);
    }

    // ─── ACK processing ─────────────────────────────────────────────────

    #[test]
    fn ack_releases_prefix_of_send_list() {
        let mut llr = LlrManager::new();
        for _ in 0..5 {
            send_one(&mut llr, Vc(0));
        }
        assert_eq!(llr.on_ack(PEER(), Vc(0), 2), AckAction::Accepted);
        assert_eq!(llr.send_list_len(PEER(), Vc(0)), 2); // 3 and 4 remain
    }

    #[test]
    fn ack_bookkeeping_leaves_receive_state_alone() {
        // Both directions of a link share the (peer, VC) pair; releasing
        // sent frames must not disturb what we expect to receive next.
        let mut llr = LlrManager::new();
        llr.on_receive(PEER(), Vc(0), 0, Nanos(0), TIMEOUT);
        llr.on_receive(PEER(), Vc(0), 1, Nanos(1), TIMEOUT);
        for _ in 0..8 {
            send_one(&mut llr, Vc(0));
        }
        llr.on_ack(PEER(), Vc(0), 6);
        assert_eq!(llr.expected_seq(PEER(), Vc(0)), 2);
        let v = llr.on_receive(PEER(), Vc(0), 2, Nanos(2), TIMEOUT);
        assert!(matches!(v, RxVerdict::Deliver { .. }));
    }

    #[test]
    fn stale_and_unknown_acks_ignored() {
        let mut llr = LlrManager::new();
        for _ in 0..3 {
            send_one(&mut llr, Vc(0));
        }
        llr.on_ack(PEER(), Vc(0), 1);
        assert_eq!(llr.on_ack(PEER(), Vc(0), 0), AckAction::Ignore); // stale
        assert_eq!(llr.on_ack(PEER(), Vc(0), 9), AckAction::Ignore); // unknown
        assert_eq!(llr.send_list_len(PEER(), Vc(0)), 1);
    }

    // ─── NACK / retransmission ──────────────────────────────────────────

    #[test]
    fn nack_rewinds_to_requested_sequence() {
        let mut llr = LlrManager::new();
        for _ in 0..5 {
            send_one(&mut llr, Vc(0));
        }
        assert_eq!(llr.on_nack(PEER(), Vc(0), 2), NackAction::Resend);
        assert!(llr.is_resending(PEER(), Vc(0)));
        // 0 and 1 implicitly acknowledged.
        assert_eq!(llr.send_list_len(PEER(), Vc(0)), 3);

        // Retransmission walks 2, 3, 4 in order.
        for expect in 2..5u32 {
            let pkt = llr.take_resend(PEER(), Vc(0)).unwrap();
            assert_eq!(pkt.tags.link_seq, Some(expect));
        }
        // Pointer ran off the end of the list.
        assert!(llr.take_resend(PEER(), Vc(0)).is_none());
        assert!(!llr.is_resending(PEER(), Vc(0)));
    }

    #[test]
    fn timer_restarts_from_oldest_unacked() {
        let mut llr = LlrManager::new();
        for _ in 0..3 {
            send_one(&mut llr, Vc(0));
        }
        llr.on_ack(PEER(), Vc(0), 0);
        assert!(llr.on_timer(PEER(), Vc(0)));
        let pkt = llr.take_resend(PEER(), Vc(0)).unwrap();
        assert_eq!(pkt.tags.link_seq, Some(1));
    }

    #[test]
    fn timer_with_empty_list_clears_resending() {
        let mut llr = LlrManager::new();
        send_one(&mut llr, Vc(0));
        llr.on_ack(PEER(), Vc(0), 0);
        assert!(!llr.on_timer(PEER(), Vc(0)));
        assert!(!llr.is_resending(PEER(), Vc(0)));
    }

    #[test]
    fn in_order_receive_clears_resync_state() {
        let mut llr = LlrManager::new();
        llr.on_receive(PEER(), Vc(0), 0, Nanos(0), TIMEOUT);
        llr.on_receive(PEER(), Vc(0), 2, Nanos(1), TIMEOUT); // gap
        assert!(llr.is_waiting_resync(PEER(), Vc(0)));
        let v = llr.on_receive(PEER(), Vc(0), 1, Nanos(2), TIMEOUT); // retransmitted
        assert!(matches!(v, RxVerdict::Deliver { .. }));
        assert_eq!(llr.expected_seq(PEER(), Vc(0)), 2);
        assert!(!llr.is_waiting_resync(PEER(), Vc(0)));
    }

    #[test]
    fn find_resending_reports_active_pair() {
        let mut llr = LlrManager::new();
        assert!(llr.find_resending().is_none());
        for _ in 0..2 {
            send_one(&mut llr, Vc(1));
        }
        llr.on_nack(PEER(), Vc(1), 0);
        assert_eq!(llr.find_resending(), Some((PEER(), Vc(1))));
    }
}
