//! Property-based tests for the LLR receiver.
//!
//! These drive the receive-side state machine with arbitrary interleavings
//! of in-order frames, duplicates, and gaps, and check that the stream of
//! accepted frames is always strictly increasing from zero and that
//! duplicates never perturb state.

use proptest::prelude::*;
use sue_common::{Nanos, Vc};
use sue_transport::llr::{LlrManager, RxVerdict};
use sue_transport::wire::Mac48;

const TIMEOUT: Nanos = Nanos(5_000);

fn peer() -> Mac48 {
    Mac48::from_index(1)
}

/// One simulated arrival: an offset relative to the receiver's current
/// expectation. Negative offsets are duplicates, zero is in-order, positive
/// offsets are gaps.
fn arrival_offsets() -> impl Strategy<Value = Vec<i32>> {
    prop::collection::vec(-4i32..8, 1..200)
}

proptest! {
    #[test]
    fn accepted_sequences_strictly_increase(offsets in arrival_offsets()) {
        let mut llr = LlrManager::new();
        let mut accepted = Vec::new();
        let mut t = 0u64;

        for off in offsets {
            let expected = llr.expected_seq(peer(), Vc(0));
            let seq = (expected as i64 + off as i64).max(0) as u32;
            t += 1;
            match llr.on_receive(peer(), Vc(0), seq, Nanos(t), TIMEOUT) {
                RxVerdict::Deliver { .. } => accepted.push(seq),
                RxVerdict::Duplicate => prop_assert!(seq < expected),
                RxVerdict::Gap { nack_seq } => {
                    prop_assert!(seq > expected);
                    prop_assert_eq!(nack_seq, expected);
                }
            }
        }

        // Invariant: the accepted stream is exactly 0, 1, 2, ...
        for (i, seq) in accepted.iter().enumerate() {
            prop_assert_eq!(*seq, i as u32);
        }
    }

    #[test]
    fn duplicates_are_idempotent(n in 1u32..50, dup in 0u32..50) {
        prop_assume!(dup < n);
        let mut llr = LlrManager::new();
        for seq in 0..n {
            llr.on_receive(peer(), Vc(0), seq, Nanos(u64::from(seq)), TIMEOUT);
        }
        let expected_before = llr.expected_seq(peer(), Vc(0));

        // Replay an already-accepted frame any number of times.
        for _ in 0..3 {
            let v = llr.on_receive(peer(), Vc(0), dup, Nanos(1_000_000), TIMEOUT);
            prop_assert_eq!(v, RxVerdict::Duplicate);
        }
        prop_assert_eq!(llr.expected_seq(peer(), Vc(0)), expected_before);
    }

    #[test]
    fn sender_window_never_retains_acked_frames(acks in prop::collection::vec(0u32..30, 1..10)) {
        let mut llr = LlrManager::new();
        let mut pkts = Vec::new();
        for _ in 0..30 {
            let mut p = sue_transport::Packet::new(16);
            pkts.push(llr.register_send(peer(), Vc(0), &mut p));
        }

        let mut highest_acked = None::<u32>;
        for ack in acks {
            use sue_transport::llr::AckAction;
            if llr.on_ack(peer(), Vc(0), ack) == AckAction::Accepted {
                highest_acked = Some(highest_acked.map_or(ack, |h| h.max(ack)));
            }
            if let Some(h) = highest_acked {
                // Everything at or below the cumulative ACK must be gone.
                prop_assert_eq!(llr.send_list_len(peer(), Vc(0)), (30 - h - 1) as usize);
            }
        }
    }
}
