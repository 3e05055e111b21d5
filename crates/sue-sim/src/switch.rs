//! Switch forwarding plane.
//!
//! A switch node is a set of ports sharing one static MAC-indexed
//! forwarding table. The ingress port's processing queue drives forwarding:
//! on completion the destination MAC selects a local egress port, the
//! Ethernet source is rewritten to the ingress port's MAC (so downstream
//! CBFC attributes credits back to the ingress), the frame is LLR-numbered
//! for the internal link, and the handoff is scheduled after the switch
//! forward delay. Internal CBFC gates the handoff; without credit the
//! pipeline parks until a grant arrives.

use crate::logging::Direction;
use crate::port::Port;
use crate::world::{Ctx, Event};
use std::collections::HashMap;
use std::sync::Arc;
use sue_common::PortId;
use sue_transport::{CbfcHeader, EthernetHeader, Mac48, PppHeader, ETH_P_IPV4};
use tracing::warn;

/// One forwarding-table entry: the local egress port for a destination MAC.
#[derive(Debug, Clone, Copy)]
pub struct SwitchRoute {
    pub egress: PortId,
    pub egress_mac: Mac48,
}

/// Build the forwarding table for one switch from (attached MAC, local
/// egress port) pairs. Shared read-only by every port of the switch.
pub fn build_forwarding_table(
    entries: impl IntoIterator<Item = (Mac48, PortId, Mac48)>,
) -> Arc<HashMap<Mac48, SwitchRoute>> {
    Arc::new(
        entries
            .into_iter()
            .map(|(dst, egress, egress_mac)| (dst, SwitchRoute { egress, egress_mac }))
            .collect(),
    )
}

impl Port {
    /// Processing-queue completion on a switch port.
    pub(crate) fn complete_processing_switch(&mut self, ctx: &mut Ctx) {
        let Some(front) = self.processing_queue.front() else {
            self.is_processing = false;
            return;
        };
        let Some(eth) = front.pkt.peek_header::<EthernetHeader>() else {
            // Unparseable: discard and move on.
            self.discard_front(ctx);
            return;
        };
        let route = self
            .forwarding
            .as_ref()
            .and_then(|t| t.get(&eth.dst).copied());
        let Some(route) = route else {
            warn!(port = %self.id, dst = %eth.dst, "no forwarding entry; frame discarded");
            self.discard_front(ctx);
            return;
        };
        let vc = front.vc;
        let upstream = front.src;

        if route.egress == self.id {
            // This port is already the egress: re-emit on the wire.
            let Some(item) = self.processing_queue.pop_front() else {
                return;
            };
            let size = item.pkt.len();
            self.processing_bytes -= size as u32;
            self.enqueue_to_vc(item.pkt, ctx);
            self.cbfc.account_rx(upstream, vc);
            self.maybe_return(upstream, vc, ctx);
            self.log_switch_rx(vc, size, ctx);
            self.start_processing(ctx);
            return;
        }

        // An active retransmission on the internal link takes precedence
        // over forwarding new frames.
        let resending = self
            .llr
            .as_ref()
            .is_some_and(|l| l.is_resending(route.egress_mac, vc));
        if resending {
            let resent = self
                .llr
                .as_mut()
                .and_then(|l| l.take_resend(route.egress_mac, vc));
            if let Some(pkt) = resent {
                ctx.queue.schedule(
                    ctx.cfg.switch_forward_delay,
                    Event::EnqueueToVc(route.egress, pkt),
                );
                self.arm_resend_timer(route.egress_mac, vc, ctx);
            }
            // The head frame stays; rerun processing for it.
            self.start_processing(ctx);
            return;
        }

        // Internal credit gate: without a credit toward the egress the
        // frame stays at the head and the pipeline parks until a grant.
        if !self.cbfc.try_consume(route.egress_mac, vc) {
            self.processing_stalled = true;
            return;
        }
        if self.cbfc.is_enabled() {
            ctx.logger.credit_change(
                ctx.now(),
                self.node,
                self.local_index,
                vc,
                Direction::Tx,
                self.cbfc.tx_credits(route.egress_mac, vc),
                route.egress_mac,
            );
        }

        let Some(mut item) = self.processing_queue.pop_front() else {
            return;
        };
        let size = item.pkt.len();
        self.processing_bytes -= size as u32;

        // Rewrite the source MAC so downstream credit accounting points at
        // this ingress port.
        if let Some(mut eth) = item.pkt.remove_header::<EthernetHeader>() {
            eth.src = self.mac;
            item.pkt.add_header(&eth);
        }

        // LLR-number the internal link and re-wrap for the handoff.
        item.pkt.add_header(&CbfcHeader::data(vc.0));
        item.pkt.add_header(&PppHeader::new(ETH_P_IPV4));
        if let Some(llr) = self.llr.as_mut() {
            llr.register_send(route.egress_mac, vc, &mut item.pkt);
        }
        if self.llr.is_some() {
            self.arm_resend_timer(route.egress_mac, vc, ctx);
        }
        ctx.queue.schedule(
            ctx.cfg.switch_forward_delay,
            Event::EnqueueToVc(route.egress, item.pkt),
        );

        // Credit the upstream neighbour for the consumed frame.
        self.cbfc.account_rx(upstream, vc);
        self.maybe_return(upstream, vc, ctx);
        self.log_switch_rx(vc, size, ctx);
        self.start_processing(ctx);
    }

    fn discard_front(&mut self, ctx: &mut Ctx) {
        if let Some(item) = self.processing_queue.pop_front() {
            self.processing_bytes -= item.pkt.len() as u32;
        }
        self.start_processing(ctx);
    }

    fn log_switch_rx(&mut self, vc: sue_common::Vc, size: usize, ctx: &mut Ctx) {
        ctx.logger.processing_queue(
            ctx.now(),
            self.node,
            self.local_index,
            self.processing_bytes,
            self.processing_max,
        );
        ctx.logger.packet(
            ctx.now(),
            self.node,
            self.local_index,
            Some(vc),
            Direction::Rx,
            size,
        );
    }
}
