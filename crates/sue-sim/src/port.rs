//! Link-layer port pipeline.
//!
//! Each directional port owns its CBFC credit manager, VC queue bank,
//! optional LLR manager, a high-priority main queue for control frames, and
//! the byte-bounded receive processing queue. Transmit arbitration is
//! strict: main queue, then pending LLR retransmissions, then weighted
//! round-robin over the VC queues gated by credits.
//!
//! Cross-port effects (channel delivery, switch handoff, local credit
//! delivery) are always scheduled events, never direct calls.

use crate::switch::SwitchRoute;
use crate::world::{Ctx, Event};
use crate::logging::{Direction, DropReason};
use rand::rngs::StdRng;
use rand::RngExt as _;
use rand::SeedableRng;
use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use sue_common::{EventHandle, Nanos, NodeId, PortId, PortKind, Rate, Vc, XpuId};
use sue_transport::wire::{ether_to_ppp, SUE_OP_DATA};
use sue_transport::{
    CbfcHeader, CbfcManager, EthernetHeader, Ipv4Header, LlrManager, Mac48, Packet, PppHeader,
    RxVerdict, SueHeader, UdpHeader, VcQueueBank, WireHeader, ACK_REV, ETH_P_IPV4, NACK_REV,
    PROT_CBFC_UPDATE,
};
use tracing::{debug, error, warn};

/// Main queue bound, in frames.
const MAIN_QUEUE_MAX_FRAMES: usize = 1000;

/// A received frame awaiting deserialization. The stored packet starts at
/// the Ethernet header (PPP and CBFC already peeled).
pub(crate) struct ProcessItem {
    pub pkt: Packet,
    pub vc: Vc,
    pub src: Mac48,
}

pub struct Port {
    pub id: PortId,
    pub node: NodeId,
    pub kind: PortKind,
    /// Set for XPU-side ports.
    pub xpu: Option<XpuId>,
    /// Device index within the owning node.
    pub local_index: u32,
    pub mac: Mac48,
    pub ip: Ipv4Addr,
    pub peer_port: PortId,
    pub peer_mac: Mac48,

    link_rate: Rate,
    link_delay: Nanos,
    ifg: Nanos,
    processing_rate: Rate,

    pub cbfc: CbfcManager,
    pub vcq: VcQueueBank,
    pub llr: Option<LlrManager>,

    main_queue: VecDeque<Packet>,

    pub(crate) processing_queue: VecDeque<ProcessItem>,
    pub(crate) processing_bytes: u32,
    pub(crate) processing_max: u32,
    pub(crate) is_processing: bool,
    pub(crate) processing_stalled: bool,

    tx_busy: bool,
    try_transmit_scheduled: bool,
    last_vc: u8,
    /// (upstream MAC, VC) to credit back once the current frame clears the
    /// wire. Switch egress only.
    pending_credit_return: Option<(Mac48, Vc)>,
    /// (len, vc) of the frame on the wire, for the sent-statistics event.
    tx_frame_info: Option<(usize, Option<Vc>)>,

    resend_timers: HashMap<(Mac48, Vc), EventHandle>,
    /// MAC-indexed forwarding shared by all ports of a switch.
    pub(crate) forwarding: Option<Arc<HashMap<Mac48, SwitchRoute>>>,
    /// MACs of sibling ports on the same switch.
    pub(crate) sibling_macs: HashSet<Mac48>,

    error_rate: f64,
    rng: StdRng,
}

// ─── Frame probing helpers ──────────────────────────────────────────────────

/// VC id of a wire frame (`PPP | CBFC | ...`).
pub(crate) fn wire_vc(pkt: &Packet) -> Option<Vc> {
    pkt.as_bytes().get(PppHeader::SIZE).map(|b| Vc(*b))
}

/// Source MAC of a wire frame (`PPP | CBFC | Ethernet | ...`).
pub(crate) fn wire_src_mac(pkt: &Packet) -> Option<Mac48> {
    let off = PppHeader::SIZE + CbfcHeader::SIZE + 6;
    pkt.as_bytes().get(off..off + 6).map(|s| {
        let mut m = [0u8; 6];
        m.copy_from_slice(s);
        Mac48(m)
    })
}

/// SUE header of a frame starting at its Ethernet header.
pub(crate) fn sue_after_eth(pkt: &Packet) -> Option<SueHeader> {
    let off = EthernetHeader::SIZE + Ipv4Header::SIZE + UdpHeader::SIZE;
    pkt.as_bytes().get(off..).and_then(SueHeader::decode)
}

impl Port {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: &crate::config::Params,
        id: PortId,
        node: NodeId,
        kind: PortKind,
        xpu: Option<XpuId>,
        local_index: u32,
        mac: Mac48,
        ip: Ipv4Addr,
    ) -> Self {
        Port {
            id,
            node,
            kind,
            xpu,
            local_index,
            mac,
            ip,
            peer_port: PortId(u32::MAX),
            peer_mac: Mac48::BROADCAST,
            link_rate: cfg.link_data_rate,
            link_delay: cfg.link_delay,
            ifg: Nanos::ZERO,
            processing_rate: cfg.processing_rate,
            cbfc: CbfcManager::new(
                cfg.enable_link_cbfc,
                cfg.num_vcs,
                cfg.credit_batch_size,
                cfg.credit_ceiling,
            ),
            vcq: VcQueueBank::new(cfg.num_vcs, cfg.vc_queue_max_bytes, cfg.additional_header_size),
            llr: cfg.enable_llr.then(LlrManager::new),
            main_queue: VecDeque::new(),
            processing_queue: VecDeque::new(),
            processing_bytes: 0,
            processing_max: cfg.processing_queue_max_bytes,
            is_processing: false,
            processing_stalled: false,
            tx_busy: false,
            try_transmit_scheduled: false,
            last_vc: 0,
            pending_credit_return: None,
            tx_frame_info: None,
            resend_timers: HashMap::new(),
            forwarding: None,
            sibling_macs: HashSet::new(),
            error_rate: cfg.error_rate,
            rng: StdRng::seed_from_u64(cfg.seed.wrapping_add(0x9E37_79B9 * u64::from(id.0 + 1))),
        }
    }

    /// Attach to the far end of the channel.
    pub fn connect(&mut self, peer_port: PortId, peer_mac: Mac48) {
        self.peer_port = peer_port;
        self.peer_mac = peer_mac;
    }

    // ─── Transmit path ──────────────────────────────────────────────────

    /// Request a `TryTransmit` pass after `delay`, collapsing duplicate
    /// requests into one pending event.
    pub fn schedule_try_transmit(&mut self, delay: Nanos, ctx: &mut Ctx) {
        if !self.try_transmit_scheduled {
            self.try_transmit_scheduled = true;
            ctx.queue.schedule(delay, Event::TryTransmit(self.id));
        }
    }

    pub fn on_try_transmit(&mut self, ctx: &mut Ctx) {
        self.try_transmit_scheduled = false;
        self.try_transmit(ctx);
    }

    fn try_transmit(&mut self, ctx: &mut Ctx) {
        if self.tx_busy {
            return;
        }

        // 1. Main queue wins arbitration: credit updates and ACK/NACK never
        //    wait behind data and bypass CBFC.
        if let Some(pkt) = self.main_queue.pop_front() {
            ctx.logger.main_queue(
                ctx.now(),
                self.node,
                self.local_index,
                self.main_queue.len() as u32,
                MAIN_QUEUE_MAX_FRAMES as u32,
            );
            self.transmit_start(pkt, ctx);
            return;
        }

        // 2. Pending LLR retransmissions.
        let resend = self.llr.as_mut().and_then(|llr| {
            while let Some((peer, vc)) = llr.find_resending() {
                if let Some(pkt) = llr.take_resend(peer, vc) {
                    return Some((peer, vc, pkt));
                }
            }
            None
        });
        if let Some((peer, vc, pkt)) = resend {
            debug!(port = %self.id, %peer, %vc, seq = ?pkt.tags.link_seq, "retransmitting");
            self.arm_resend_timer(peer, vc, ctx);
            self.transmit_start(pkt, ctx);
            return;
        }

        // 3. Weighted round-robin over the VC queues, starting one past the
        //    last-served channel.
        let n = self.vcq.num_vcs();
        for i in 0..n {
            let vc = Vc((self.last_vc + i) % n);
            if self.vcq.is_empty(vc) {
                continue;
            }
            if !self.cbfc.try_consume(self.peer_mac, vc) {
                continue;
            }
            if self.cbfc.is_enabled() {
                ctx.logger.credit_change(
                    ctx.now(),
                    self.node,
                    self.local_index,
                    vc,
                    Direction::Tx,
                    self.cbfc.tx_credits(self.peer_mac, vc),
                    self.peer_mac,
                );
            }
            let Some(pkt) = self.vcq.dequeue(vc) else {
                continue;
            };
            ctx.logger.vc_queue(
                ctx.now(),
                self.node,
                self.local_index,
                vc,
                self.vcq.bytes(vc),
                self.vcq.max_bytes(),
            );
            self.last_vc = (vc.0 + 1) % n;
            self.transmit_start(pkt, ctx);
            return;
        }
    }

    fn transmit_start(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        debug_assert!(!self.tx_busy, "must be READY to transmit");
        self.tx_busy = true;

        // XPU-originated frames carry a fresh send timestamp for the
        // end-to-end delay measurement.
        if self.kind == PortKind::Xpu {
            pkt.tags.sent_at = Some(ctx.now());
        }

        let len = pkt.len();
        let vc = wire_vc(&pkt);
        let is_data = matches!(
            pkt.peek_header::<PppHeader>(),
            Some(p) if p.protocol == ETH_P_IPV4
        );

        // A switch egress forwarding data credits the upstream hop only
        // once the frame has actually cleared this port.
        if self.kind.is_switch() && is_data {
            if let (Some(vc), Some(src)) = (vc, wire_src_mac(&pkt)) {
                self.pending_credit_return = Some((src, vc));
            }
        }
        self.tx_frame_info = Some((len, vc));

        let tx_time = self.link_rate.time_for_bytes(len);
        ctx.queue
            .schedule(tx_time + self.ifg, Event::TransmitComplete(self.id));
        ctx.queue.schedule(
            tx_time + self.link_delay,
            Event::FrameArrive(self.peer_port, pkt),
        );
    }

    pub fn transmit_complete(&mut self, ctx: &mut Ctx) {
        debug_assert!(self.tx_busy, "must be BUSY if transmitting");
        self.tx_busy = false;

        if let Some((len, vc)) = self.tx_frame_info.take() {
            ctx.logger
                .packet(ctx.now(), self.node, self.local_index, vc, Direction::Tx, len);
        }
        if let Some((target, vc)) = self.pending_credit_return.take() {
            self.cbfc.account_rx(target, vc);
            self.maybe_return(target, vc, ctx);
        }
        self.schedule_try_transmit(ctx.cfg.vc_scheduling_delay, ctx);
    }

    // ─── Credit return ──────────────────────────────────────────────────

    /// Build and schedule a credit-update frame if a full batch has
    /// accumulated for `peer` on `vc`.
    pub fn maybe_return(&mut self, peer: Mac48, vc: Vc, ctx: &mut Ctx) {
        if let Some(batch) = self.cbfc.take_batch(peer, vc) {
            let mut frame = Packet::empty();
            frame.add_header(&EthernetHeader::new(self.mac, peer));
            frame.add_header(&CbfcHeader::update(vc.0, batch));
            ctx.queue.schedule(
                ctx.cfg.credit_generate_delay,
                Event::SendCredit {
                    port: self.id,
                    frame,
                    target: peer,
                },
            );
        }
    }

    /// Route a generated credit-update frame: onto the wire via the main
    /// queue for the link peer, or straight into a sibling port's receive
    /// path for switch-internal accounting.
    pub fn send_credit_frame(&mut self, mut frame: Packet, target: Mac48, ctx: &mut Ctx) {
        if target == self.peer_mac {
            self.send(frame, PROT_CBFC_UPDATE, ctx);
        } else if let Some(&pid) = ctx.mac_to_port.get(&target) {
            frame.add_header(&PppHeader::new(PROT_CBFC_UPDATE));
            ctx.queue.schedule(Nanos::ZERO, Event::FrameArrive(pid, frame));
        } else {
            warn!(port = %self.id, %target, "credit target is not a known port");
        }
    }

    // ─── External enqueue ───────────────────────────────────────────────

    /// Upper-layer send. Control protocols go through the main queue; data
    /// is routed into the VC queues.
    pub fn send(&mut self, mut pkt: Packet, protocol: u16, ctx: &mut Ctx) -> bool {
        match protocol {
            PROT_CBFC_UPDATE => {
                pkt.add_header(&PppHeader::new(PROT_CBFC_UPDATE));
                self.push_main_queue(pkt, ctx.cfg.cre_update_add_head_delay, ctx)
            }
            ACK_REV | NACK_REV => {
                // Already fully wrapped by the LLR control builder.
                self.push_main_queue(pkt, ctx.cfg.data_add_head_delay, ctx)
            }
            _ => {
                if self.kind == PortKind::Xpu {
                    // Attach Ethernet from the process-wide IP to MAC map.
                    let Some(ip) = pkt.peek_header::<Ipv4Header>() else {
                        warn!(port = %self.id, "data send without an IPv4 header");
                        return false;
                    };
                    let dst_mac = ctx
                        .ip_to_mac
                        .get(&ip.dst)
                        .copied()
                        .unwrap_or(Mac48::BROADCAST);
                    pkt.add_header(&EthernetHeader::new(self.mac, dst_mac));
                }
                self.enqueue_to_vc(pkt, ctx)
            }
        }
    }

    fn push_main_queue(&mut self, pkt: Packet, head_delay: Nanos, ctx: &mut Ctx) -> bool {
        if self.main_queue.len() >= MAIN_QUEUE_MAX_FRAMES {
            ctx.logger.drop(
                ctx.now(),
                self.node,
                self.local_index,
                wire_vc(&pkt),
                DropReason::MainQueueFull,
                pkt.len(),
            );
            return false;
        }
        self.main_queue.push_back(pkt);
        ctx.logger.main_queue(
            ctx.now(),
            self.node,
            self.local_index,
            self.main_queue.len() as u32,
            MAIN_QUEUE_MAX_FRAMES as u32,
        );
        self.schedule_try_transmit(head_delay, ctx);
        true
    }

    /// Route a frame into the VC queues. External frames (front is
    /// Ethernet) get LLR numbering toward the wire peer and the CBFC/PPP
    /// wrap; switch-internal frames (front is PPP) are peeled, run through
    /// the internal link's LLR receive side, and re-wrapped downstream.
    pub fn enqueue_to_vc(&mut self, pkt: Packet, ctx: &mut Ctx) -> bool {
        if let Some(ppp) = pkt.peek_header::<PppHeader>() {
            return self.enqueue_internal(pkt, ppp.protocol, ctx);
        }
        let Some(sue) = sue_after_eth(&pkt) else {
            warn!(port = %self.id, len = pkt.len(), "cannot locate SUE header; frame dropped");
            return false;
        };
        debug_assert_eq!(sue.op, SUE_OP_DATA);
        self.wrap_and_enqueue(pkt, Vc(sue.vc), ctx)
    }

    fn enqueue_internal(&mut self, mut pkt: Packet, protocol: u16, ctx: &mut Ctx) -> bool {
        // Internal ACK/NACK routed across the switch fabric.
        if protocol == ACK_REV {
            ctx.queue
                .schedule(ctx.cfg.ack_process_delay, Event::ProcessAck(self.id, pkt));
            return true;
        }
        if protocol == NACK_REV {
            ctx.queue
                .schedule(ctx.cfg.ack_process_delay, Event::ProcessNack(self.id, pkt));
            return true;
        }

        // Data handed across the ingress→egress link: peel the internal
        // wrap and run this link's LLR receiver.
        pkt.remove_header::<PppHeader>();
        let Some(cbfc) = pkt.remove_header::<CbfcHeader>() else {
            return false;
        };
        let vc = Vc(cbfc.vc_id);
        let Some(eth) = pkt.peek_header::<EthernetHeader>() else {
            return false;
        };
        let src = eth.src;

        let now = ctx.now();
        let timeout = ctx.cfg.llr_timeout;
        let mut verdict = None;
        if let Some(llr) = self.llr.as_mut() {
            let Some(seq) = pkt.tags.link_seq else {
                warn!(port = %self.id, "internal frame without sequence tag");
                return false;
            };
            verdict = Some(llr.on_receive(src, vc, seq, now, timeout));
        }
        match verdict {
            Some(RxVerdict::Deliver { ack: Some(a) }) => {
                self.emit_llr_control(ACK_REV, vc, a, src, ctx);
            }
            Some(RxVerdict::Duplicate) => return true,
            Some(RxVerdict::Gap { nack_seq }) => {
                self.emit_llr_control(NACK_REV, vc, nack_seq, src, ctx);
                return true;
            }
            _ => {}
        }

        self.wrap_and_enqueue(pkt, vc, ctx)
    }

    /// LLR-number toward the wire peer, add the CBFC/PPP wrap, and enqueue.
    fn wrap_and_enqueue(&mut self, mut pkt: Packet, vc: Vc, ctx: &mut Ctx) -> bool {
        pkt.add_header(&CbfcHeader::data(vc.0));
        pkt.add_header(&PppHeader::new(ETH_P_IPV4));
        let peer = self.peer_mac;
        if let Some(llr) = self.llr.as_mut() {
            llr.register_send(peer, vc, &mut pkt);
        }
        if self.llr.is_some() {
            self.arm_resend_timer(peer, vc, ctx);
        }

        match self.vcq.enqueue(vc, pkt) {
            Ok(()) => {
                ctx.logger.vc_queue(
                    ctx.now(),
                    self.node,
                    self.local_index,
                    vc,
                    self.vcq.bytes(vc),
                    self.vcq.max_bytes(),
                );
                self.schedule_try_transmit(ctx.cfg.data_add_head_delay, ctx);
                true
            }
            Err(dropped) => {
                ctx.logger.drop(
                    ctx.now(),
                    self.node,
                    self.local_index,
                    Some(vc),
                    DropReason::VcQueueFull,
                    dropped.len(),
                );
                false
            }
        }
    }

    // ─── Receive path ───────────────────────────────────────────────────

    pub fn receive(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        if self.error_rate > 0.0 && self.rng.random::<f64>() < self.error_rate {
            ctx.logger.drop(
                ctx.now(),
                self.node,
                self.local_index,
                wire_vc(&pkt),
                DropReason::PhyRxDrop,
                pkt.len(),
            );
            return;
        }

        let Some(ppp) = pkt.peek_header::<PppHeader>() else {
            warn!(port = %self.id, len = pkt.len(), "unparseable frame discarded");
            return;
        };

        if self.llr.is_some() {
            if ppp.protocol == ACK_REV {
                ctx.queue
                    .schedule(ctx.cfg.ack_process_delay, Event::ProcessAck(self.id, pkt));
                return;
            }
            if ppp.protocol == NACK_REV {
                ctx.queue
                    .schedule(ctx.cfg.ack_process_delay, Event::ProcessNack(self.id, pkt));
                return;
            }
        }

        if ppp.protocol == PROT_CBFC_UPDATE {
            self.receive_credit_update(pkt, ctx);
            return;
        }

        // Data frame.
        let wire_len = pkt.len();
        pkt.remove_header::<PppHeader>();
        let Some(cbfc) = pkt.remove_header::<CbfcHeader>() else {
            return;
        };
        let vc = Vc(cbfc.vc_id);
        let Some(eth) = pkt.peek_header::<EthernetHeader>() else {
            return;
        };
        let src = eth.src;

        let now = ctx.now();
        let timeout = ctx.cfg.llr_timeout;
        let mut verdict = None;
        if let Some(llr) = self.llr.as_mut() {
            let Some(seq) = pkt.tags.link_seq else {
                warn!(port = %self.id, "data frame without sequence tag; cannot recover");
                return;
            };
            verdict = Some(llr.on_receive(src, vc, seq, now, timeout));
        }
        match verdict {
            Some(RxVerdict::Deliver { ack: Some(a) }) => {
                self.emit_llr_control(ACK_REV, vc, a, src, ctx);
            }
            Some(RxVerdict::Duplicate) => return,
            Some(RxVerdict::Gap { nack_seq }) => {
                self.emit_llr_control(NACK_REV, vc, nack_seq, src, ctx);
                return;
            }
            _ => {}
        }

        let size = pkt.len() as u32;
        if self.processing_bytes + size > self.processing_max {
            ctx.logger.drop(
                ctx.now(),
                self.node,
                self.local_index,
                Some(vc),
                DropReason::ProcessingQueueFull,
                wire_len,
            );
            return;
        }
        self.processing_queue.push_back(ProcessItem { pkt, vc, src });
        self.processing_bytes += size;
        ctx.logger.processing_queue(
            ctx.now(),
            self.node,
            self.local_index,
            self.processing_bytes,
            self.processing_max,
        );
        if !self.is_processing {
            self.is_processing = true;
            self.start_processing(ctx);
        }
    }

    fn receive_credit_update(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        let wire_len = pkt.len();
        pkt.remove_header::<PppHeader>();
        let Some(cbfc) = pkt.remove_header::<CbfcHeader>() else {
            return;
        };
        let Some(eth) = pkt.remove_header::<EthernetHeader>() else {
            return;
        };
        let vc = Vc(cbfc.vc_id);

        // Switch-internal credit hops are bookkeeping, not traffic.
        let internal = self.kind.is_switch() && self.sibling_macs.contains(&eth.src);
        if !internal {
            ctx.logger.packet(
                ctx.now(),
                self.node,
                self.local_index,
                Some(vc),
                Direction::Rx,
                wire_len,
            );
        }

        if cbfc.credits > 0 {
            match self.cbfc.grant(eth.src, vc, u32::from(cbfc.credits)) {
                Ok(balance) => {
                    ctx.logger.credit_change(
                        ctx.now(),
                        self.node,
                        self.local_index,
                        vc,
                        Direction::Rx,
                        balance,
                        eth.src,
                    );
                }
                Err(e) => {
                    error!(port = %self.id, error = %e, "credit accounting is broken");
                }
            }
            self.schedule_try_transmit(Nanos::ZERO, ctx);
            // A stalled switch pipeline may have been waiting on exactly
            // this grant.
            if self.processing_stalled {
                self.processing_stalled = false;
                self.start_processing(ctx);
            }
        }
    }

    // ─── Processing queue ───────────────────────────────────────────────

    pub(crate) fn start_processing(&mut self, ctx: &mut Ctx) {
        match self.processing_queue.front() {
            None => {
                self.is_processing = false;
            }
            Some(item) => {
                let t = self.processing_rate.time_for_bytes(item.pkt.len());
                ctx.queue.schedule(t, Event::CompleteProcessing(self.id));
            }
        }
    }

    pub fn complete_processing(&mut self, ctx: &mut Ctx) {
        if self.kind.is_switch() {
            self.complete_processing_switch(ctx);
            return;
        }

        let Some(mut item) = self.processing_queue.pop_front() else {
            self.is_processing = false;
            return;
        };
        self.processing_bytes -= item.pkt.len() as u32;
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
            Some(item.vc),
            Direction::Rx,
            item.pkt.len(),
        );

        // Strip Ethernet and hand the residual IPv4+UDP+SUE payload up.
        let Some(eth) = item.pkt.remove_header::<EthernetHeader>() else {
            self.start_processing(ctx);
            return;
        };
        ctx.queue
            .schedule(Nanos::ZERO, Event::DeliverUp(self.id, item.pkt));

        self.cbfc.account_rx(eth.src, item.vc);
        self.maybe_return(eth.src, item.vc, ctx);
        self.start_processing(ctx);
    }

    // ─── LLR control plumbing ───────────────────────────────────────────

    /// Build an ACK/NACK frame and route it: through the local main queue
    /// for the wire peer, or across the switch fabric for an internal peer.
    pub(crate) fn emit_llr_control(
        &mut self,
        protocol: u16,
        vc: Vc,
        seq: u32,
        target: Mac48,
        ctx: &mut Ctx,
    ) {
        debug_assert!(ether_to_ppp(protocol).is_some());
        let mut pkt = Packet::empty();
        pkt.add_header(&EthernetHeader::new(self.mac, target));
        pkt.add_header(&CbfcHeader::data(vc.0));
        pkt.add_header(&PppHeader::new(protocol));
        pkt.tags.link_seq = Some(seq);

        if target == self.peer_mac {
            ctx.queue.schedule(
                ctx.cfg.ack_add_header_delay,
                Event::SendControl {
                    port: self.id,
                    frame: pkt,
                    protocol,
                },
            );
        } else if let Some(&pid) = ctx.mac_to_port.get(&target) {
            ctx.queue.schedule(
                ctx.cfg.switch_forward_delay + ctx.cfg.ack_add_header_delay,
                Event::EnqueueToVc(pid, pkt),
            );
        }
    }

    pub fn process_llr_ack(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        pkt.remove_header::<PppHeader>();
        let (Some(cbfc), Some(eth)) = (
            pkt.remove_header::<CbfcHeader>(),
            pkt.remove_header::<EthernetHeader>(),
        ) else {
            return;
        };
        let Some(seq) = pkt.tags.link_seq else {
            return;
        };
        let vc = Vc(cbfc.vc_id);
        let Some(llr) = self.llr.as_mut() else {
            return;
        };
        if llr.on_ack(eth.src, vc, seq) == sue_transport::AckAction::Accepted {
            if llr.send_list_len(eth.src, vc) == 0 {
                // Everything retained is covered: stand down.
                if let Some(h) = self.resend_timers.remove(&(eth.src, vc)) {
                    ctx.queue.cancel(h);
                }
            } else {
                // Unacknowledged tail remains; keep the timer live so a
                // lost final frame is still recovered.
                self.arm_resend_timer(eth.src, vc, ctx);
            }
        }
    }

    pub fn process_llr_nack(&mut self, mut pkt: Packet, ctx: &mut Ctx) {
        pkt.remove_header::<PppHeader>();
        let (Some(cbfc), Some(eth)) = (
            pkt.remove_header::<CbfcHeader>(),
            pkt.remove_header::<EthernetHeader>(),
        ) else {
            return;
        };
        let Some(seq) = pkt.tags.link_seq else {
            return;
        };
        let vc = Vc(cbfc.vc_id);
        let src = eth.src;
        let Some(llr) = self.llr.as_mut() else {
            return;
        };
        if llr.on_nack(src, vc, seq) != sue_transport::NackAction::Resend {
            return;
        }

        if self.is_internal_peer(src) {
            // Ingress side of a switch: push the rewound frame back across
            // the handoff immediately.
            let resent = self.llr.as_mut().and_then(|l| l.take_resend(src, vc));
            if let Some(p) = resent {
                if let Some(&egress) = ctx.mac_to_port.get(&src) {
                    ctx.queue
                        .schedule(ctx.cfg.switch_forward_delay, Event::EnqueueToVc(egress, p));
                }
            }
        } else {
            // Retransmission becomes eligible in this port's own TX path.
            self.schedule_try_transmit(Nanos::ZERO, ctx);
        }
        self.arm_resend_timer(src, vc, ctx);
    }

    pub fn llr_resend_timer(&mut self, peer: Mac48, vc: Vc, ctx: &mut Ctx) {
        self.resend_timers.remove(&(peer, vc));
        let Some(llr) = self.llr.as_mut() else {
            return;
        };
        if !llr.on_timer(peer, vc) {
            return;
        }
        debug!(port = %self.id, %peer, %vc, "retransmit timer fired");

        if self.is_internal_peer(peer) {
            let resent = self.llr.as_mut().and_then(|l| l.take_resend(peer, vc));
            if let Some(pkt) = resent {
                if let Some(&egress) = ctx.mac_to_port.get(&peer) {
                    ctx.queue
                        .schedule(ctx.cfg.switch_forward_delay, Event::EnqueueToVc(egress, pkt));
                }
                self.arm_resend_timer(peer, vc, ctx);
            }
            // Rerun ingress processing if the pipeline was parked.
            if self.processing_stalled {
                self.processing_stalled = false;
                self.start_processing(ctx);
            }
        } else {
            self.schedule_try_transmit(Nanos::ZERO, ctx);
        }
    }

    pub(crate) fn arm_resend_timer(&mut self, peer: Mac48, vc: Vc, ctx: &mut Ctx) {
        if self.llr.is_none() {
            return;
        }
        if let Some(h) = self.resend_timers.remove(&(peer, vc)) {
            ctx.queue.cancel(h);
        }
        let h = ctx.queue.schedule(
            ctx.cfg.llr_timeout,
            Event::LlrResend {
                port: self.id,
                peer,
                vc,
            },
        );
        self.resend_timers.insert((peer, vc), h);
    }

    /// Whether `mac` is a sibling port on the same switch (an LLR peer
    /// across the internal handoff rather than the wire).
    fn is_internal_peer(&self, mac: Mac48) -> bool {
        self.kind.is_switch() && self.sibling_macs.contains(&mac)
    }
}
