//! SUE client: destination queues, burst packing, and port selection.
//!
//! Each SUE engine owns a group of physical ports and a bank of bounded
//! per-(destination XPU, VC) transaction queues. A periodic scheduler picks
//! the queue whose head has waited longest, packs consecutive transactions
//! into bursts capped at `maxBurstSize`, and assigns each burst to the
//! first owned port that can reserve VC capacity for it. Transactions are
//! only popped once their burst has actually entered the link layer, so a
//! burst no port can take simply stays at the front of its queue.

use crate::balancer::Destination;
use crate::host::Host;
use crate::logging::DropReason;
use crate::port::Port;
use crate::world::{Ctx, Event};
use std::collections::{BTreeMap, VecDeque};
use std::net::Ipv4Addr;
use sue_common::{Nanos, NodeId, PortId, SueId, Vc, XpuId};
use sue_transport::{Ipv4Header, Packet, SueHeader, UdpHeader, WireHeader, ETH_P_IPV4};
use tracing::{debug, warn};

/// Upper bound on transactions examined per scheduling cycle.
const MAX_TRANSACTIONS_PER_CYCLE: usize = 50;

struct QueueState {
    fifo: VecDeque<(Nanos, Packet)>,
    bytes: u32,
    /// Leading transactions already packed into scheduled bursts. They
    /// remain in the queue (popped only on successful send) but must not
    /// be packed twice.
    in_flight: usize,
}

impl QueueState {
    fn new() -> Self {
        QueueState {
            fifo: VecDeque::new(),
            bytes: 0,
            in_flight: 0,
        }
    }
}

pub struct SueClient {
    pub xpu: XpuId,
    pub id: SueId,
    /// Owned physical ports, in round-robin order.
    pub ports: Vec<PortId>,
    dest_queues: BTreeMap<Destination, QueueState>,
    max_bytes: u32,
    max_burst: u32,
    last_port_idx: usize,
    psn: u16,
    pub logging_enabled: bool,
    pub scheduler_running: bool,
    pub packets_sent: u64,
    /// Application payload bytes that left this SUE.
    pub bytes_sent: u64,
    pub per_vc_bytes: [u64; 4],
    pack_delays: Vec<u64>,
    pack_counts: Vec<usize>,
}

impl SueClient {
    pub fn new(cfg: &crate::config::Params, xpu: XpuId, id: SueId, ports: Vec<PortId>) -> Self {
        SueClient {
            xpu,
            id,
            ports,
            dest_queues: BTreeMap::new(),
            max_bytes: cfg.dest_queue_max_bytes,
            max_burst: cfg.max_burst_size,
            last_port_idx: 0,
            psn: 0,
            logging_enabled: cfg.stat_logging_enabled,
            scheduler_running: false,
            packets_sent: 0,
            bytes_sent: 0,
            per_vc_bytes: [0; 4],
            pack_delays: Vec::new(),
            pack_counts: Vec::new(),
        }
    }

    /// Whether a transaction of `size` bytes fits the (dest, VC) queue.
    pub fn can_accept(&self, dest: Destination, size: u32) -> bool {
        let used = self.dest_queues.get(&dest).map(|q| q.bytes).unwrap_or(0);
        used + size <= self.max_bytes
    }

    /// Admit one transaction. The load balancer checks capacity first;
    /// an oversized arrival here is dropped and reported.
    pub fn add_transaction(&mut self, now: Nanos, pkt: Packet, dest: Destination, ctx: &mut Ctx) {
        let size = pkt.len() as u32;
        let q = self.dest_queues.entry(dest).or_insert_with(QueueState::new);
        if q.bytes + size > self.max_bytes {
            ctx.logger.drop(
                now,
                NodeId(self.xpu.0),
                0,
                Some(dest.vc),
                DropReason::DestQueueFull,
                size as usize,
            );
            warn!(
                xpu = self.xpu.0,
                sue = self.id.0,
                dest = dest.xpu.0,
                vc = dest.vc.0,
                "destination queue full; transaction dropped"
            );
            return;
        }
        q.fifo.push_back((now, pkt));
        q.bytes += size;
        ctx.logger.destination_queue(
            now,
            self.xpu,
            self.id,
            dest.xpu,
            dest.vc,
            q.bytes,
            self.max_bytes,
        );
    }

    /// Oldest-waiting-first: the non-empty queue whose unpacked head was
    /// enqueued earliest.
    pub fn select_oldest(&self) -> Option<Destination> {
        self.dest_queues
            .iter()
            .filter_map(|(dest, q)| {
                q.fifo
                    .get(q.in_flight)
                    .map(|(enqueued, _)| (*enqueued, *dest))
            })
            .min_by_key(|(enqueued, _)| *enqueued)
            .map(|(_, dest)| dest)
    }

    /// Pack up to one cycle's worth of pending transactions from `dest`
    /// into bursts. Transactions are peeked, not popped; each burst carries
    /// the count it will pop on successful send.
    pub fn pack(&mut self, dest: Destination, now: Nanos) -> Vec<(Packet, u32)> {
        let Some(q) = self.dest_queues.get(&dest) else {
            return Vec::new();
        };
        let pending: Vec<Packet> = q
            .fifo
            .iter()
            .skip(q.in_flight)
            .take(MAX_TRANSACTIONS_PER_CYCLE)
            .map(|(_, pkt)| pkt.clone())
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }
        let first_wait = q
            .fifo
            .get(q.in_flight)
            .map(|(enqueued, _)| now.saturating_sub(*enqueued))
            .unwrap_or(Nanos::ZERO);

        let mut bursts = Vec::new();
        let mut batch = Packet::empty();
        let mut batch_bytes = 0u32;
        let mut batch_count = 0u32;
        for txn in pending {
            let size = txn.len() as u32;
            if batch_bytes + size > self.max_burst && batch_count > 0 {
                bursts.push(self.finish_burst(batch, batch_count, dest));
                batch = Packet::empty();
                batch_bytes = 0;
                batch_count = 0;
            }
            // Inner SUE headers are stripped; only payloads concatenate.
            let mut payload = txn.clone();
            payload.remove_header::<SueHeader>();
            batch.append(&payload);
            batch_bytes += size;
            batch_count += 1;
        }
        if batch_count > 0 {
            bursts.push(self.finish_burst(batch, batch_count, dest));
        }

        if self.logging_enabled {
            self.pack_delays.push(first_wait.as_nanos());
            self.pack_counts.push(bursts.len());
        }
        debug!(
            xpu = self.xpu.0,
            sue = self.id.0,
            dest = dest.xpu.0,
            vc = dest.vc.0,
            bursts = bursts.len(),
            "packed pending transactions"
        );
        bursts
    }

    fn finish_burst(&mut self, mut burst: Packet, count: u32, dest: Destination) -> (Packet, u32) {
        burst.add_header(&SueHeader::data(self.psn, dest.xpu.0 as u16, dest.vc.0));
        self.psn = self.psn.wrapping_add(1);
        (burst, count)
    }

    /// Mark `count` leading transactions as committed to a scheduled burst.
    pub fn commit(&mut self, dest: Destination, count: u32) {
        if let Some(q) = self.dest_queues.get_mut(&dest) {
            q.in_flight += count as usize;
        }
    }

    /// A scheduled burst failed to send; its transactions stay queued.
    pub fn uncommit(&mut self, dest: Destination, count: u32) {
        if let Some(q) = self.dest_queues.get_mut(&dest) {
            q.in_flight = q.in_flight.saturating_sub(count as usize);
        }
    }

    /// Remove `count` transactions from the front of the queue after a
    /// successful send. Returns how many were actually popped.
    pub fn pop_transactions(&mut self, dest: Destination, count: u32, ctx: &mut Ctx) -> u32 {
        let Some(q) = self.dest_queues.get_mut(&dest) else {
            return 0;
        };
        let mut popped = 0;
        while popped < count {
            let Some((_, pkt)) = q.fifo.pop_front() else {
                break;
            };
            q.bytes -= pkt.len() as u32;
            popped += 1;
        }
        q.in_flight = q.in_flight.saturating_sub(popped as usize);
        ctx.logger.destination_queue(
            ctx.now(),
            self.xpu,
            self.id,
            dest.xpu,
            dest.vc,
            q.bytes,
            self.max_bytes,
        );
        popped
    }

    pub fn has_pending(&self) -> bool {
        self.dest_queues.values().any(|q| !q.fifo.is_empty())
    }

    pub fn pending_transactions(&self) -> usize {
        self.dest_queues.values().map(|q| q.fifo.len()).sum()
    }

    /// Drain buffered packing statistics for the periodic flush.
    pub fn take_pack_stats(&mut self) -> (Vec<u64>, Vec<usize>) {
        (
            std::mem::take(&mut self.pack_delays),
            std::mem::take(&mut self.pack_counts),
        )
    }
}

// ─── Scheduler entry points ─────────────────────────────────────────────────

/// One scheduling-interval tick of a SUE engine.
pub fn sue_schedule(
    hosts: &mut [Host],
    ports: &mut [Port],
    xpu: XpuId,
    sue: SueId,
    ctx: &mut Ctx,
) {
    let host = &mut hosts[xpu.index()];
    let drained = host.traffic.complete
        && host.balancer.buffer.is_empty()
        && host.sues.iter().all(|s| !s.has_pending());
    if drained {
        host.sues[sue.index()].scheduler_running = false;
        return;
    }
    ctx.queue
        .schedule(ctx.cfg.scheduling_interval, Event::SueSchedule { xpu, sue });

    let client = &mut host.sues[sue.index()];
    let Some(dest) = client.select_oldest() else {
        return;
    };
    let now = ctx.now();
    let bursts = client.pack(dest, now);

    let mut k = 1u64;
    for (frame, count) in bursts {
        let vc = dest.vc;
        let size = frame.len() as u32;

        // Round-robin port probe, first successful reservation wins.
        let n = client.ports.len();
        let mut chosen = None;
        for i in 0..n {
            let idx = (client.last_port_idx + i) % n;
            let pid = client.ports[idx];
            if ports[pid.index()].vcq.reserve(vc, size) {
                client.last_port_idx = (idx + 1) % n;
                chosen = Some(pid);
                break;
            }
        }
        let Some(pid) = chosen else {
            // No port can take this burst; it and everything behind it
            // stay queued for the next cycle.
            debug!(
                xpu = xpu.0,
                sue = sue.0,
                vc = vc.0,
                size,
                "no port has VC capacity; deferring burst"
            );
            break;
        };

        client.commit(dest, count);
        ctx.queue.schedule(
            Nanos(ctx.cfg.packing_delay_per_packet.as_nanos() * k),
            Event::SueSendBurst {
                xpu,
                sue,
                dest,
                frame,
                port: pid,
                transactions: count,
            },
        );
        k += 1;
    }
}

/// A packed burst leaves the SUE: attach UDP/IPv4 addressing, hand it to
/// the selected port, and on success pop the covered transactions and
/// release the VC reservation.
#[allow(clippy::too_many_arguments)]
pub fn sue_send_burst(
    hosts: &mut [Host],
    ports: &mut [Port],
    xpu: XpuId,
    sue: SueId,
    dest: Destination,
    frame: Packet,
    port: PortId,
    transactions: u32,
    ctx: &mut Ctx,
) {
    let (local_idx, src_ip) = {
        let p = &ports[port.index()];
        (p.local_index, p.ip)
    };
    let dst_ip = Ipv4Addr::new(10, (dest.xpu.0 + 1) as u8, (local_idx + 1) as u8, 1);
    let dst_port = 8080 + local_idx as u16;

    let vc = dest.vc;
    let burst_size = frame.len() as u32;
    let mut pkt = frame;
    let udp_payload = pkt.len();
    pkt.add_header(&UdpHeader::new(49152 + local_idx as u16, dst_port, udp_payload));
    pkt.add_header(&Ipv4Header::new(src_ip, dst_ip, udp_payload + UdpHeader::SIZE));

    let sent = ports[port.index()].send(pkt, ETH_P_IPV4, ctx);
    // The reservation is matched whether or not the send took.
    ports[port.index()].vcq.release(vc, burst_size);

    let host = &mut hosts[xpu.index()];
    {
        let client = &mut host.sues[sue.index()];
        if !sent {
            client.uncommit(dest, transactions);
            return;
        }
        client.packets_sent += 1;
        let payload = u64::from(burst_size) - SueHeader::SIZE as u64;
        client.bytes_sent += payload;
        client.per_vc_bytes[vc.index()] += payload;
        client.pop_transactions(dest, transactions, ctx);
    }
    // Freed destination-queue space may unblock buffered transactions.
    host.notify_space_available(ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SueSimConfig;
    use crate::logging::PerfLogger;
    use sue_common::EventQueue;
    use std::collections::HashMap;

    type Maps = (
        HashMap<Ipv4Addr, sue_transport::Mac48>,
        HashMap<sue_transport::Mac48, PortId>,
    );

    fn params() -> crate::config::Params {
        SueSimConfig::default().resolve().unwrap()
    }

    fn empty_maps() -> Maps {
        Default::default()
    }

    fn test_ctx<'a>(
        cfg: &'a crate::config::Params,
        queue: &'a mut EventQueue<Event>,
        logger: &'a mut PerfLogger,
        maps: &'a Maps,
    ) -> Ctx<'a> {
        Ctx {
            cfg,
            queue,
            logger,
            ip_to_mac: &maps.0,
            mac_to_port: &maps.1,
        }
    }

    fn transaction(psn: u16, dest: XpuId, vc: Vc, size: u32) -> Packet {
        let mut p = Packet::new(size as usize);
        p.add_header(&SueHeader::data(psn, dest.0 as u16, vc.0));
        p
    }

    #[test]
    fn oldest_waiting_queue_wins() {
        let cfg = params();
        let mut q = EventQueue::new();
        let mut logger = PerfLogger::disabled();
        let maps = empty_maps();
        let mut ctx = test_ctx(&cfg, &mut q, &mut logger, &maps);

        let mut client = SueClient::new(&cfg, XpuId(0), SueId(0), vec![PortId(0)]);
        let a = Destination { xpu: XpuId(1), vc: Vc(0) };
        let b = Destination { xpu: XpuId(2), vc: Vc(0) };

        for i in 0..10 {
            client.add_transaction(Nanos(0), transaction(i, a.xpu, a.vc, 256), a, &mut ctx);
        }
        client.add_transaction(Nanos(1), transaction(10, b.xpu, b.vc, 256), b, &mut ctx);

        // A's head has waited longer than B's.
        assert_eq!(client.select_oldest(), Some(a));
    }

    #[test]
    fn packing_respects_max_burst_size() {
        let cfg = params(); // 2048-byte bursts, 256-byte transactions
        let mut q = EventQueue::new();
        let mut logger = PerfLogger::disabled();
        let maps = empty_maps();
        let mut ctx = test_ctx(&cfg, &mut q, &mut logger, &maps);

        let mut client = SueClient::new(&cfg, XpuId(0), SueId(0), vec![PortId(0)]);
        let d = Destination { xpu: XpuId(1), vc: Vc(1) };
        // 20 transactions of 256+8 bytes: 7 fit per 2048-byte burst.
        for i in 0..20 {
            client.add_transaction(Nanos(0), transaction(i, d.xpu, d.vc, 256), d, &mut ctx);
        }

        let bursts = client.pack(d, Nanos(100));
        assert_eq!(bursts.len(), 3);
        assert_eq!(bursts[0].1, 7);
        assert_eq!(bursts[1].1, 7);
        assert_eq!(bursts[2].1, 6);
        // 7 payloads of 256 bytes plus one fresh SUE header.
        assert_eq!(bursts[0].0.len(), 7 * 256 + SueHeader::SIZE);
        // Each burst carries the destination and VC.
        let sue = bursts[1].0.peek_header::<SueHeader>().unwrap();
        assert_eq!(sue.xpu_id, 1);
        assert_eq!(sue.vc, 1);
        // Nothing was popped.
        assert_eq!(client.pending_transactions(), 20);
    }

    #[test]
    fn committed_transactions_are_not_packed_twice() {
        let cfg = params();
        let mut q = EventQueue::new();
        let mut logger = PerfLogger::disabled();
        let maps = empty_maps();
        let mut ctx = test_ctx(&cfg, &mut q, &mut logger, &maps);

        let mut client = SueClient::new(&cfg, XpuId(0), SueId(0), vec![PortId(0)]);
        let d = Destination { xpu: XpuId(1), vc: Vc(0) };
        for i in 0..4 {
            client.add_transaction(Nanos(0), transaction(i, d.xpu, d.vc, 256), d, &mut ctx);
        }

        let first = client.pack(d, Nanos(10));
        assert_eq!(first.len(), 1);
        client.commit(d, first[0].1);

        // Everything is in flight; there is nothing left to pack or select.
        assert!(client.pack(d, Nanos(20)).is_empty());
        assert_eq!(client.select_oldest(), None);

        // Popping on send success releases the in-flight window.
        client.pop_transactions(d, first[0].1, &mut ctx);
        assert_eq!(client.pending_transactions(), 0);
    }

    #[test]
    fn full_destination_queue_drops_defensively() {
        let raw = SueSimConfig {
            dest_queue_max_mb: 0.0006, // 629 bytes: room for two 264-byte transactions
            ..Default::default()
        };
        let cfg = raw.resolve().unwrap();
        let mut q = EventQueue::new();
        let mut logger = PerfLogger::disabled();
        let maps = empty_maps();
        let mut ctx = test_ctx(&cfg, &mut q, &mut logger, &maps);

        let mut client = SueClient::new(&cfg, XpuId(0), SueId(0), vec![PortId(0)]);
        let d = Destination { xpu: XpuId(1), vc: Vc(0) };
        client.add_transaction(Nanos(0), transaction(0, d.xpu, d.vc, 256), d, &mut ctx);
        client.add_transaction(Nanos(0), transaction(1, d.xpu, d.vc, 256), d, &mut ctx);
        assert!(!client.can_accept(d, 264));
        client.add_transaction(Nanos(0), transaction(2, d.xpu, d.vc, 256), d, &mut ctx);
        assert_eq!(client.pending_transactions(), 2);
        assert_eq!(
            ctx.logger.drop_count(crate::logging::DropReason::DestQueueFull),
            1
        );
    }
}
